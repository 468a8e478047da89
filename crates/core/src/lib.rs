//! Control core of a single-valve irrigation controller.
//!
//! Everything here is synchronous and owned by one loop. Hardware, time and
//! persistence come in through the traits in [`clock`], [`store`],
//! [`valve`] and [`battery`]; the device binary supplies the real ones.

pub mod battery;
pub mod clock;
pub mod controller;
pub mod events;
pub mod flow;
pub mod safety;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod telemetry;
pub mod valve;

pub use controller::{Controller, ControllerOptions, Hardware, TickOutput};
