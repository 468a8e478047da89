//! Hardware backends. The `gpio` feature drives a Raspberry Pi (relay and
//! flow sensor on GPIO, battery divider on an ADS1115); without it the
//! device runs against simulated hardware.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use irrigation_core::battery::BatterySensor;
use irrigation_core::flow::PulseCounter;
use irrigation_core::valve::ValveOutput;

use crate::config::HardwareConfig;

#[cfg(not(any(feature = "gpio", feature = "sim")))]
compile_error!("enable either the `gpio` or the `sim` feature");

#[cfg(feature = "gpio")]
mod adc;
#[cfg(feature = "gpio")]
mod gpio;
#[cfg(all(feature = "sim", not(feature = "gpio")))]
pub mod sim;

#[cfg(feature = "gpio")]
type FlowSource = gpio::FlowInput;
#[cfg(all(feature = "sim", not(feature = "gpio")))]
type FlowSource = sim::FlowThread;

pub struct Devices {
    pub output: Box<dyn ValveOutput + Send>,
    pub battery: Box<dyn BatterySensor + Send>,
    /// Feeds the pulse counter for as long as it is alive.
    pub flow: FlowSource,
}

/// Open the relay, flow input and battery ADC.
///
/// Pulse edges are timestamped against `epoch`, which must be the start of
/// the controller's monotonic clock.
#[cfg(feature = "gpio")]
pub fn open(cfg: &HardwareConfig, pulses: Arc<PulseCounter>, epoch: Instant) -> Result<Devices> {
    let gpio = rppal::gpio::Gpio::new()?;
    let output = gpio::RelayOutput::new(&gpio, cfg.relay_pin, cfg.relay_active_low)?;
    let flow = gpio::FlowInput::new(&gpio, cfg.flow_pin, pulses, epoch)?;
    let battery = adc::Ads1115::new(cfg.adc_addr, cfg.battery_channel)?;
    Ok(Devices {
        output: Box::new(output),
        battery: Box::new(battery),
        flow,
    })
}

#[cfg(all(feature = "sim", not(feature = "gpio")))]
pub fn open(cfg: &HardwareConfig, pulses: Arc<PulseCounter>, epoch: Instant) -> Result<Devices> {
    let scenario = std::env::var("SIM_SCENARIO")
        .map(|s| sim::Scenario::from_str_lossy(&s))
        .unwrap_or(sim::Scenario::Normal);
    tracing::info!(
        %scenario,
        relay_pin = cfg.relay_pin,
        flow_pin = cfg.flow_pin,
        "simulated hardware (pins not wired)"
    );

    let relay = sim::SimRelay::new();
    let flow = sim::FlowThread::spawn(
        sim::FlowSim::new(scenario),
        relay.handle(),
        pulses,
        epoch,
    )?;
    Ok(Devices {
        output: Box::new(relay),
        battery: Box::new(sim::SimBattery::new()),
        flow,
    })
}
