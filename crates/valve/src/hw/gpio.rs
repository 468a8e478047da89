//! Relay output and flow sensor input on Raspberry Pi GPIO via rppal.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};

use irrigation_core::flow::PulseCounter;
use irrigation_core::valve::{ValveOutput, ValveState};

/// Output level that puts the relay in `state`.
fn relay_level(state: ValveState, active_low: bool) -> Level {
    match (state, active_low) {
        // active-low relay: LOW = energised, HIGH = released
        (ValveState::Open, true) | (ValveState::Closed, false) => Level::Low,
        (ValveState::Closed, true) | (ValveState::Open, false) => Level::High,
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

pub struct RelayOutput {
    pin: OutputPin,
    active_low: bool,
}

impl RelayOutput {
    pub fn new(gpio: &Gpio, pin_num: u8, active_low: bool) -> Result<Self> {
        let pin = gpio
            .get(pin_num)
            .with_context(|| format!("relay gpio {pin_num} unavailable"))?;

        // Fail-safe: the line reaches the closed level before it becomes an
        // output, so the relay never sees a pulse at startup.
        let pin = match relay_level(ValveState::Closed, active_low) {
            Level::High => pin.into_output_high(),
            Level::Low => pin.into_output_low(),
        };

        tracing::info!(gpio = pin_num, active_low, "relay output ready");
        Ok(Self { pin, active_low })
    }
}

impl ValveOutput for RelayOutput {
    fn init_closed(&mut self) {
        self.pin.write(relay_level(ValveState::Closed, self.active_low));
    }

    fn drive(&mut self, state: ValveState) {
        self.pin.write(relay_level(state, self.active_low));
    }
}

// ---------------------------------------------------------------------------
// Flow sensor
// ---------------------------------------------------------------------------

/// Falling-edge interrupt on the flow sensor line. Dropping it disarms the
/// interrupt.
pub struct FlowInput {
    _pin: InputPin,
}

impl FlowInput {
    pub fn new(gpio: &Gpio, pin_num: u8, pulses: Arc<PulseCounter>, epoch: Instant) -> Result<Self> {
        let mut pin = gpio
            .get(pin_num)
            .with_context(|| format!("flow gpio {pin_num} unavailable"))?
            .into_input_pullup();

        pin.set_async_interrupt(Trigger::FallingEdge, move |_level| {
            pulses.on_pulse_edge(epoch.elapsed().as_micros() as u64);
        })
        .with_context(|| format!("flow gpio {pin_num}: interrupt setup failed"))?;

        tracing::info!(gpio = pin_num, "flow input armed");
        Ok(Self { _pin: pin })
    }
}
