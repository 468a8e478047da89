//! Simulated valve hardware for local development.
//!
//! - Relay: remembers its state and logs every drive
//! - Flow: pulse train that follows the relay, with spin-up and run-down
//! - Battery: slowly discharging cell behind the default divider

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use irrigation_core::battery::BatterySensor;
use irrigation_core::flow::{PulseCounter, DEFAULT_PULSES_PER_LITER};
use irrigation_core::valve::{ValveOutput, ValveState};

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Clean line: about 6 L/min while open, dry when closed.
    Normal,
    /// The seat does not close fully; a drip keeps flowing with the valve
    /// closed, enough to raise the leak alarm.
    Leaky,
    /// Noisy sensor: wide rate jitter and contact bounce on the pulse line.
    Noisy,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "leaky" => Self::Leaky,
            "noisy" => Self::Noisy,
            _ => Self::Normal,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Leaky => write!(f, "leaky"),
            Self::Noisy => write!(f, "noisy"),
        }
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

pub struct SimRelay {
    open: Arc<AtomicBool>,
}

impl SimRelay {
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared view of the relay contact, read by the flow generator.
    pub fn handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.open)
    }
}

impl ValveOutput for SimRelay {
    fn init_closed(&mut self) {
        self.open.store(false, Ordering::Release);
    }

    fn drive(&mut self, state: ValveState) {
        self.open.store(state == ValveState::Open, Ordering::Release);
        tracing::info!(%state, "[sim] relay driven");
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

const OPEN_LPM: f64 = 6.0;
const DRIP_LPM: f64 = 0.8;
/// Time constant of the stream reacting to the valve.
const RAMP_S: f64 = 0.5;
const STEP: Duration = Duration::from_millis(20);
/// Contact bounce lands well inside the debounce window.
const BOUNCE_US: u64 = 40;

/// Pulse generator state.
pub struct FlowSim {
    scenario: Scenario,
    pulses_per_liter: f64,
    rate_lpm: f64,
    carry: f64,
}

impl FlowSim {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            pulses_per_liter: f64::from(DEFAULT_PULSES_PER_LITER),
            rate_lpm: 0.0,
            carry: 0.0,
        }
    }

    fn target_lpm(&self, open: bool) -> f64 {
        match (open, self.scenario) {
            (true, _) => OPEN_LPM,
            (false, Scenario::Leaky) => DRIP_LPM,
            (false, _) => 0.0,
        }
    }

    /// Advance by `dt_s` seconds and return the whole pulses produced.
    pub fn step(&mut self, open: bool, dt_s: f64) -> u32 {
        let target = self.target_lpm(open);
        self.rate_lpm += (target - self.rate_lpm) * (dt_s / RAMP_S).min(1.0);
        if (target - self.rate_lpm).abs() < 0.01 {
            self.rate_lpm = target;
        }

        let jitter = match self.scenario {
            Scenario::Noisy => 0.15,
            _ => 0.03,
        };
        let lpm = gaussian(self.rate_lpm, jitter * self.rate_lpm).max(0.0);

        let pulses = lpm / 60.0 * self.pulses_per_liter * dt_s + self.carry;
        let whole = pulses.floor();
        self.carry = pulses - whole;
        whole as u32
    }

    fn bounces(&self) -> bool {
        self.scenario == Scenario::Noisy && fastrand::f32() < 0.2
    }
}

/// Background thread feeding simulated edges into the pulse counter. Stops
/// when dropped.
pub struct FlowThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FlowThread {
    pub fn spawn(
        mut sim: FlowSim,
        relay_open: Arc<AtomicBool>,
        pulses: Arc<PulseCounter>,
        epoch: Instant,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("sim-flow".into())
            .spawn(move || {
                let mut last_us = epoch.elapsed().as_micros() as u64;
                while !stop_flag.load(Ordering::Acquire) {
                    thread::sleep(STEP);
                    let now_us = epoch.elapsed().as_micros() as u64;
                    let dt_us = now_us.saturating_sub(last_us).max(1);

                    let n = sim.step(relay_open.load(Ordering::Acquire), dt_us as f64 / 1e6);
                    let spacing = dt_us / (u64::from(n) + 1);
                    for i in 1..=u64::from(n) {
                        let at = last_us + i * spacing;
                        pulses.on_pulse_edge(at);
                        if sim.bounces() {
                            pulses.on_pulse_edge(at + BOUNCE_US);
                        }
                    }
                    last_us = now_us;
                }
            })
            .context("failed to start flow simulator")?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for FlowThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Battery
// ---------------------------------------------------------------------------

const CELL_FULL_V: f64 = 4.15;
const CELL_EMPTY_V: f64 = 3.0;
const DRAIN_PER_READ_V: f64 = 0.000_02;
const SIM_DIVIDER: f64 = 6.47;

pub struct SimBattery {
    cell_v: f64,
}

impl SimBattery {
    pub fn new() -> Self {
        Self { cell_v: CELL_FULL_V }
    }
}

impl BatterySensor for SimBattery {
    fn read_pin_volts(&mut self) -> Result<f32> {
        self.cell_v = (self.cell_v - DRAIN_PER_READ_V).max(CELL_EMPTY_V);
        let pin = gaussian(self.cell_v, 0.005) / SIM_DIVIDER;
        Ok(pin.max(0.0) as f32)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
