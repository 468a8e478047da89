//! Battery voltage sampling and smoothing.

use tracing::{debug, warn};

pub const SAMPLE_INTERVAL_MS: u64 = 5_000;

/// Weight of the newest sample in the moving average.
const EMA_ALPHA: f32 = 0.2;

/// Source of the voltage at the ADC pin, before the divider is undone.
pub trait BatterySensor {
    fn read_pin_volts(&mut self) -> anyhow::Result<f32>;
}

impl<T: BatterySensor + ?Sized> BatterySensor for Box<T> {
    fn read_pin_volts(&mut self) -> anyhow::Result<f32> {
        (**self).read_pin_volts()
    }
}

pub struct BatteryMonitor<S> {
    sensor: S,
    smoothed: Option<f32>,
    raw_pin: Option<f32>,
    last_sample_ms: Option<u64>,
    read_errors: u32,
}

impl<S: BatterySensor> BatteryMonitor<S> {
    pub fn new(sensor: S) -> Self {
        Self {
            sensor,
            smoothed: None,
            raw_pin: None,
            last_sample_ms: None,
            read_errors: 0,
        }
    }

    /// Take a sample when one is due. The first call always samples.
    pub fn tick(&mut self, now_ms: u64, divider: f32) {
        let due = self
            .last_sample_ms
            .map_or(true, |t| now_ms.saturating_sub(t) >= SAMPLE_INTERVAL_MS);
        if !due {
            return;
        }
        self.last_sample_ms = Some(now_ms);

        let pin = match self.sensor.read_pin_volts() {
            Ok(v) if v.is_finite() => v,
            Ok(v) => {
                warn!(pin_v = v, "battery: non-finite reading dropped");
                self.read_errors = self.read_errors.saturating_add(1);
                return;
            }
            Err(e) => {
                warn!("battery: read failed: {e:#}");
                self.read_errors = self.read_errors.saturating_add(1);
                return;
            }
        };

        let volts = pin * divider;
        self.raw_pin = Some(pin);
        let smoothed = match self.smoothed {
            Some(prev) => prev * (1.0 - EMA_ALPHA) + volts * EMA_ALPHA,
            None => volts,
        };
        self.smoothed = Some(smoothed);
        debug!(pin_v = pin, battery_v = smoothed, "battery sampled");
    }

    /// Smoothed battery voltage, `None` until the first good sample.
    pub fn voltage(&self) -> Option<f32> {
        self.smoothed
    }

    /// Last unsmoothed pin voltage.
    pub fn raw_pin_volts(&self) -> Option<f32> {
        self.raw_pin
    }

    pub fn read_errors(&self) -> u32 {
        self.read_errors
    }
}
