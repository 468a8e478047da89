//! Runtime-tunable device settings, cached in RAM and written through to the
//! settings store on change.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{SettingsStore, Value};

pub const KEY_LIMIT_SEC: &str = "limit_sec";
pub const KEY_BAT_MIN: &str = "bat_min";
pub const KEY_BAT_FACTOR: &str = "bat_factor";
pub const KEY_FLOW_FACTOR: &str = "flow_k";
pub const KEY_REBOOT_HOUR: &str = "reb_h";
pub const KEY_FLOW_TOTAL: &str = "flow_total";

const DEFAULT_LIMIT_SEC: u32 = 900;
const DEFAULT_BAT_MIN: f32 = 3.3;
const DEFAULT_BAT_FACTOR: f32 = 6.47;
const DEFAULT_FLOW_FACTOR: f32 = 450.0;

const LIMIT_SEC_RANGE: (i64, i64) = (10, 7_200);
const BAT_FACTOR_RANGE: (f32, f32) = (1.0, 10.0);
const FLOW_FACTOR_RANGE: (f32, f32) = (10.0, 2_000.0);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    /// Maximum valve-open seconds per calendar day.
    daily_limit_sec: u32,
    /// Battery warning threshold in volts; 0 disables the check.
    bat_min: f32,
    /// Voltage divider ratio applied to the ADC pin voltage.
    bat_factor: f32,
    /// Flow sensor calibration, pulses per liter.
    flow_factor: f32,
    /// Local hour for the scheduled restart, `None` when disabled.
    reboot_hour: Option<u8>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            daily_limit_sec: DEFAULT_LIMIT_SEC,
            bat_min: DEFAULT_BAT_MIN,
            bat_factor: DEFAULT_BAT_FACTOR,
            flow_factor: DEFAULT_FLOW_FACTOR,
            reboot_hour: None,
        }
    }
}

fn clamp_limit(secs: i64) -> u32 {
    secs.clamp(LIMIT_SEC_RANGE.0, LIMIT_SEC_RANGE.1) as u32
}

fn clamp_f32(v: f32, (lo, hi): (f32, f32), fallback: f32) -> f32 {
    if v.is_finite() {
        v.clamp(lo, hi)
    } else {
        fallback
    }
}

fn normalize_reboot_hour(h: i64) -> Option<u8> {
    if (0..=23).contains(&h) {
        Some(h as u8)
    } else {
        None
    }
}

impl Settings {
    /// Read every setting, applying defaults for missing keys and clamping
    /// implausible stored values.
    pub fn load<S: SettingsStore + ?Sized>(store: &S) -> Self {
        let d = Self::default();
        let bat_min = store.get_float(KEY_BAT_MIN, f64::from(d.bat_min)) as f32;
        let settings = Self {
            daily_limit_sec: clamp_limit(store.get_int(KEY_LIMIT_SEC, i64::from(d.daily_limit_sec))),
            bat_min: if bat_min.is_finite() { bat_min } else { d.bat_min },
            bat_factor: clamp_f32(
                store.get_float(KEY_BAT_FACTOR, f64::from(d.bat_factor)) as f32,
                BAT_FACTOR_RANGE,
                d.bat_factor,
            ),
            flow_factor: clamp_f32(
                store.get_float(KEY_FLOW_FACTOR, f64::from(d.flow_factor)) as f32,
                FLOW_FACTOR_RANGE,
                d.flow_factor,
            ),
            reboot_hour: normalize_reboot_hour(store.get_int(KEY_REBOOT_HOUR, -1)),
        };

        info!(
            limit_sec = settings.daily_limit_sec,
            bat_factor = settings.bat_factor,
            flow_k = settings.flow_factor,
            reboot_hour = ?settings.reboot_hour,
            "settings loaded"
        );
        settings
    }

    pub fn daily_limit_sec(&self) -> u32 {
        self.daily_limit_sec
    }

    pub fn bat_min(&self) -> f32 {
        self.bat_min
    }

    pub fn bat_factor(&self) -> f32 {
        self.bat_factor
    }

    pub fn flow_factor(&self) -> f32 {
        self.flow_factor
    }

    pub fn reboot_hour(&self) -> Option<u8> {
        self.reboot_hour
    }

    pub fn set_daily_limit_sec<S: SettingsStore + ?Sized>(&mut self, store: &mut S, secs: i64) {
        let secs = clamp_limit(secs);
        if secs != self.daily_limit_sec {
            self.daily_limit_sec = secs;
            persist(store, KEY_LIMIT_SEC, Value::Int(i64::from(secs)));
        }
    }

    pub fn set_bat_min<S: SettingsStore + ?Sized>(&mut self, store: &mut S, volts: f32) {
        if !volts.is_finite() {
            warn!(volts, "ignoring non-finite battery minimum");
            return;
        }
        if volts != self.bat_min {
            self.bat_min = volts;
            persist(store, KEY_BAT_MIN, Value::Float(f64::from(volts)));
        }
    }

    pub fn set_bat_factor<S: SettingsStore + ?Sized>(&mut self, store: &mut S, factor: f32) {
        let factor = clamp_f32(factor, BAT_FACTOR_RANGE, self.bat_factor);
        if factor != self.bat_factor {
            self.bat_factor = factor;
            persist(store, KEY_BAT_FACTOR, Value::Float(f64::from(factor)));
        }
    }

    pub fn set_flow_factor<S: SettingsStore + ?Sized>(&mut self, store: &mut S, pulses_per_liter: f32) {
        let k = clamp_f32(pulses_per_liter, FLOW_FACTOR_RANGE, self.flow_factor);
        if k != self.flow_factor {
            self.flow_factor = k;
            persist(store, KEY_FLOW_FACTOR, Value::Float(f64::from(k)));
        }
    }

    /// Any hour outside 0..=23 disables the scheduled restart.
    pub fn set_reboot_hour<S: SettingsStore + ?Sized>(&mut self, store: &mut S, hour: i64) {
        let hour = normalize_reboot_hour(hour);
        if hour != self.reboot_hour {
            self.reboot_hour = hour;
            let raw = hour.map_or(-1, i64::from);
            persist(store, KEY_REBOOT_HOUR, Value::Int(raw));
            info!(reboot_hour = raw, "auto-reboot hour changed");
        }
    }
}

/// Partial settings change as received from an operator. Absent fields are
/// left alone.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub daily_limit_sec: Option<i64>,
    /// Convenience alias accepted from forms; wins over `daily_limit_sec`.
    pub daily_limit_min: Option<i64>,
    pub bat_min: Option<f32>,
    pub bat_factor: Option<f32>,
    pub flow_factor: Option<f32>,
    /// -1 (or any out-of-range hour) disables the scheduled restart.
    pub reboot_hour: Option<i64>,
}

impl Settings {
    pub fn apply<S: SettingsStore + ?Sized>(&mut self, store: &mut S, update: &SettingsUpdate) {
        let limit = update
            .daily_limit_min
            .map(|m| m.saturating_mul(60))
            .or(update.daily_limit_sec);
        if let Some(secs) = limit {
            self.set_daily_limit_sec(store, secs);
        }
        if let Some(v) = update.bat_min {
            self.set_bat_min(store, v);
        }
        if let Some(v) = update.bat_factor {
            self.set_bat_factor(store, v);
        }
        if let Some(v) = update.flow_factor {
            self.set_flow_factor(store, v);
        }
        if let Some(h) = update.reboot_hour {
            self.set_reboot_hour(store, h);
        }
    }
}

/// Write-through. A failed write keeps the RAM value; it is retried on the
/// next change.
fn persist<S: SettingsStore + ?Sized>(store: &mut S, key: &str, value: Value) {
    if let Err(e) = store.set(key, value) {
        warn!(key, "settings: persist failed: {e:#}");
    }
}
