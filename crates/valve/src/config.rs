//! TOML device configuration: loading, environment overrides, validation.
//!
//! Every section is optional; a missing file means built-in defaults. The
//! runtime-tunable settings (limits, calibration, reboot hour) are not here:
//! they live in the settings store and can change while running.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use irrigation_core::flow::OverflowPolicy;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub mqtt: MqttConfig,
    pub web: WebConfig,
    pub hardware: HardwareConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    /// Fixed offset of local time from UTC, in hours.
    pub utc_offset_hours: i8,
    /// Control loop period.
    pub tick_ms: u64,
    pub overflow_policy: OverflowPolicy,
    /// Minutes between writes of the lifetime liter total.
    pub total_persist_min: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "irrigation-valve".into(),
            utc_offset_hours: 0,
            tick_ms: 50,
            overflow_policy: OverflowPolicy::default(),
            total_persist_min: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Prefix for every topic, e.g. `garden/valve1`.
    pub base_topic: String,
    pub client_id: String,
    pub keep_alive_s: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            base_topic: "irrigation/valve".into(),
            client_id: "irrigation-valve".into(),
            keep_alive_s: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// BCM pin driving the valve relay.
    pub relay_pin: u8,
    /// BCM pin the flow sensor's open-collector output is wired to.
    pub flow_pin: u8,
    /// Most relay boards switch on a LOW input.
    pub relay_active_low: bool,
    /// I2C address of the ADS1115 measuring the battery divider.
    pub adc_addr: u16,
    pub battery_channel: u8,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            relay_pin: 17,
            flow_pin: 27,
            relay_active_low: true,
            adc_addr: 0x48,
            battery_channel: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

/// ADS1115 address range selectable via the ADDR pin.
const ADS1115_ADDRS: std::ops::RangeInclusive<u16> = 0x48..=0x4b;

const ADS1115_MAX_CHANNEL: u8 = 3;

/// The flow window is 100 ms; the loop must tick at least that often.
const TICK_MS_RANGE: std::ops::RangeInclusive<u64> = 10..=100;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_hardware(&mut errors);

        if self.web.port == 0 {
            errors.push("web.port must be non-zero".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;
        if d.name.trim().is_empty() {
            errors.push("device.name is empty".into());
        }
        if !(-12..=14).contains(&d.utc_offset_hours) {
            errors.push(format!(
                "device.utc_offset_hours {} out of range [-12, 14]",
                d.utc_offset_hours
            ));
        }
        if !TICK_MS_RANGE.contains(&d.tick_ms) {
            errors.push(format!(
                "device.tick_ms {} out of range [{}, {}]",
                d.tick_ms,
                TICK_MS_RANGE.start(),
                TICK_MS_RANGE.end()
            ));
        }
        if d.total_persist_min == 0 {
            errors.push("device.total_persist_min must be positive".into());
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        let base = m.base_topic.as_str();
        if base.is_empty() || base.starts_with('/') || base.ends_with('/') {
            errors.push(format!(
                "mqtt.base_topic '{base}' must be non-empty without leading or trailing '/'"
            ));
        }
        if base.contains(['+', '#']) {
            errors.push(format!("mqtt.base_topic '{base}' must not contain wildcards"));
        }
    }

    fn validate_hardware(&self, errors: &mut Vec<String>) {
        let h = &self.hardware;
        for (name, pin) in [("relay_pin", h.relay_pin), ("flow_pin", h.flow_pin)] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "hardware.{name}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            }
        }
        if h.relay_pin == h.flow_pin {
            errors.push(format!(
                "hardware: relay_pin and flow_pin both use GPIO {}",
                h.relay_pin
            ));
        }
        if !ADS1115_ADDRS.contains(&h.adc_addr) {
            errors.push(format!(
                "hardware.adc_addr 0x{:02x} is not an ADS1115 address (0x48-0x4b)",
                h.adc_addr
            ));
        }
        if h.battery_channel > ADS1115_MAX_CHANNEL {
            errors.push(format!(
                "hardware.battery_channel {} out of range (0-{ADS1115_MAX_CHANNEL})",
                h.battery_channel
            ));
        }
    }

    /// Apply environment overrides (`MQTT_HOST`, `MQTT_PORT`, `WEB_PORT`).
    /// Unparseable numbers are ignored with a warning.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(raw) = var("MQTT_PORT") {
            match raw.parse() {
                Ok(port) => self.mqtt.port = port,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid MQTT_PORT"),
            }
        }
        if let Some(raw) = var("WEB_PORT") {
            match raw.parse() {
                Ok(port) => self.web.port = port,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid WEB_PORT"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Read, override from the process environment, and validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults");
        Config::default()
    };

    config.apply_env(|k| std::env::var(k).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
