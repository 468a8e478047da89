//! Logical payloads exchanged with the telemetry/command boundary.
//!
//! Transport and encoding belong to the boundary. The structs here derive
//! `Serialize` so every boundary renders the same field names.

use serde::{Deserialize, Serialize};

use crate::safety::ActiveAlarms;
use crate::scheduler::Mode;
use crate::valve::ValveState;

pub const ACTIVE_INTERVAL_MS: u64 = 5_000;
pub const IDLE_INTERVAL_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub valve: ValveState,
    pub flow_lpm: f32,
    pub flow_total_l: f64,
    /// `None` until the first battery sample.
    pub battery_v: Option<f32>,
    pub irr_mode: Mode,
    pub irr_running: bool,
    pub remaining_s: u32,
    pub daily_open_s: u32,
    pub daily_limit_s: u32,
    pub alarms: ActiveAlarms,
    pub diag: String,
    pub time_valid: bool,
    pub uptime_s: u64,
}

/// One point of the flow history series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    /// Unix seconds.
    pub ts: i64,
    pub flow_l_min: f32,
    pub total_l: f64,
    pub vbat: Option<f32>,
    pub valve: ValveState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    Boot,
    ValveOpen,
    ValveClose,
    AlarmLimit,
    AlarmLeak,
    AlarmStagnation,
    AlarmBattery,
    RebootScheduled,
    Anomaly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceEvent {
    pub event: EventName,
    pub ts_uptime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_l: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DeviceEvent {
    pub fn new(event: EventName, now_ms: u64) -> Self {
        Self {
            event,
            ts_uptime: now_ms / 1000,
            last_run_l: None,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Publish cadence: fast while water moves, slow otherwise.
pub fn telemetry_interval_ms(valve: ValveState, flow_lpm: f32) -> u64 {
    if valve == ValveState::Open || flow_lpm > 0.0 {
        ACTIVE_INTERVAL_MS
    } else {
        IDLE_INTERVAL_MS
    }
}

// ---------------------------------------------------------------------------
// Inbound commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open manually. Without a duration the run ceiling applies.
    Open { duration_sec: Option<u32> },
    Close,
    SetAuto,
    SetManual,
}

#[derive(Deserialize)]
struct CommandMsg {
    cmd: String,
    #[serde(default)]
    duration_s: Option<u32>,
}

/// Parse a command payload: either a bare verb (`OPEN`, `close`, ...) or
/// JSON such as `{"cmd":"OPEN","duration_s":300}`.
pub fn parse_command(payload: &[u8]) -> Result<Command, String> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();

    let (verb, duration_sec) = if text.starts_with('{') {
        let msg: CommandMsg =
            serde_json::from_str(text).map_err(|e| format!("bad command json: {e}"))?;
        (msg.cmd, msg.duration_s)
    } else {
        (text.to_string(), None)
    };

    match verb.trim().to_uppercase().as_str() {
        "OPEN" | "ON" => Ok(Command::Open { duration_sec }),
        "CLOSE" | "OFF" => Ok(Command::Close),
        "AUTO" | "SET_AUTO" | "MODE_AUTO" => Ok(Command::SetAuto),
        "MANUAL" | "SET_MANUAL" | "MODE_MANUAL" => Ok(Command::SetManual),
        other => Err(format!("unknown command '{other}'")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- parse_command ----------------------------------------------------

    #[test]
    fn plain_verbs() {
        assert_eq!(parse_command(b"OPEN"), Ok(Command::Open { duration_sec: None }));
        assert_eq!(parse_command(b"close"), Ok(Command::Close));
        assert_eq!(parse_command(b"MODE_AUTO"), Ok(Command::SetAuto));
        assert_eq!(parse_command(b"set_manual"), Ok(Command::SetManual));
    }

    #[test]
    fn legacy_on_off_and_whitespace() {
        assert_eq!(parse_command(b"  on \n"), Ok(Command::Open { duration_sec: None }));
        assert_eq!(parse_command(b"\tOFF"), Ok(Command::Close));
    }

    #[test]
    fn json_with_duration() {
        assert_eq!(
            parse_command(br#"{"cmd":"open","duration_s":300}"#),
            Ok(Command::Open { duration_sec: Some(300) })
        );
        assert_eq!(parse_command(br#"{"cmd":"AUTO"}"#), Ok(Command::SetAuto));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_command(b"TOGGLE").is_err());
        assert!(parse_command(b"").is_err());
        assert!(parse_command(br#"{"command":"OPEN"}"#).is_err());
        assert!(parse_command(br#"{"cmd":"OPEN","duration_s":-5}"#).is_err());
    }

    // -- Payload shapes ---------------------------------------------------

    #[test]
    fn event_omits_empty_fields() {
        let json = serde_json::to_value(DeviceEvent::new(EventName::Boot, 2_500)).unwrap();
        assert_eq!(json, serde_json::json!({"event": "boot", "ts_uptime": 2}));

        let mut close = DeviceEvent::new(EventName::ValveClose, 10_000);
        close.last_run_l = Some(12.5);
        let json = serde_json::to_value(close).unwrap();
        assert_eq!(json["event"], "valve_close");
        assert_eq!(json["last_run_l"], 12.5);
    }

    #[test]
    fn history_point_field_names() {
        let p = HistoryPoint {
            ts: 1_717_300_000,
            flow_l_min: 4.0,
            total_l: 100.0,
            vbat: None,
            valve: ValveState::Open,
        };
        let json = serde_json::to_value(p).unwrap();
        assert_eq!(json["valve"], "OPEN");
        assert!(json["vbat"].is_null());
        assert_eq!(json["total_l"], 100.0);
    }

    #[test]
    fn cadence_follows_activity() {
        assert_eq!(telemetry_interval_ms(ValveState::Open, 0.0), 5_000);
        assert_eq!(telemetry_interval_ms(ValveState::Closed, 0.3), 5_000);
        assert_eq!(telemetry_interval_ms(ValveState::Closed, 0.0), 60_000);
    }
}
