//! Bounded event log read by the telemetry and web boundaries.
//!
//! Two rings: general system events (alarms, faults, restarts) and valve /
//! flow events (open, close with liters). Next to them sits the single
//! "last diagnostic" line that always shows the most recent problem.

use std::collections::VecDeque;

use serde::Serialize;
use time::OffsetDateTime;

pub const SYSTEM_CAPACITY: usize = 20;
pub const FLOW_CAPACITY: usize = 50;

/// An identical system entry within this window is folded into the
/// previous one instead of taking a new slot.
pub const REPEAT_WINDOW_MS: u64 = 30_000;

pub const DIAG_OK: &str = "OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Info,
    Warn,
    Alarm,
    Valve,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub uptime_s: u64,
    /// Wall time, absent while the clock was not synchronised.
    #[serde(with = "time::serde::rfc3339::option")]
    pub at: Option<OffsetDateTime>,
    pub kind: EventKind,
    pub detail: String,
    /// Number of identical entries folded into this one.
    pub repeats: u32,
}

#[derive(Debug)]
pub struct EventLog {
    system: VecDeque<LogEntry>,
    flow: VecDeque<LogEntry>,
    last_diag: String,
    now_ms: u64,
    now_wall: Option<OffsetDateTime>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self {
            system: VecDeque::with_capacity(SYSTEM_CAPACITY),
            flow: VecDeque::with_capacity(FLOW_CAPACITY),
            last_diag: DIAG_OK.to_string(),
            now_ms: 0,
            now_wall: None,
        }
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timestamp for entries recorded until the next call.
    pub fn stamp(&mut self, now_ms: u64, wall: Option<OffsetDateTime>) {
        self.now_ms = now_ms;
        self.now_wall = wall;
    }

    pub fn system(&mut self, kind: EventKind, detail: impl Into<String>) {
        let detail = detail.into();
        if let Some(last) = self.system.back_mut() {
            let recent = self.now_ms.saturating_sub(last.uptime_s * 1000) < REPEAT_WINDOW_MS;
            if last.kind == kind && last.detail == detail && recent {
                last.repeats = last.repeats.saturating_add(1);
                return;
            }
        }
        let entry = self.entry(kind, detail);
        push_bounded(&mut self.system, SYSTEM_CAPACITY, entry);
    }

    pub fn flow(&mut self, detail: impl Into<String>) {
        let entry = self.entry(EventKind::Valve, detail.into());
        push_bounded(&mut self.flow, FLOW_CAPACITY, entry);
    }

    /// Record an alarm in the system ring and make it the diagnostic line.
    pub fn alarm(&mut self, detail: impl Into<String>) {
        let detail = detail.into();
        self.last_diag = detail.clone();
        self.system(EventKind::Alarm, detail);
    }

    /// Replace the diagnostic line without adding a log entry.
    pub fn set_diag(&mut self, detail: impl Into<String>) {
        self.last_diag = detail.into();
    }

    pub fn clear_diag(&mut self) {
        self.last_diag = DIAG_OK.to_string();
    }

    pub fn last_diag(&self) -> &str {
        &self.last_diag
    }

    /// Newest first.
    pub fn system_entries(&self) -> Vec<LogEntry> {
        self.system.iter().rev().cloned().collect()
    }

    /// Newest first.
    pub fn flow_entries(&self) -> Vec<LogEntry> {
        self.flow.iter().rev().cloned().collect()
    }

    fn entry(&self, kind: EventKind, detail: String) -> LogEntry {
        LogEntry {
            uptime_s: self.now_ms / 1000,
            at: self.now_wall,
            kind,
            detail,
            repeats: 0,
        }
    }
}

fn push_bounded(ring: &mut VecDeque<LogEntry>, capacity: usize, entry: LogEntry) {
    if ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(entry);
}
