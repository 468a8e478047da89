//! Irrigation scheduler: a weekly slot table plus a single run timer.
//!
//! The scheduler opens the valve when an enabled slot's start minute comes
//! round on one of its weekdays, and closes it again when the run timer
//! expires. Manual commands go through the same `start`/`stop` path so the
//! hard runtime ceiling applies to every run.
//!
//! ## Run state machine
//!
//! ```text
//!          start(d)               elapsed >= min(d, MAX_RUN_SEC)
//!  Idle ───────────────▶ Running ──────────────────────────────▶ Idle
//!   ▲                       │                                   (mode → AUTO)
//!   └──── stop_with_mode ───┘
//! ```
//!
//! ## Persisted layout
//!
//! The slot table is stored as one blob of `MAX_SLOTS` fixed records:
//!
//! ```text
//!  byte 0   enabled (0/1)
//!  byte 1   start hour   (0-23)
//!  byte 2   start minute (0-59)
//!  byte 3-4 duration seconds, little endian
//!  byte 5   weekday mask (bit 0 = Sunday)
//! ```

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::{info, warn};

use crate::store::{SettingsStore, Value};
use crate::valve::{Valve, ValveOutput, ValveState};

pub const MAX_SLOTS: usize = 6;

/// Hard ceiling for a single run, whatever the caller asks for.
pub const MAX_RUN_SEC: u32 = 3_600;

/// Flow above this while the valve is closed counts as an anomaly.
pub const ANOMALY_LPM: f32 = 0.2;

const ANOMALY_WARN_INTERVAL_MS: u64 = 30_000;

/// A slot fires only during the first seconds of its start minute.
const TRIGGER_WINDOW_SEC: u8 = 5;

pub const SLOT_RECORD_LEN: usize = 6;
pub const SLOTS_BLOB_LEN: usize = SLOT_RECORD_LEN * MAX_SLOTS;
pub const SLOTS_KEY: &str = "slots";

const ALL_DAYS: u8 = 0x7f;

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrrigationSlot {
    pub enabled: bool,
    pub start_hour: u8,
    pub start_minute: u8,
    pub duration_sec: u16,
    /// Bit 0 = Sunday ... bit 6 = Saturday.
    pub weekday_mask: u8,
}

impl Default for IrrigationSlot {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour: 6,
            start_minute: 0,
            duration_sec: 600,
            weekday_mask: ALL_DAYS,
        }
    }
}

impl IrrigationSlot {
    /// `weekday` counts from Sunday = 0.
    pub fn runs_on(&self, weekday: u8) -> bool {
        weekday < 7 && (self.weekday_mask >> weekday) & 1 == 1
    }

    /// True inside the trigger window of this slot's start minute.
    pub fn is_due(&self, at: &OffsetDateTime) -> bool {
        self.enabled
            && self.runs_on(at.weekday().number_days_from_sunday())
            && at.hour() == self.start_hour
            && at.minute() == self.start_minute
            && at.second() < TRIGGER_WINDOW_SEC
    }

    fn encode_into(&self, out: &mut [u8]) {
        let d = self.duration_sec.to_le_bytes();
        out[0] = u8::from(self.enabled);
        out[1] = self.start_hour;
        out[2] = self.start_minute;
        out[3] = d[0];
        out[4] = d[1];
        out[5] = self.weekday_mask;
    }

    fn decode(rec: &[u8]) -> Self {
        Self {
            enabled: rec[0] != 0,
            start_hour: rec[1],
            start_minute: rec[2],
            duration_sec: u16::from_le_bytes([rec[3], rec[4]]),
            weekday_mask: rec[5],
        }
    }
}

pub fn encode_slots(slots: &[IrrigationSlot; MAX_SLOTS]) -> Vec<u8> {
    let mut blob = vec![0u8; SLOTS_BLOB_LEN];
    for (slot, rec) in slots.iter().zip(blob.chunks_exact_mut(SLOT_RECORD_LEN)) {
        slot.encode_into(rec);
    }
    blob
}

/// `None` unless the blob has exactly the expected length. A short or long
/// blob is never partially recovered.
pub fn decode_slots(blob: &[u8]) -> Option<[IrrigationSlot; MAX_SLOTS]> {
    if blob.len() != SLOTS_BLOB_LEN {
        return None;
    }
    let mut slots = [IrrigationSlot::default(); MAX_SLOTS];
    for (slot, rec) in slots.iter_mut().zip(blob.chunks_exact(SLOT_RECORD_LEN)) {
        *slot = IrrigationSlot::decode(rec);
    }
    Some(slots)
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy)]
struct Run {
    started_ms: u64,
    duration_sec: u32,
}

/// What happened during one scheduler tick.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SchedulerTick {
    /// Flow seen with the valve closed, reported at most every 30 s.
    pub anomaly_lpm: Option<f32>,
    pub finished: bool,
    /// Index of the slot that started a run.
    pub triggered: Option<usize>,
}

pub struct Scheduler {
    mode: Mode,
    run: Option<Run>,
    slots: [IrrigationSlot; MAX_SLOTS],
    last_anomaly_ms: Option<u64>,
    /// Minute of the last slot trigger, so a run shorter than the trigger
    /// window cannot fire the same slot twice.
    last_trigger: Option<(Date, u8, u8)>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::with_slots([IrrigationSlot::default(); MAX_SLOTS])
    }
}

impl Scheduler {
    pub fn with_slots(slots: [IrrigationSlot; MAX_SLOTS]) -> Self {
        Self {
            mode: Mode::Auto,
            run: None,
            slots,
            last_anomaly_ms: None,
            last_trigger: None,
        }
    }

    /// Load the slot table from the store, or fall back to built-in
    /// defaults when nothing valid is stored.
    pub fn load<S: SettingsStore + ?Sized>(store: &S) -> Self {
        match store.get_blob(SLOTS_KEY).as_deref().and_then(decode_slots) {
            Some(slots) => {
                info!(slots = MAX_SLOTS, "scheduler: slots loaded");
                Self::with_slots(slots)
            }
            None => {
                warn!("scheduler: no valid slots stored, using defaults");
                Self::default()
            }
        }
    }

    // -- Run control ------------------------------------------------------

    /// Open the valve for `duration_sec`, capped at [`MAX_RUN_SEC`].
    pub fn start<O: ValveOutput>(&mut self, duration_sec: u32, valve: &mut Valve<O>, now_ms: u64) {
        let duration_sec = duration_sec.min(MAX_RUN_SEC);
        valve.set(ValveState::Open, now_ms);
        if !valve.is_open() {
            warn!("scheduler: valve did not open, run not started");
            return;
        }
        self.run = Some(Run {
            started_ms: now_ms,
            duration_sec,
        });
        info!(duration_sec, mode = ?self.mode, "scheduler: run started");
    }

    /// End the run and hand control back to the schedule.
    pub fn stop<O: ValveOutput>(&mut self, valve: &mut Valve<O>, now_ms: u64) {
        self.stop_with_mode(valve, now_ms, Mode::Auto);
    }

    /// End the run, leaving the scheduler in `mode`.
    pub fn stop_with_mode<O: ValveOutput>(&mut self, valve: &mut Valve<O>, now_ms: u64, mode: Mode) {
        valve.set(ValveState::Closed, now_ms);
        if self.run.take().is_some() {
            info!(?mode, "scheduler: run stopped");
        }
        self.mode = mode;
    }

    pub fn set_mode(&mut self, mode: Mode) {
        if mode != self.mode {
            info!(?mode, "scheduler: mode changed");
        }
        self.mode = mode;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Effective duration of the current run, after the ceiling.
    pub fn run_duration_sec(&self) -> Option<u32> {
        self.run.map(|r| r.duration_sec)
    }

    pub fn remaining_sec(&self, now_ms: u64) -> u32 {
        match self.run {
            Some(r) => {
                let elapsed = now_ms.saturating_sub(r.started_ms) / 1000;
                u64::from(r.duration_sec).saturating_sub(elapsed) as u32
            }
            None => 0,
        }
    }

    // -- Periodic evaluation ----------------------------------------------

    /// `calendar` is `None` while the clock is not synchronised; that
    /// disables slot triggering but nothing else.
    pub fn tick<O: ValveOutput>(
        &mut self,
        now_ms: u64,
        calendar: Option<&OffsetDateTime>,
        flow_lpm: f32,
        valve: &mut Valve<O>,
    ) -> SchedulerTick {
        let mut out = SchedulerTick::default();

        // ── Anomaly: flow through a closed valve ─────────────────────
        if self.run.is_none() && valve.is_settled_closed(now_ms) && flow_lpm > ANOMALY_LPM {
            let due = self
                .last_anomaly_ms
                .map_or(true, |t| now_ms.saturating_sub(t) > ANOMALY_WARN_INTERVAL_MS);
            if due {
                warn!(flow_lpm, "scheduler: flow detected while valve CLOSED");
                self.last_anomaly_ms = Some(now_ms);
                out.anomaly_lpm = Some(flow_lpm);
            }
        }

        // ── Run timer ────────────────────────────────────────────────
        if let Some(run) = self.run {
            let elapsed_ms = now_ms.saturating_sub(run.started_ms);
            if elapsed_ms >= u64::from(run.duration_sec) * 1000 {
                info!(duration_sec = run.duration_sec, "scheduler: timer finished");
                self.stop(valve, now_ms);
                out.finished = true;
            }
            return out;
        }

        // ── Automatic slots ──────────────────────────────────────────
        if self.mode != Mode::Auto {
            return out;
        }
        let Some(at) = calendar else {
            return out;
        };
        let minute_key = (at.date(), at.hour(), at.minute());
        if self.last_trigger == Some(minute_key) {
            return out;
        }

        if let Some(index) = self.slots.iter().position(|s| s.is_due(at)) {
            let slot = self.slots[index];
            info!(
                slot = index + 1,
                weekday = at.weekday().number_days_from_sunday(),
                duration_sec = slot.duration_sec,
                "scheduler: slot triggered"
            );
            self.last_trigger = Some(minute_key);
            self.start(u32::from(slot.duration_sec), valve, now_ms);
            out.triggered = Some(index);
        }

        out
    }

    // -- Slot table -------------------------------------------------------

    pub fn slots(&self) -> &[IrrigationSlot; MAX_SLOTS] {
        &self.slots
    }

    /// Replace one slot in RAM. Out-of-range indices and start times that
    /// are not a clock time are rejected.
    /// Call [`Scheduler::save_to_store`] afterwards to keep the change.
    pub fn update_slot(&mut self, index: usize, mut slot: IrrigationSlot) -> bool {
        let Some(target) = self.slots.get_mut(index) else {
            return false;
        };
        if slot.start_hour > 23 || slot.start_minute > 59 {
            warn!(
                index,
                hour = slot.start_hour,
                minute = slot.start_minute,
                "scheduler: slot rejected, bad start time"
            );
            return false;
        }
        slot.weekday_mask &= ALL_DAYS;
        *target = slot;
        true
    }

    /// Persist the whole table as one blob.
    pub fn save_to_store<S: SettingsStore + ?Sized>(&self, store: &mut S) -> anyhow::Result<()> {
        let blob = encode_slots(&self.slots);
        let len = blob.len();
        store.set(SLOTS_KEY, Value::Blob(blob))?;
        info!(bytes = len, "scheduler: slots saved");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
