//! Pulse-counting flow meter.
//!
//! The sensor line fires one edge per rotor tick. Edges arrive on an
//! interrupt (or an interrupt-like callback thread) and land in a
//! [`PulseCounter`]; the control loop drains that counter once per window
//! and turns it into liters/minute plus a running liter total.
//!
//! ```text
//!  edge ──▶ PulseCounter::on_pulse_edge   (debounce, count++)
//!                  │
//!  tick ──▶ FlowMeter::tick ── swap(0) ──▶ overflow check ──▶ L/min
//!                                           ├─ clamp to MAX_LPM_ABS
//!                                           └─ clamp to last × MAX_STEP_FACTOR
//! ```
//!
//! One 100 ms window at 450 pulses/L resolves only 1.33 L/min, so a slow
//! leak reads as 0 in one window and 1.33 in the next. The alarm checks use
//! [`FlowMeter::steady_lpm`] instead, which counts pulses over the last
//! [`STEADY_SPAN_MS`] of windows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

/// Edges closer than this to the last accepted edge are contact bounce.
pub const MIN_PULSE_SPACING_US: u64 = 150;

/// Length of one measurement window.
pub const WINDOW_MS: u64 = 100;

/// More pulses than this in one window cannot come from the rotor.
pub const MAX_PULSES_PER_WINDOW: u32 = 20_000;

/// Absolute ceiling for a plausible flow rate.
pub const MAX_LPM_ABS: f32 = 60.0;

/// A window may report at most this multiple of the previous rate.
pub const MAX_STEP_FACTOR: f32 = 5.0;

/// Span the steady rate is averaged over.
pub const STEADY_SPAN_MS: u64 = 5_000;

/// Used when the configured calibration is implausible.
pub const DEFAULT_PULSES_PER_LITER: f32 = 450.0;

const MIN_PLAUSIBLE_PULSES_PER_LITER: f32 = 0.1;

/// Below this previous rate the step filter is off, so flow can ramp up
/// from standstill in one window.
const STEP_FILTER_FLOOR_LPM: f32 = 0.1;

/// What to do with a window whose pulse count exceeds
/// [`MAX_PULSES_PER_WINDOW`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Treat the whole window as a glitch and count nothing.
    #[default]
    Discard,
    /// Keep the window but truncate it to the maximum.
    Clamp,
}

// ---------------------------------------------------------------------------
// Interrupt-shared counter
// ---------------------------------------------------------------------------

/// State shared between the edge interrupt and the control loop.
///
/// Only the interrupt writes `last_edge_us`; the loop reads the count with a
/// single swap, so neither side ever blocks the other.
#[derive(Debug, Default)]
pub struct PulseCounter {
    pulses: AtomicU32,
    last_edge_us: AtomicU64,
}

impl PulseCounter {
    pub const fn new() -> Self {
        Self {
            pulses: AtomicU32::new(0),
            last_edge_us: AtomicU64::new(0),
        }
    }

    /// Interrupt entry point. Returns whether the edge was counted.
    ///
    /// No allocation, no locking, no logging.
    #[inline]
    pub fn on_pulse_edge(&self, now_us: u64) -> bool {
        let last = self.last_edge_us.load(Ordering::Relaxed);
        if last != 0 && now_us.wrapping_sub(last) < MIN_PULSE_SPACING_US {
            return false;
        }
        self.last_edge_us.store(now_us, Ordering::Relaxed);
        self.pulses.fetch_add(1, Ordering::Release);
        true
    }

    /// Read and zero the pending count in one atomic exchange.
    pub fn take(&self) -> u32 {
        self.pulses.swap(0, Ordering::AcqRel)
    }

    /// Monotonic timestamp of the last accepted edge, if any.
    pub fn last_edge_us(&self) -> Option<u64> {
        match self.last_edge_us.load(Ordering::Relaxed) {
            0 => None,
            t => Some(t),
        }
    }
}

// ---------------------------------------------------------------------------
// Meter
// ---------------------------------------------------------------------------

/// Recoverable sensor fault detected while closing a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overcount {
    pub pulses: u32,
    pub kept: u32,
}

pub struct FlowMeter {
    counter: Arc<PulseCounter>,
    policy: OverflowPolicy,
    lpm: f32,
    /// Closed windows as (pulses, length ms), oldest first.
    recent: VecDeque<(u32, u64)>,
    recent_ms: u64,
    k: f32,
    total_liters: f64,
    last_window_ms: u64,
    overcounts: u32,
    calibration_warned: bool,
}

impl FlowMeter {
    pub fn new(counter: Arc<PulseCounter>, policy: OverflowPolicy, now_ms: u64) -> Self {
        Self {
            counter,
            policy,
            lpm: 0.0,
            recent: VecDeque::new(),
            recent_ms: 0,
            k: DEFAULT_PULSES_PER_LITER,
            total_liters: 0.0,
            last_window_ms: now_ms,
            overcounts: 0,
            calibration_warned: false,
        }
    }

    pub fn counter(&self) -> &Arc<PulseCounter> {
        &self.counter
    }

    /// Close the current window if it is due.
    ///
    /// Returns the overcount fault when the window had to be discarded or
    /// truncated.
    pub fn tick(&mut self, now_ms: u64, pulses_per_liter: f32) -> Option<Overcount> {
        let elapsed_ms = now_ms.saturating_sub(self.last_window_ms);
        if elapsed_ms < WINDOW_MS {
            return None;
        }

        let mut pulses = self.counter.take();
        let mut fault = None;
        if pulses > MAX_PULSES_PER_WINDOW {
            let kept = match self.policy {
                OverflowPolicy::Discard => 0,
                OverflowPolicy::Clamp => MAX_PULSES_PER_WINDOW,
            };
            warn!(pulses, kept, policy = ?self.policy, "flow: pulse overcount in window");
            self.overcounts = self.overcounts.saturating_add(1);
            fault = Some(Overcount { pulses, kept });
            pulses = kept;
        }

        let k = self.calibration(pulses_per_liter);
        let window_s = elapsed_ms as f32 / 1000.0;
        let liters_per_sec = pulses as f32 / window_s / k;

        let mut candidate = (liters_per_sec * 60.0).min(MAX_LPM_ABS);
        if self.lpm > STEP_FILTER_FLOOR_LPM {
            candidate = candidate.min(self.lpm * MAX_STEP_FACTOR);
        }

        // Integrate over the real window length so tick jitter is absorbed.
        self.total_liters += f64::from(liters_per_sec) * f64::from(window_s);
        self.lpm = candidate;
        self.last_window_ms = now_ms;
        self.k = k;
        self.remember(pulses, elapsed_ms);

        fault
    }

    fn remember(&mut self, pulses: u32, elapsed_ms: u64) {
        self.recent.push_back((pulses, elapsed_ms));
        self.recent_ms += elapsed_ms;
        while let Some(&(_, oldest_ms)) = self.recent.front() {
            if self.recent_ms - oldest_ms < STEADY_SPAN_MS {
                break;
            }
            self.recent.pop_front();
            self.recent_ms -= oldest_ms;
        }
    }

    fn calibration(&mut self, pulses_per_liter: f32) -> f32 {
        if pulses_per_liter.is_finite() && pulses_per_liter > MIN_PLAUSIBLE_PULSES_PER_LITER {
            return pulses_per_liter;
        }
        if !self.calibration_warned {
            warn!(
                pulses_per_liter,
                fallback = DEFAULT_PULSES_PER_LITER,
                "flow: implausible calibration, using default"
            );
            self.calibration_warned = true;
        }
        DEFAULT_PULSES_PER_LITER
    }

    pub fn lpm(&self) -> f32 {
        self.lpm
    }

    /// Forget the windows behind [`FlowMeter::steady_lpm`].
    pub fn reset_steady(&mut self) {
        self.recent.clear();
        self.recent_ms = 0;
    }

    /// Rate over at least the last [`STEADY_SPAN_MS`]. Right after start
    /// the missing time counts as no flow.
    pub fn steady_lpm(&self) -> f32 {
        let pulses: u32 = self.recent.iter().map(|&(p, _)| p).sum();
        let span_s = self.recent_ms.max(STEADY_SPAN_MS) as f32 / 1000.0;
        (pulses as f32 / span_s / self.k * 60.0).min(MAX_LPM_ABS)
    }

    pub fn total_liters(&self) -> f64 {
        self.total_liters
    }

    /// Milliseconds since the last accepted edge; 0 if none was ever seen.
    pub fn last_pulse_age_ms(&self, now_us: u64) -> u64 {
        self.counter
            .last_edge_us()
            .map_or(0, |t| now_us.saturating_sub(t) / 1000)
    }

    pub fn overcounts(&self) -> u32 {
        self.overcounts
    }

    /// Seed the lifetime total from persisted storage.
    pub fn restore_total(&mut self, liters: f64) {
        if liters.is_finite() && liters >= 0.0 {
            self.total_liters = liters;
        } else {
            warn!(liters, "flow: ignoring implausible persisted total");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
