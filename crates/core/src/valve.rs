//! Valve actuator: sole owner of the relay output.
//!
//! The logical state is trusted once commanded; the relay gives no
//! feedback, so there is nothing to verify against.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Time given to the relay contacts after a forced close.
pub const RELAY_SETTLE: Duration = Duration::from_millis(500);

/// Water still runs down the line for a moment after closing; flow seen
/// inside this period is not held against the valve.
pub const FLOW_SETTLE_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValveState {
    Closed,
    Open,
}

impl fmt::Display for ValveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Hardware seams
// ---------------------------------------------------------------------------

/// Electrical side of the valve relay.
pub trait ValveOutput {
    /// Put the line at the closed level, then switch it to output mode so
    /// the relay never sees a pulse at boot.
    fn init_closed(&mut self);

    fn drive(&mut self, state: ValveState);

    /// Block for the relay settle time.
    fn settle(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<T: ValveOutput + ?Sized> ValveOutput for Box<T> {
    fn init_closed(&mut self) {
        (**self).init_closed();
    }

    fn drive(&mut self, state: ValveState) {
        (**self).drive(state);
    }

    fn settle(&mut self, duration: Duration) {
        (**self).settle(duration);
    }
}

/// Supervisory timer that restarts the device when the loop stops feeding it.
pub trait Watchdog {
    fn feed(&mut self);

    /// Stop supervising, for work that cannot feed the timer in time.
    fn suspend(&mut self);

    fn resume(&mut self);
}

impl<T: Watchdog + ?Sized> Watchdog for Box<T> {
    fn feed(&mut self) {
        (**self).feed();
    }

    fn suspend(&mut self) {
        (**self).suspend();
    }

    fn resume(&mut self) {
        (**self).resume();
    }
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

pub struct Valve<O> {
    output: O,
    state: ValveState,
    daily_open_sec: u32,
    /// Open milliseconds not yet folded into whole seconds.
    carry_ms: u64,
    last_accrual_ms: u64,
    transitions: u32,
    last_close_ms: Option<u64>,
    maintenance: bool,
}

impl<O: ValveOutput> Valve<O> {
    /// Take ownership of the output and force it closed.
    pub fn init(mut output: O, now_ms: u64) -> Self {
        output.init_closed();
        info!("valve initialised, state=CLOSED");
        Self {
            output,
            state: ValveState::Closed,
            daily_open_sec: 0,
            carry_ms: 0,
            last_accrual_ms: now_ms,
            transitions: 0,
            last_close_ms: None,
            maintenance: false,
        }
    }

    /// Command a new state. Returns whether the hardware was switched.
    ///
    /// Open time up to `now_ms` is booked before the switch, so the usage
    /// counter always agrees with the state it was accumulated under.
    pub fn set(&mut self, state: ValveState, now_ms: u64) -> bool {
        if state == self.state {
            return false;
        }
        if self.maintenance && state == ValveState::Open {
            warn!("valve: open refused during maintenance");
            return false;
        }

        self.accrue(now_ms);
        self.output.drive(state);
        self.state = state;
        self.transitions = self.transitions.wrapping_add(1);
        if state == ValveState::Closed {
            self.last_close_ms = Some(now_ms);
        }
        info!(valve = %state, "valve set");
        true
    }

    pub fn tick(&mut self, now_ms: u64) {
        self.accrue(now_ms);
    }

    fn accrue(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_accrual_ms);
        self.last_accrual_ms = now_ms;
        if self.state == ValveState::Open {
            self.carry_ms += elapsed;
            let whole = self.carry_ms / 1000;
            self.carry_ms %= 1000;
            self.daily_open_sec = self
                .daily_open_sec
                .saturating_add(u32::try_from(whole).unwrap_or(u32::MAX));
        }
    }

    pub fn state(&self) -> ValveState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ValveState::Open
    }

    /// Closed, and not just closed.
    pub fn is_settled_closed(&self, now_ms: u64) -> bool {
        self.state == ValveState::Closed
            && self
                .last_close_ms
                .map_or(true, |t| now_ms.saturating_sub(t) >= FLOW_SETTLE_MS)
    }

    pub fn daily_open_sec(&self) -> u32 {
        self.daily_open_sec
    }

    pub fn reset_daily_open_sec(&mut self) {
        self.daily_open_sec = 0;
        self.carry_ms = 0;
    }

    /// Hardware transitions since boot.
    pub fn transitions(&self) -> u32 {
        self.transitions
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance
    }

    /// Close the valve and take the watchdog out of the loop before a long
    /// blocking job such as writing a firmware image.
    pub fn prepare_for_maintenance<W: Watchdog + ?Sized>(&mut self, watchdog: &mut W, now_ms: u64) {
        warn!("valve: entering maintenance, forcing CLOSED");
        self.set(ValveState::Closed, now_ms);
        self.output.settle(RELAY_SETTLE);
        watchdog.suspend();
        self.maintenance = true;
    }

    pub fn resume_after_maintenance<W: Watchdog + ?Sized>(&mut self, watchdog: &mut W, now_ms: u64) {
        self.maintenance = false;
        self.last_accrual_ms = now_ms;
        watchdog.resume();
        info!("valve: maintenance finished, valve remains CLOSED");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every electrical action.
    #[derive(Clone, Default)]
    struct Probe(Arc<Mutex<Vec<String>>>);

    impl Probe {
        fn log(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ValveOutput for Probe {
        fn init_closed(&mut self) {
            self.0.lock().unwrap().push("init".into());
        }

        fn drive(&mut self, state: ValveState) {
            self.0.lock().unwrap().push(state.to_string());
        }

        fn settle(&mut self, duration: Duration) {
            self.0.lock().unwrap().push(format!("settle {}ms", duration.as_millis()));
        }
    }

    #[derive(Default)]
    struct Dog {
        suspended: bool,
        resumes: u32,
    }

    impl Watchdog for Dog {
        fn feed(&mut self) {}

        fn suspend(&mut self) {
            self.suspended = true;
        }

        fn resume(&mut self) {
            self.suspended = false;
            self.resumes += 1;
        }
    }

    // -- Init & set -------------------------------------------------------

    #[test]
    fn init_drives_closed_level_first() {
        let probe = Probe::default();
        let valve = Valve::init(probe.clone(), 0);
        assert_eq!(valve.state(), ValveState::Closed);
        assert_eq!(probe.log(), vec!["init"]);
    }

    #[test]
    fn set_is_idempotent() {
        let probe = Probe::default();
        let mut valve = Valve::init(probe.clone(), 0);
        assert!(valve.set(ValveState::Open, 10));
        assert!(!valve.set(ValveState::Open, 20));
        assert_eq!(probe.log(), vec!["init", "OPEN"]);
        assert_eq!(valve.transitions(), 1);
    }

    #[test]
    fn closing_twice_switches_once() {
        let probe = Probe::default();
        let mut valve = Valve::init(probe.clone(), 0);
        valve.set(ValveState::Open, 0);
        valve.set(ValveState::Closed, 5);
        valve.set(ValveState::Closed, 6);
        assert_eq!(probe.log(), vec!["init", "OPEN", "CLOSED"]);
    }

    // -- Usage accounting -------------------------------------------------

    #[test]
    fn fractional_open_time_is_carried() {
        let mut valve = Valve::init(Probe::default(), 0);
        valve.set(ValveState::Open, 0);
        // 30 ticks of 50 ms = 1.5 s. Truncating per tick would give 0.
        for i in 1..=30 {
            valve.tick(i * 50);
        }
        assert_eq!(valve.daily_open_sec(), 1);
        for i in 31..=40 {
            valve.tick(i * 50);
        }
        assert_eq!(valve.daily_open_sec(), 2);
    }

    #[test]
    fn closed_time_is_not_counted() {
        let mut valve = Valve::init(Probe::default(), 0);
        valve.tick(10_000);
        assert_eq!(valve.daily_open_sec(), 0);
        valve.set(ValveState::Open, 10_000);
        valve.tick(13_000);
        assert_eq!(valve.daily_open_sec(), 3);
    }

    #[test]
    fn close_books_open_time_up_to_the_transition() {
        let mut valve = Valve::init(Probe::default(), 0);
        valve.set(ValveState::Open, 0);
        valve.set(ValveState::Closed, 4_200);
        valve.tick(60_000);
        assert_eq!(valve.daily_open_sec(), 4);
    }

    #[test]
    fn reset_zeroes_counter() {
        let mut valve = Valve::init(Probe::default(), 0);
        valve.set(ValveState::Open, 0);
        valve.tick(5_000);
        valve.reset_daily_open_sec();
        assert_eq!(valve.daily_open_sec(), 0);
        valve.tick(6_000);
        assert_eq!(valve.daily_open_sec(), 1);
    }

    #[test]
    fn settled_after_rundown() {
        let mut valve = Valve::init(Probe::default(), 0);
        assert!(valve.is_settled_closed(0));
        valve.set(ValveState::Open, 1_000);
        assert!(!valve.is_settled_closed(1_500));
        valve.set(ValveState::Closed, 2_000);
        assert!(!valve.is_settled_closed(3_999));
        assert!(valve.is_settled_closed(4_000));
    }

    // -- Maintenance ------------------------------------------------------

    #[test]
    fn maintenance_closes_settles_and_suspends_watchdog() {
        let probe = Probe::default();
        let mut dog = Dog::default();
        let mut valve = Valve::init(probe.clone(), 0);
        valve.set(ValveState::Open, 0);

        valve.prepare_for_maintenance(&mut dog, 1_000);
        assert_eq!(valve.state(), ValveState::Closed);
        assert!(dog.suspended);
        assert_eq!(probe.log(), vec!["init", "OPEN", "CLOSED", "settle 500ms"]);

        // Nothing may open the valve while flashing.
        assert!(!valve.set(ValveState::Open, 2_000));

        valve.resume_after_maintenance(&mut dog, 3_000);
        assert!(!dog.suspended);
        assert_eq!(dog.resumes, 1);
        assert_eq!(valve.state(), ValveState::Closed);
        assert!(valve.set(ValveState::Open, 3_100));
    }

    #[test]
    fn state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&ValveState::Open).unwrap(), "\"OPEN\"");
        assert_eq!(ValveState::Closed.to_string(), "CLOSED");
    }
}
