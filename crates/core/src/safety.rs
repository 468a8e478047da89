//! Safety monitor: independent periodic checks, each with its own latch.
//!
//! | check        | raises when                               | clears when                    |
//! |--------------|-------------------------------------------|--------------------------------|
//! | daily limit  | usage > limit while OPEN                  | day rollover, acknowledge      |
//! | leak         | CLOSED and flow > 0.5 L/min               | condition false                |
//! | stagnation   | no OPEN for 30 h of valid wall time       | valve opens, acknowledge       |
//! | low battery  | smoothed voltage < minimum                | voltage > minimum + 0.2 V      |
//!
//! The checks run in a fixed order inside one tick: rollover, limit, leak,
//! stagnation, battery, scheduled reboot.
//!
//! A leak hovering right at the threshold can latch and clear repeatedly.
//! The latch still follows the condition, but a re-raise within
//! [`LEAK_REALARM_MS`] of the last reported one is silent: no event, no log
//! entry, and no "cleared" entry when it drops again.

use std::fmt;

use serde::Serialize;
use time::{Date, Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::events::{EventKind, EventLog};
use crate::scheduler::{Mode, Scheduler};
use crate::settings::Settings;
use crate::valve::{Valve, ValveOutput, ValveState};

pub const LEAK_LPM: f32 = 0.5;
pub const LEAK_REALARM_MS: u64 = 30_000;
pub const STAGNATION_LIMIT: Duration = Duration::hours(30);
pub const BATTERY_HYSTERESIS_V: f32 = 0.2;

/// A freshly restarted device must not restart again inside the same
/// reboot hour.
pub const MIN_UPTIME_FOR_REBOOT_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    DailyLimit,
    Leak,
    Stagnation,
    LowBattery,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alarm {
    pub kind: AlarmKind,
    pub message: String,
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Snapshot of the latches, for status reporting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActiveAlarms {
    pub daily_limit: bool,
    pub leak: bool,
    pub stagnation: bool,
    pub low_battery: bool,
}

/// Readings the monitor needs from the rest of the loop.
#[derive(Debug, Clone, Copy)]
pub struct SafetyInputs<'a> {
    pub now_ms: u64,
    pub calendar: Option<&'a OffsetDateTime>,
    /// Steady rate, see [`crate::flow::FlowMeter::steady_lpm`].
    pub flow_lpm: f32,
    pub battery_v: Option<f32>,
    pub settings: &'a Settings,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SafetyTick {
    pub raised: Vec<Alarm>,
    pub cleared: Vec<AlarmKind>,
    pub rollover: bool,
    /// A scheduled restart is due. The valve has already been closed.
    pub reboot: bool,
}

#[derive(Debug, Default)]
pub struct SafetyMonitor {
    alarms: ActiveAlarms,
    current_day: Option<Date>,
    last_open_wall: Option<OffsetDateTime>,
    reboot_requested: bool,
    leak_reported_ms: Option<u64>,
    /// The last reported leak has not had its "cleared" entry yet.
    leak_clear_owed: bool,
}

impl SafetyMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alarms(&self) -> ActiveAlarms {
        self.alarms
    }

    pub fn tick<O: ValveOutput>(
        &mut self,
        input: SafetyInputs<'_>,
        valve: &mut Valve<O>,
        scheduler: &mut Scheduler,
        log: &mut EventLog,
    ) -> SafetyTick {
        let mut out = SafetyTick::default();

        self.check_rollover(&input, valve, log, &mut out);
        self.check_daily_limit(&input, valve, scheduler, log, &mut out);
        self.check_leak(&input, valve, log, &mut out);
        self.check_stagnation(&input, valve, log, &mut out);
        self.check_battery(&input, log, &mut out);
        self.check_reboot(&input, valve, log, &mut out);

        out
    }

    /// Operator acknowledgment: resets the diagnostic line, the limit latch
    /// and the stagnation timer. Leak and battery latches follow their
    /// conditions only.
    pub fn acknowledge(&mut self, now: Option<OffsetDateTime>, log: &mut EventLog) {
        self.alarms.daily_limit = false;
        if self.alarms.stagnation {
            self.alarms.stagnation = false;
            self.last_open_wall = now;
        }
        log.clear_diag();
        log.system(EventKind::Info, "alarms acknowledged");
        info!("safety: alarms acknowledged");
    }

    // -- Checks -----------------------------------------------------------

    fn check_rollover<O: ValveOutput>(
        &mut self,
        input: &SafetyInputs<'_>,
        valve: &mut Valve<O>,
        log: &mut EventLog,
        out: &mut SafetyTick,
    ) {
        let Some(now) = input.calendar else {
            return;
        };
        let today = now.date();
        match self.current_day {
            Some(day) if day != today => {
                info!(used_sec = valve.daily_open_sec(), %today, "safety: day rollover, usage reset");
                log.system(
                    EventKind::Info,
                    format!("day rollover, yesterday {} s open", valve.daily_open_sec()),
                );
                valve.reset_daily_open_sec();
                if self.alarms.daily_limit {
                    self.alarms.daily_limit = false;
                    out.cleared.push(AlarmKind::DailyLimit);
                }
                out.rollover = true;
            }
            _ => {}
        }
        self.current_day = Some(today);
    }

    fn check_daily_limit<O: ValveOutput>(
        &mut self,
        input: &SafetyInputs<'_>,
        valve: &mut Valve<O>,
        scheduler: &mut Scheduler,
        log: &mut EventLog,
        out: &mut SafetyTick,
    ) {
        let used = valve.daily_open_sec();
        let limit = input.settings.daily_limit_sec();
        if used <= limit || !valve.is_open() {
            return;
        }

        scheduler.stop_with_mode(valve, input.now_ms, Mode::Manual);
        warn!(used_sec = used, limit_sec = limit, "safety: daily limit exceeded, valve forced CLOSED");

        if !self.alarms.daily_limit {
            self.alarms.daily_limit = true;
            let alarm = Alarm {
                kind: AlarmKind::DailyLimit,
                message: format!("ALARM: DAILY LIMIT ({used} s > {limit} s)"),
            };
            log.alarm(alarm.message.clone());
            out.raised.push(alarm);
        }
    }

    fn check_leak<O: ValveOutput>(
        &mut self,
        input: &SafetyInputs<'_>,
        valve: &Valve<O>,
        log: &mut EventLog,
        out: &mut SafetyTick,
    ) {
        let leaking = valve.is_settled_closed(input.now_ms) && input.flow_lpm > LEAK_LPM;
        if leaking && !self.alarms.leak {
            self.alarms.leak = true;
            let message = format!("ALARM: LEAK ({:.2} L/min with valve CLOSED)", input.flow_lpm);
            let quiet = self
                .leak_reported_ms
                .map_or(false, |t| input.now_ms.saturating_sub(t) < LEAK_REALARM_MS);
            if quiet {
                debug!(flow_lpm = input.flow_lpm, "safety: leak re-latched");
                log.set_diag(message);
                return;
            }
            self.leak_reported_ms = Some(input.now_ms);
            self.leak_clear_owed = true;
            warn!(flow_lpm = input.flow_lpm, "safety: leak detected");
            log.alarm(message.clone());
            out.raised.push(Alarm {
                kind: AlarmKind::Leak,
                message,
            });
        } else if !leaking && self.alarms.leak {
            self.alarms.leak = false;
            clear_diag_if(log, "ALARM: LEAK");
            if std::mem::take(&mut self.leak_clear_owed) {
                info!(flow_lpm = input.flow_lpm, "safety: leak cleared");
                log.system(EventKind::Info, "leak cleared");
                out.cleared.push(AlarmKind::Leak);
            }
        }
    }

    fn check_stagnation<O: ValveOutput>(
        &mut self,
        input: &SafetyInputs<'_>,
        valve: &Valve<O>,
        log: &mut EventLog,
        out: &mut SafetyTick,
    ) {
        let Some(now) = input.calendar else {
            return;
        };

        if valve.is_open() {
            self.last_open_wall = Some(*now);
            if self.alarms.stagnation {
                self.alarms.stagnation = false;
                info!("safety: stagnation cleared, valve opened");
                clear_diag_if(log, "ALARM: STAGNATION");
                out.cleared.push(AlarmKind::Stagnation);
            }
            return;
        }

        let since = *self.last_open_wall.get_or_insert(*now);
        let idle = *now - since;
        if idle > STAGNATION_LIMIT && !self.alarms.stagnation {
            self.alarms.stagnation = true;
            warn!(idle_h = idle.whole_hours(), "safety: valve stagnation");
            let alarm = Alarm {
                kind: AlarmKind::Stagnation,
                message: format!("ALARM: STAGNATION (valve not opened for {} h)", idle.whole_hours()),
            };
            log.alarm(alarm.message.clone());
            out.raised.push(alarm);
        }
    }

    fn check_battery(&mut self, input: &SafetyInputs<'_>, log: &mut EventLog, out: &mut SafetyTick) {
        let min = input.settings.bat_min();
        let Some(volts) = input.battery_v else {
            return;
        };
        if min <= 0.0 {
            return;
        }

        if volts < min && !self.alarms.low_battery {
            self.alarms.low_battery = true;
            warn!(battery_v = volts, min_v = min, "safety: low battery");
            let alarm = Alarm {
                kind: AlarmKind::LowBattery,
                message: format!("ALARM: LOW BATTERY ({volts:.2}V)"),
            };
            log.alarm(alarm.message.clone());
            out.raised.push(alarm);
        } else if volts > min + BATTERY_HYSTERESIS_V && self.alarms.low_battery {
            self.alarms.low_battery = false;
            info!(battery_v = volts, "safety: battery recovered");
            clear_diag_if(log, "ALARM: LOW BATTERY");
            log.system(EventKind::Info, format!("battery recovered ({volts:.2}V)"));
            out.cleared.push(AlarmKind::LowBattery);
        }
    }

    fn check_reboot<O: ValveOutput>(
        &mut self,
        input: &SafetyInputs<'_>,
        valve: &mut Valve<O>,
        log: &mut EventLog,
        out: &mut SafetyTick,
    ) {
        if self.reboot_requested || input.now_ms < MIN_UPTIME_FOR_REBOOT_MS {
            return;
        }
        let (Some(hour), Some(now)) = (input.settings.reboot_hour(), input.calendar) else {
            return;
        };
        if now.hour() != hour || valve.is_open() {
            return;
        }

        self.reboot_requested = true;
        valve.set(ValveState::Closed, input.now_ms);
        info!(hour, "safety: scheduled reboot due");
        log.system(EventKind::Info, format!("scheduled reboot ({hour:02}:00)"));
        out.reboot = true;
    }
}

fn clear_diag_if(log: &mut EventLog, prefix: &str) {
    if log.last_diag().starts_with(prefix) {
        log.clear_diag();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use time::macros::datetime;

    #[derive(Default)]
    struct NullOutput;

    impl ValveOutput for NullOutput {
        fn init_closed(&mut self) {}
        fn drive(&mut self, _state: ValveState) {}
        fn settle(&mut self, _duration: std::time::Duration) {}
    }

    struct Rig {
        monitor: SafetyMonitor,
        valve: Valve<NullOutput>,
        scheduler: Scheduler,
        log: EventLog,
        settings: Settings,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                monitor: SafetyMonitor::new(),
                valve: Valve::init(NullOutput, 0),
                scheduler: Scheduler::default(),
                log: EventLog::new(),
                settings: Settings::default(),
            }
        }

        fn tick(
            &mut self,
            now_ms: u64,
            calendar: Option<OffsetDateTime>,
            flow_lpm: f32,
            battery_v: Option<f32>,
        ) -> SafetyTick {
            self.valve.tick(now_ms);
            let input = SafetyInputs {
                now_ms,
                calendar: calendar.as_ref(),
                flow_lpm,
                battery_v,
                settings: &self.settings,
            };
            self.monitor
                .tick(input, &mut self.valve, &mut self.scheduler, &mut self.log)
        }
    }

    const NOON: OffsetDateTime = datetime!(2024-06-02 12:00:00 UTC);

    // -- Daily limit ------------------------------------------------------

    #[test]
    fn limit_exceeded_closes_forces_manual_and_alarms_once() {
        let mut rig = Rig::new();
        rig.scheduler.start(3_600, &mut rig.valve, 0);
        rig.valve.tick(901_000);
        assert_eq!(rig.valve.daily_open_sec(), 901);

        let t = rig.tick(901_000, Some(NOON), 0.0, None);
        assert!(!rig.valve.is_open());
        assert!(!rig.scheduler.is_running());
        assert_eq!(rig.scheduler.mode(), Mode::Manual);
        assert_eq!(t.raised.len(), 1);
        assert_eq!(t.raised[0].kind, AlarmKind::DailyLimit);
        assert!(rig.log.last_diag().contains("LIMIT"));

        let t = rig.tick(901_100, Some(NOON), 0.0, None);
        assert!(t.raised.is_empty(), "limit alarm must not repeat");

        // Reopening the same day is closed again without a second alarm.
        rig.valve.set(ValveState::Open, 902_000);
        let t = rig.tick(902_100, Some(NOON), 0.0, None);
        assert!(!rig.valve.is_open());
        assert!(t.raised.is_empty());
    }

    #[test]
    fn at_limit_is_not_exceeded() {
        let mut rig = Rig::new();
        rig.valve.set(ValveState::Open, 0);
        let t = rig.tick(900_000, Some(NOON), 5.0, None);
        assert!(rig.valve.is_open());
        assert!(t.raised.is_empty());
    }

    #[test]
    fn rollover_resets_usage_and_limit_latch() {
        let mut rig = Rig::new();
        rig.valve.set(ValveState::Open, 0);
        rig.tick(901_000, Some(NOON), 0.0, None);
        assert!(rig.monitor.alarms().daily_limit);

        let t = rig.tick(902_000, Some(datetime!(2024-06-03 00:00:01 UTC)), 0.0, None);
        assert!(t.rollover);
        assert!(t.cleared.contains(&AlarmKind::DailyLimit));
        assert_eq!(rig.valve.daily_open_sec(), 0);
        assert!(!rig.monitor.alarms().daily_limit);
    }

    #[test]
    fn no_rollover_without_valid_clock() {
        let mut rig = Rig::new();
        assert!(!rig.tick(0, Some(NOON), 0.0, None).rollover);
        assert!(!rig.tick(1_000, None, 0.0, None).rollover);
        assert!(!rig.tick(2_000, Some(NOON), 0.0, None).rollover);
    }

    // -- Leak -------------------------------------------------------------

    #[test]
    fn leak_raises_and_clears_with_condition() {
        let mut rig = Rig::new();
        let t = rig.tick(0, None, 0.6, None);
        assert_eq!(t.raised.len(), 1);
        assert!(t.raised[0].message.contains("LEAK"));
        assert!(rig.monitor.alarms().leak);
        assert!(rig.log.last_diag().contains("LEAK"));

        let t = rig.tick(100, None, 0.6, None);
        assert!(t.raised.is_empty());

        let t = rig.tick(200, None, 0.3, None);
        assert_eq!(t.cleared, vec![AlarmKind::Leak]);
        assert!(!rig.monitor.alarms().leak);
        assert_eq!(rig.log.last_diag(), "OK");
    }

    #[test]
    fn leak_hovering_at_threshold_reports_once_per_interval() {
        let mut rig = Rig::new();
        let readings = [0.53, 0.4, 0.53, 0.4, 0.4, 0.53];
        let mut raised = 0;
        let mut cleared = 0;
        for (i, lpm) in readings.into_iter().cycle().take(60).enumerate() {
            let t = rig.tick(i as u64 * 100, None, lpm, None);
            raised += t.raised.len();
            cleared += t.cleared.len();
        }
        assert_eq!((raised, cleared), (1, 1));
        assert!(rig.monitor.alarms().leak, "latch still follows the last reading");
        assert!(rig.log.last_diag().contains("LEAK"));

        let entries = rig.log.system_entries();
        assert_eq!(entries.iter().filter(|e| e.detail.contains("LEAK")).count(), 1);
        assert_eq!(entries.iter().filter(|e| e.detail == "leak cleared").count(), 1);

        // Past the interval a fresh leak is reported again.
        rig.tick(LEAK_REALARM_MS + 10_000, None, 0.0, None);
        let t = rig.tick(LEAK_REALARM_MS + 10_100, None, 0.6, None);
        assert_eq!(t.raised.len(), 1);
    }

    #[test]
    fn opening_clears_leak() {
        let mut rig = Rig::new();
        rig.tick(0, None, 0.6, None);
        rig.valve.set(ValveState::Open, 100);
        let t = rig.tick(100, None, 6.0, None);
        assert_eq!(t.cleared, vec![AlarmKind::Leak]);
    }

    #[test]
    fn flow_with_open_valve_is_not_a_leak() {
        let mut rig = Rig::new();
        rig.valve.set(ValveState::Open, 0);
        assert!(rig.tick(0, None, 8.0, None).raised.is_empty());
    }

    // -- Stagnation -------------------------------------------------------

    #[test]
    fn stagnation_after_thirty_idle_hours() {
        let mut rig = Rig::new();
        rig.tick(0, Some(NOON), 0.0, None);

        let t = rig.tick(1_000, Some(NOON + Duration::hours(30)), 0.0, None);
        assert!(t.raised.is_empty());

        let t = rig.tick(2_000, Some(NOON + Duration::hours(30) + Duration::minutes(1)), 0.0, None);
        assert_eq!(t.raised[0].kind, AlarmKind::Stagnation);
        assert!(rig.log.last_diag().contains("STAGNATION"));
    }

    #[test]
    fn opening_resets_stagnation() {
        let mut rig = Rig::new();
        rig.tick(0, Some(NOON), 0.0, None);
        rig.tick(1_000, Some(NOON + Duration::hours(31)), 0.0, None);
        assert!(rig.monitor.alarms().stagnation);

        rig.valve.set(ValveState::Open, 2_000);
        let t = rig.tick(2_000, Some(NOON + Duration::hours(31)), 3.0, None);
        assert_eq!(t.cleared, vec![AlarmKind::Stagnation]);

        rig.valve.set(ValveState::Closed, 3_000);
        let t = rig.tick(3_000, Some(NOON + Duration::hours(60)), 0.0, None);
        assert!(t.raised.is_empty());
    }

    #[test]
    fn stagnation_needs_valid_clock() {
        let mut rig = Rig::new();
        for i in 0..5 {
            assert!(rig.tick(i * 1_000, None, 0.0, None).raised.is_empty());
        }
        assert!(!rig.monitor.alarms().stagnation);
    }

    // -- Battery ----------------------------------------------------------

    #[test]
    fn battery_alarm_uses_hysteresis() {
        let mut rig = Rig::new();
        assert!(rig.tick(0, None, 0.0, Some(3.8)).raised.is_empty());

        let t = rig.tick(100, None, 0.0, Some(3.2));
        assert_eq!(t.raised[0].kind, AlarmKind::LowBattery);
        assert_eq!(t.raised[0].message, "ALARM: LOW BATTERY (3.20V)");

        let t = rig.tick(200, None, 0.0, Some(3.1));
        assert!(t.raised.is_empty(), "raised once");

        let t = rig.tick(300, None, 0.0, Some(3.4));
        assert!(t.cleared.is_empty());
        assert!(rig.monitor.alarms().low_battery);

        let t = rig.tick(400, None, 0.0, Some(3.6));
        assert_eq!(t.cleared, vec![AlarmKind::LowBattery]);
        assert!(!rig.monitor.alarms().low_battery);
    }

    #[test]
    fn battery_check_disabled_without_sample_or_threshold() {
        let mut rig = Rig::new();
        assert!(rig.tick(0, None, 0.0, None).raised.is_empty());
        let mut store = MemoryStore::new();
        rig.settings.set_bat_min(&mut store, 0.0);
        assert!(rig.tick(100, None, 0.0, Some(1.0)).raised.is_empty());
    }

    // -- Scheduled reboot -------------------------------------------------

    fn rig_with_reboot_hour(hour: i64) -> Rig {
        let mut rig = Rig::new();
        let mut store = MemoryStore::new();
        rig.settings.set_reboot_hour(&mut store, hour);
        rig
    }

    #[test]
    fn reboot_fires_in_configured_hour_once() {
        let mut rig = rig_with_reboot_hour(3);
        let three = datetime!(2024-06-02 03:10:00 UTC);
        assert!(rig.tick(MIN_UPTIME_FOR_REBOOT_MS, Some(three), 0.0, None).reboot);
        assert!(!rig.tick(MIN_UPTIME_FOR_REBOOT_MS + 100, Some(three), 0.0, None).reboot);
    }

    #[test]
    fn reboot_waits_for_valve_to_close() {
        let mut rig = rig_with_reboot_hour(3);
        let three = datetime!(2024-06-02 03:10:00 UTC);
        rig.valve.set(ValveState::Open, MIN_UPTIME_FOR_REBOOT_MS - 1_000);
        assert!(!rig.tick(MIN_UPTIME_FOR_REBOOT_MS, Some(three), 4.0, None).reboot);
        rig.valve.set(ValveState::Closed, MIN_UPTIME_FOR_REBOOT_MS);
        assert!(rig.tick(MIN_UPTIME_FOR_REBOOT_MS + 100, Some(three), 0.0, None).reboot);
    }

    #[test]
    fn reboot_skipped_right_after_boot() {
        let mut rig = rig_with_reboot_hour(3);
        let three = datetime!(2024-06-02 03:00:30 UTC);
        assert!(!rig.tick(30_000, Some(three), 0.0, None).reboot);
    }

    #[test]
    fn reboot_disabled_by_default() {
        let mut rig = Rig::new();
        let t = rig.tick(MIN_UPTIME_FOR_REBOOT_MS, Some(datetime!(2024-06-02 00:00:00 UTC)), 0.0, None);
        assert!(!t.reboot);
    }

    // -- Acknowledge ------------------------------------------------------

    #[test]
    fn acknowledge_clears_diag_and_limit_latch() {
        let mut rig = Rig::new();
        rig.valve.set(ValveState::Open, 0);
        rig.tick(901_000, Some(NOON), 0.0, None);
        assert_ne!(rig.log.last_diag(), "OK");

        rig.monitor.acknowledge(Some(NOON), &mut rig.log);
        assert_eq!(rig.log.last_diag(), "OK");
        assert!(!rig.monitor.alarms().daily_limit);
    }
}
