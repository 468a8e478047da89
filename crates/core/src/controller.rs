//! Top-level composition: owns one instance of every component and runs
//! them in a fixed order once per loop iteration.
//!
//! ```text
//!  tick:  watchdog.feed
//!         flow.tick ─▶ battery.tick ─▶ valve.tick ─▶ scheduler.tick ─▶ safety.tick
//!         observe valve transitions ─▶ history point ─▶ persist liter total
//! ```
//!
//! The controller is synchronous and never blocks except for the relay
//! settle time on the maintenance path. Boundaries (MQTT, HTTP) wrap it in
//! a mutex and call `tick` from a timer.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::battery::{BatteryMonitor, BatterySensor};
use crate::clock::Clock;
use crate::events::{EventKind, EventLog, LogEntry};
use crate::flow::{FlowMeter, OverflowPolicy, PulseCounter};
use crate::safety::{AlarmKind, SafetyInputs, SafetyMonitor};
use crate::scheduler::{IrrigationSlot, Mode, Scheduler, MAX_RUN_SEC, MAX_SLOTS};
use crate::settings::{Settings, SettingsUpdate, KEY_FLOW_TOTAL};
use crate::store::{SettingsStore, Value};
use crate::telemetry::{Command, DeviceEvent, EventName, HistoryPoint, StatusSnapshot};
use crate::valve::{Valve, ValveOutput, ValveState, Watchdog};

pub const HISTORY_INTERVAL_MS: u64 = 60_000;

/// Everything the controller talks to outside of its own memory.
pub struct Hardware {
    pub output: Box<dyn ValveOutput + Send>,
    pub battery: Box<dyn BatterySensor + Send>,
    pub clock: Box<dyn Clock + Send>,
    pub store: Box<dyn SettingsStore + Send>,
    pub watchdog: Box<dyn Watchdog + Send>,
    /// Shared with the pulse interrupt.
    pub pulses: Arc<PulseCounter>,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    pub overflow_policy: OverflowPolicy,
    /// How often the lifetime liter total is written to the store.
    pub total_persist_interval_ms: u64,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            overflow_policy: OverflowPolicy::Discard,
            total_persist_interval_ms: 10 * 60_000,
        }
    }
}

/// Work for the boundaries produced by one tick.
#[derive(Debug, Default)]
pub struct TickOutput {
    pub events: Vec<DeviceEvent>,
    pub history: Vec<HistoryPoint>,
    /// A scheduled restart is due. The valve is closed and totals are
    /// persisted; the caller performs the restart.
    pub reboot: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub uptime_s: u64,
    pub time_valid: bool,
    pub battery_v: Option<f32>,
    pub vbat_raw: Option<f32>,
    pub battery_read_errors: u32,
    pub flow_lpm: f32,
    pub flow_overcounts: u32,
    pub last_pulse_age_ms: u64,
    pub valve: ValveState,
    pub valve_transitions: u32,
    pub maintenance: bool,
    pub diag: String,
}

pub struct Controller {
    clock: Box<dyn Clock + Send>,
    store: Box<dyn SettingsStore + Send>,
    watchdog: Box<dyn Watchdog + Send>,
    settings: Settings,
    flow: FlowMeter,
    battery: BatteryMonitor<Box<dyn BatterySensor + Send>>,
    valve: Valve<Box<dyn ValveOutput + Send>>,
    scheduler: Scheduler,
    safety: SafetyMonitor,
    log: EventLog,
    options: ControllerOptions,

    /// Valve state as of the last transition bookkeeping.
    seen_state: ValveState,
    run_start_total: f64,
    last_history_ms: Option<u64>,
    last_persist_ms: u64,
    persisted_total: f64,
    outbox: Vec<DeviceEvent>,
    history: Vec<HistoryPoint>,
}

impl Controller {
    pub fn new(hw: Hardware, options: ControllerOptions) -> Self {
        let now_ms = hw.clock.monotonic_millis();

        let settings = Settings::load(&hw.store);
        let scheduler = Scheduler::load(&hw.store);
        let persisted_total = hw.store.get_float(KEY_FLOW_TOTAL, 0.0);
        let mut flow = FlowMeter::new(hw.pulses, options.overflow_policy, now_ms);
        flow.restore_total(persisted_total);

        let valve = Valve::init(hw.output, now_ms);
        let mut log = EventLog::new();
        log.stamp(now_ms, hw.clock.calendar());
        log.system(EventKind::Info, "boot");

        info!(
            total_l = flow.total_liters(),
            policy = ?options.overflow_policy,
            "controller ready"
        );

        Self {
            clock: hw.clock,
            store: hw.store,
            watchdog: hw.watchdog,
            settings,
            flow,
            battery: BatteryMonitor::new(hw.battery),
            valve,
            scheduler,
            safety: SafetyMonitor::new(),
            log,
            options,
            seen_state: ValveState::Closed,
            run_start_total: 0.0,
            last_history_ms: None,
            last_persist_ms: now_ms,
            persisted_total: flow_total_or_zero(persisted_total),
            outbox: Vec::new(),
            history: Vec::new(),
        }
    }

    // -- Loop -------------------------------------------------------------

    pub fn tick(&mut self) -> TickOutput {
        let now_ms = self.clock.monotonic_millis();
        let calendar = self.clock.calendar();
        self.watchdog.feed();
        self.log.stamp(now_ms, calendar);

        if let Some(fault) = self.flow.tick(now_ms, self.settings.flow_factor()) {
            self.log.system(
                EventKind::Warn,
                format!("flow overcount: {} pulses in window, kept {}", fault.pulses, fault.kept),
            );
        }
        self.battery.tick(now_ms, self.settings.bat_factor());
        self.valve.tick(now_ms);

        // Alarm checks judge the steady rate, not one noisy window, and only
        // from flow seen since the valve settled closed.
        if !self.valve.is_settled_closed(now_ms) {
            self.flow.reset_steady();
        }
        let lpm = self.flow.steady_lpm();
        let sched = self
            .scheduler
            .tick(now_ms, calendar.as_ref(), lpm, &mut self.valve);
        if let Some(anomaly) = sched.anomaly_lpm {
            let detail = format!("ANOMALY: flow {anomaly:.2} L/min with valve CLOSED");
            self.log.system(EventKind::Warn, detail.clone());
            self.outbox
                .push(DeviceEvent::new(EventName::Anomaly, now_ms).with_detail(detail));
        }
        if let Some(index) = sched.triggered {
            self.log
                .system(EventKind::Info, format!("slot {} started", index + 1));
        }

        let safety = self.safety.tick(
            SafetyInputs {
                now_ms,
                calendar: calendar.as_ref(),
                flow_lpm: lpm,
                battery_v: self.battery.voltage(),
                settings: &self.settings,
            },
            &mut self.valve,
            &mut self.scheduler,
            &mut self.log,
        );
        for alarm in safety.raised {
            let name = match alarm.kind {
                AlarmKind::DailyLimit => EventName::AlarmLimit,
                AlarmKind::Leak => EventName::AlarmLeak,
                AlarmKind::Stagnation => EventName::AlarmStagnation,
                AlarmKind::LowBattery => EventName::AlarmBattery,
            };
            self.outbox
                .push(DeviceEvent::new(name, now_ms).with_detail(alarm.message));
        }

        self.observe_valve(now_ms, calendar);

        if calendar.is_some() {
            let due = self
                .last_history_ms
                .map_or(true, |t| now_ms.saturating_sub(t) >= HISTORY_INTERVAL_MS);
            if due {
                self.push_history(now_ms, calendar);
            }
        }

        if safety.reboot {
            self.outbox
                .push(DeviceEvent::new(EventName::RebootScheduled, now_ms));
            self.persist_total(now_ms);
        } else if now_ms.saturating_sub(self.last_persist_ms) >= self.options.total_persist_interval_ms {
            self.persist_total(now_ms);
        }

        TickOutput {
            events: std::mem::take(&mut self.outbox),
            history: std::mem::take(&mut self.history),
            reboot: safety.reboot,
        }
    }

    /// Book-keeping for valve transitions, wherever they came from.
    fn observe_valve(&mut self, now_ms: u64, calendar: Option<OffsetDateTime>) {
        let state = self.valve.state();
        if state == self.seen_state {
            return;
        }
        self.seen_state = state;
        let total = self.flow.total_liters();

        match state {
            ValveState::Open => {
                self.run_start_total = total;
                self.log.flow("START Valve Open");
                self.outbox
                    .push(DeviceEvent::new(EventName::ValveOpen, now_ms));
            }
            ValveState::Closed => {
                let run_l = (total - self.run_start_total).max(0.0);
                self.log
                    .flow(format!("STOP Valve Closed (Total: {run_l:.1} L)"));
                let mut event = DeviceEvent::new(EventName::ValveClose, now_ms);
                event.last_run_l = Some(run_l);
                self.outbox.push(event);
            }
        }

        if calendar.is_some() {
            self.push_history(now_ms, calendar);
        }
    }

    fn push_history(&mut self, now_ms: u64, calendar: Option<OffsetDateTime>) {
        let Some(at) = calendar else {
            return;
        };
        self.last_history_ms = Some(now_ms);
        self.history.push(HistoryPoint {
            ts: at.unix_timestamp(),
            flow_l_min: self.flow.lpm(),
            total_l: self.flow.total_liters(),
            vbat: self.battery.voltage(),
            valve: self.valve.state(),
        });
    }

    fn persist_total(&mut self, now_ms: u64) {
        self.last_persist_ms = now_ms;
        let total = self.flow.total_liters();
        if total == self.persisted_total {
            return;
        }
        match self.store.set(KEY_FLOW_TOTAL, Value::Float(total)) {
            Ok(()) => self.persisted_total = total,
            Err(e) => warn!("controller: persisting flow total failed: {e:#}"),
        }
    }

    // -- Commands ---------------------------------------------------------

    /// Apply an operator command. OPEN and CLOSE force MANUAL mode.
    pub fn handle_command(&mut self, cmd: Command) -> Result<(), String> {
        let now_ms = self.clock.monotonic_millis();
        self.log.stamp(now_ms, self.clock.calendar());
        info!(?cmd, "controller: command");

        let result = match cmd {
            Command::Open { .. } if self.valve.in_maintenance() => {
                Err("valve is in maintenance".to_string())
            }
            Command::Open { duration_sec } => {
                self.scheduler.set_mode(Mode::Manual);
                self.scheduler
                    .start(duration_sec.unwrap_or(MAX_RUN_SEC), &mut self.valve, now_ms);
                Ok(())
            }
            Command::Close => {
                self.scheduler
                    .stop_with_mode(&mut self.valve, now_ms, Mode::Manual);
                Ok(())
            }
            Command::SetAuto => {
                self.scheduler.set_mode(Mode::Auto);
                Ok(())
            }
            Command::SetManual => {
                self.scheduler.set_mode(Mode::Manual);
                Ok(())
            }
        };

        match &result {
            Ok(()) => self.log.system(EventKind::Info, format!("command {cmd:?}")),
            Err(e) => self.log.system(EventKind::Warn, format!("command {cmd:?} refused: {e}")),
        }
        self.observe_valve(now_ms, self.clock.calendar());
        result
    }

    // -- Slots ------------------------------------------------------------

    pub fn slots(&self) -> [IrrigationSlot; MAX_SLOTS] {
        *self.scheduler.slots()
    }

    /// Replace slots in RAM and persist the whole table once.
    pub fn update_slots(&mut self, updates: &[(usize, IrrigationSlot)]) -> anyhow::Result<usize> {
        let mut applied = 0;
        for &(index, slot) in updates {
            if self.scheduler.update_slot(index, slot) {
                applied += 1;
            } else {
                warn!(index, "controller: slot update ignored");
            }
        }
        self.scheduler.save_to_store(&mut self.store)?;
        self.log
            .system(EventKind::Info, format!("{applied} slot(s) updated"));
        Ok(applied)
    }

    // -- Settings & alarms ------------------------------------------------

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn apply_settings(&mut self, update: &SettingsUpdate) {
        self.settings.apply(&mut self.store, update);
        self.log.system(EventKind::Info, "settings changed");
    }

    pub fn acknowledge_alarms(&mut self) {
        let now = self.clock.calendar();
        self.safety.acknowledge(now, &mut self.log);
    }

    // -- Maintenance & restart --------------------------------------------

    pub fn enter_maintenance(&mut self) {
        let now_ms = self.clock.monotonic_millis();
        self.scheduler.stop_with_mode(&mut self.valve, now_ms, Mode::Manual);
        self.valve
            .prepare_for_maintenance(&mut self.watchdog, now_ms);
        self.log.system(EventKind::Warn, "maintenance started");
        self.observe_valve(now_ms, self.clock.calendar());
    }

    pub fn leave_maintenance(&mut self) {
        let now_ms = self.clock.monotonic_millis();
        self.valve
            .resume_after_maintenance(&mut self.watchdog, now_ms);
        self.log.system(EventKind::Info, "maintenance finished");
    }

    /// Close the valve and flush the liter total before the process goes
    /// away.
    pub fn prepare_restart(&mut self) -> anyhow::Result<()> {
        let now_ms = self.clock.monotonic_millis();
        let mode = self.scheduler.mode();
        self.scheduler.stop_with_mode(&mut self.valve, now_ms, mode);
        self.observe_valve(now_ms, self.clock.calendar());
        self.log.system(EventKind::Info, "restart");
        let total = self.flow.total_liters();
        self.store.set(KEY_FLOW_TOTAL, Value::Float(total))?;
        self.persisted_total = total;
        info!(total_l = total, "controller: ready for restart");
        Ok(())
    }

    // -- Read side --------------------------------------------------------

    pub fn status(&self) -> StatusSnapshot {
        let now_ms = self.clock.monotonic_millis();
        StatusSnapshot {
            valve: self.valve.state(),
            flow_lpm: self.flow.lpm(),
            flow_total_l: self.flow.total_liters(),
            battery_v: self.battery.voltage(),
            irr_mode: self.scheduler.mode(),
            irr_running: self.scheduler.is_running(),
            remaining_s: self.scheduler.remaining_sec(now_ms),
            daily_open_s: self.valve.daily_open_sec(),
            daily_limit_s: self.settings.daily_limit_sec(),
            alarms: self.safety.alarms(),
            diag: self.log.last_diag().to_string(),
            time_valid: self.clock.is_valid(),
            uptime_s: now_ms / 1000,
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            uptime_s: self.clock.monotonic_millis() / 1000,
            time_valid: self.clock.is_valid(),
            battery_v: self.battery.voltage(),
            vbat_raw: self.battery.raw_pin_volts(),
            battery_read_errors: self.battery.read_errors(),
            flow_lpm: self.flow.lpm(),
            flow_overcounts: self.flow.overcounts(),
            last_pulse_age_ms: self.flow.last_pulse_age_ms(self.clock.monotonic_micros()),
            valve: self.valve.state(),
            valve_transitions: self.valve.transitions(),
            maintenance: self.valve.in_maintenance(),
            diag: self.log.last_diag().to_string(),
        }
    }

    pub fn system_events(&self) -> Vec<LogEntry> {
        self.log.system_entries()
    }

    pub fn flow_events(&self) -> Vec<LogEntry> {
        self.log.flow_entries()
    }

    pub fn valve_state(&self) -> ValveState {
        self.valve.state()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.clock.monotonic_millis()
    }
}

fn flow_total_or_zero(v: f64) -> f64 {
    if v.is_finite() && v >= 0.0 {
        v
    } else {
        0.0
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use time::macros::datetime;

    // -- Fakes ------------------------------------------------------------

    #[derive(Clone, Default)]
    struct SharedStore(Arc<Mutex<MemoryStore>>);

    impl SettingsStore for SharedStore {
        fn get(&self, key: &str) -> Option<Value> {
            self.0.lock().unwrap().get(key)
        }

        fn set(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
            self.0.lock().unwrap().set(key, value)
        }
    }

    #[derive(Clone, Default)]
    struct Relay(Arc<Mutex<Vec<ValveState>>>);

    impl ValveOutput for Relay {
        fn init_closed(&mut self) {}

        fn drive(&mut self, state: ValveState) {
            self.0.lock().unwrap().push(state);
        }

        fn settle(&mut self, _duration: std::time::Duration) {}
    }

    struct FixedBattery(f32);

    impl BatterySensor for FixedBattery {
        fn read_pin_volts(&mut self) -> anyhow::Result<f32> {
            Ok(self.0)
        }
    }

    #[derive(Clone, Default)]
    struct CountingDog {
        feeds: Arc<AtomicU32>,
        suspended: Arc<AtomicU32>,
    }

    impl Watchdog for CountingDog {
        fn feed(&mut self) {
            self.feeds.fetch_add(1, Ordering::SeqCst);
        }

        fn suspend(&mut self) {
            self.suspended.store(1, Ordering::SeqCst);
        }

        fn resume(&mut self) {
            self.suspended.store(0, Ordering::SeqCst);
        }
    }

    const TICK_MS: u64 = 50;

    struct Rig {
        ctl: Controller,
        clock: ManualClock,
        store: SharedStore,
        relay: Relay,
        dog: CountingDog,
        pulses: Arc<PulseCounter>,
    }

    impl Rig {
        fn with(clock: ManualClock, store: SharedStore) -> Self {
            let relay = Relay::default();
            let dog = CountingDog::default();
            let pulses = Arc::new(PulseCounter::new());
            let hw = Hardware {
                output: Box::new(relay.clone()),
                // 0.6 V at the pin × 6.47 ≈ 3.9 V.
                battery: Box::new(FixedBattery(0.6)),
                clock: Box::new(clock.clone()),
                store: Box::new(store.clone()),
                watchdog: Box::new(dog.clone()),
                pulses: pulses.clone(),
            };
            let options = ControllerOptions {
                total_persist_interval_ms: 60_000,
                ..ControllerOptions::default()
            };
            Self {
                ctl: Controller::new(hw, options),
                clock,
                store,
                relay,
                dog,
                pulses,
            }
        }

        fn new() -> Self {
            Self::with(
                ManualClock::new(datetime!(2024-06-02 12:00:00 UTC)),
                SharedStore::default(),
            )
        }

        /// Feed `count` edges 1 ms apart, then let `window_ms` pass.
        fn flow(&mut self, count: u32, window_ms: u64) {
            let base = self.clock.monotonic_micros() + 1_000;
            for i in 0..u64::from(count) {
                self.pulses.on_pulse_edge(base + i * 1_000);
            }
            self.clock.advance_ms(window_ms);
        }

        /// Run the loop at the default 50 ms cadence for `duration_ms`, with
        /// one edge every `spacing_ms` when given.
        fn trickle(&mut self, spacing_ms: Option<u64>, duration_ms: u64) -> Vec<TickOutput> {
            let start = self.clock.monotonic_millis();
            let mut next_edge = start + spacing_ms.unwrap_or(0);
            let mut outs = Vec::new();
            for _ in 0..duration_ms / TICK_MS {
                self.clock.advance_ms(TICK_MS);
                let now = self.clock.monotonic_millis();
                if let Some(spacing) = spacing_ms {
                    while next_edge <= now {
                        self.pulses.on_pulse_edge(next_edge * 1_000);
                        next_edge += spacing;
                    }
                }
                outs.push(self.ctl.tick());
            }
            outs
        }

        fn count(outs: &[TickOutput], name: EventName) -> usize {
            outs.iter()
                .flat_map(|o| o.events.iter())
                .filter(|e| e.event == name)
                .count()
        }

        fn names(out: &TickOutput) -> Vec<EventName> {
            out.events.iter().map(|e| e.event).collect()
        }
    }

    // -- Valve bookkeeping ------------------------------------------------

    #[test]
    fn open_then_close_reports_run_liters() {
        let mut rig = Rig::new();
        rig.ctl
            .handle_command(Command::Open { duration_sec: Some(600) })
            .unwrap();
        assert_eq!(rig.ctl.status().irr_mode, Mode::Manual);

        rig.flow(450, 1_000);
        let out = rig.ctl.tick();
        assert_eq!(Rig::names(&out), vec![EventName::ValveOpen]);
        assert!((rig.ctl.status().flow_total_l - 1.0).abs() < 1e-6);

        rig.ctl.handle_command(Command::Close).unwrap();
        let out = rig.ctl.tick();
        let close = &out.events[0];
        assert_eq!(close.event, EventName::ValveClose);
        assert!((close.last_run_l.unwrap() - 1.0).abs() < 1e-6);

        let flow_log = rig.ctl.flow_events();
        assert_eq!(flow_log[0].detail, "STOP Valve Closed (Total: 1.0 L)");
        assert_eq!(flow_log[1].detail, "START Valve Open");
        assert_eq!(*rig.relay.0.lock().unwrap(), vec![ValveState::Open, ValveState::Closed]);
    }

    #[test]
    fn remote_close_stays_manual_natural_end_reverts_to_auto() {
        let mut rig = Rig::new();
        rig.ctl
            .handle_command(Command::Open { duration_sec: Some(10) })
            .unwrap();
        rig.ctl.handle_command(Command::Close).unwrap();
        assert_eq!(rig.ctl.status().irr_mode, Mode::Manual);

        rig.ctl
            .handle_command(Command::Open { duration_sec: Some(10) })
            .unwrap();
        rig.clock.advance_ms(10_000);
        rig.ctl.tick();
        let status = rig.ctl.status();
        assert_eq!(status.valve, ValveState::Closed);
        assert_eq!(status.irr_mode, Mode::Auto);
    }

    #[test]
    fn open_without_duration_uses_ceiling() {
        let mut rig = Rig::new();
        rig.ctl
            .handle_command(Command::Open { duration_sec: None })
            .unwrap();
        assert_eq!(rig.ctl.status().remaining_s, MAX_RUN_SEC);
    }

    // -- Safety through the loop ------------------------------------------

    #[test]
    fn daily_limit_closes_once_with_one_alarm() {
        let mut rig = Rig::new();
        rig.ctl
            .handle_command(Command::Open { duration_sec: Some(3_600) })
            .unwrap();
        rig.ctl.tick();

        rig.clock.advance_ms(901_000);
        let out = rig.ctl.tick();
        let names = Rig::names(&out);
        assert_eq!(
            names.iter().filter(|n| **n == EventName::AlarmLimit).count(),
            1
        );
        assert!(names.contains(&EventName::ValveClose));

        let status = rig.ctl.status();
        assert_eq!(status.valve, ValveState::Closed);
        assert_eq!(status.irr_mode, Mode::Manual);
        assert!(status.alarms.daily_limit);

        rig.clock.advance_ms(100);
        assert!(!Rig::names(&rig.ctl.tick()).contains(&EventName::AlarmLimit));
    }

    #[test]
    fn slow_leak_at_loop_cadence_latches_once_and_clears() {
        let mut rig = Rig::new();
        rig.ctl.tick();

        // 0.6 L/min at 450 p/L: one edge every 222 ms.
        let outs = rig.trickle(Some(222), 10_000);
        assert_eq!(Rig::count(&outs, EventName::AlarmLeak), 1);
        assert_eq!(Rig::count(&outs, EventName::Anomaly), 1);
        assert!(rig.ctl.status().alarms.leak);
        assert!(rig.ctl.status().diag.contains("LEAK"));

        let outs = rig.trickle(None, 3_000);
        assert_eq!(Rig::count(&outs, EventName::AlarmLeak), 0);
        assert!(!rig.ctl.status().alarms.leak);
        assert_eq!(rig.ctl.status().diag, "OK");

        let system = rig.ctl.system_events();
        let mentions = |needle: &str| system.iter().filter(|e| e.detail.contains(needle)).count();
        assert_eq!(mentions("ALARM: LEAK"), 1);
        assert_eq!(mentions("leak cleared"), 1);
    }

    #[test]
    fn run_down_after_close_is_not_a_leak() {
        let mut rig = Rig::new();
        rig.ctl
            .handle_command(Command::Open { duration_sec: Some(600) })
            .unwrap();
        rig.trickle(Some(10), 3_000);
        rig.ctl.handle_command(Command::Close).unwrap();

        let mut outs = rig.trickle(Some(25), 500);
        outs.extend(rig.trickle(None, 8_000));
        assert_eq!(Rig::count(&outs, EventName::AlarmLeak), 0);
        assert_eq!(Rig::count(&outs, EventName::Anomaly), 0);
        assert!(!rig.ctl.status().alarms.leak);
    }

    #[test]
    fn sub_threshold_trickle_never_raises_leak() {
        let mut rig = Rig::new();
        rig.ctl.tick();

        // 0.3 L/min: one edge every 444 ms.
        let outs = rig.trickle(Some(444), 10_000);
        assert_eq!(Rig::count(&outs, EventName::AlarmLeak), 0);
        assert!(!rig.ctl.status().alarms.leak);
    }

    #[test]
    fn battery_is_sampled_and_scaled() {
        let mut rig = Rig::new();
        rig.ctl.tick();
        let v = rig.ctl.status().battery_v.unwrap();
        assert!((v - 0.6 * 6.47).abs() < 1e-4);
        assert!(!rig.ctl.status().alarms.low_battery);
    }

    // -- Scheduling -------------------------------------------------------

    #[test]
    fn saved_slot_triggers_and_survives_reload() {
        let store = SharedStore::default();
        let clock = ManualClock::new(datetime!(2024-06-02 05:59:59 +2));
        let mut rig = Rig::with(clock.clone(), store.clone());

        let slot = IrrigationSlot {
            enabled: true,
            start_hour: 6,
            start_minute: 0,
            duration_sec: 120,
            weekday_mask: 0x7f,
        };
        assert_eq!(rig.ctl.update_slots(&[(0, slot), (9, slot)]).unwrap(), 1);

        rig.clock.advance_ms(1_000);
        let out = rig.ctl.tick();
        assert!(Rig::names(&out).contains(&EventName::ValveOpen));
        assert!(rig.ctl.status().irr_running);

        let reloaded = Rig::with(ManualClock::new(datetime!(2024-06-03 00:00:00 UTC)), store);
        assert_eq!(reloaded.ctl.slots()[0], slot);
    }

    // -- History & persistence --------------------------------------------

    #[test]
    fn history_needs_valid_clock() {
        let mut rig = Rig::with(ManualClock::unsynchronised(), SharedStore::default());
        rig.ctl.tick();
        rig.clock.advance_ms(120_000);
        assert!(rig.ctl.tick().history.is_empty());
    }

    #[test]
    fn history_every_minute_and_on_transitions() {
        let mut rig = Rig::new();
        assert_eq!(rig.ctl.tick().history.len(), 1);
        rig.clock.advance_ms(30_000);
        assert!(rig.ctl.tick().history.is_empty());
        rig.clock.advance_ms(30_000);
        assert_eq!(rig.ctl.tick().history.len(), 1);

        rig.ctl
            .handle_command(Command::Open { duration_sec: Some(60) })
            .unwrap();
        let out = rig.ctl.tick();
        assert_eq!(out.history.len(), 1);
        assert_eq!(out.history[0].valve, ValveState::Open);
    }

    #[test]
    fn flow_total_is_persisted_and_restored() {
        let store = SharedStore::default();
        let clock = ManualClock::new(datetime!(2024-06-02 12:00:00 UTC));
        let mut rig = Rig::with(clock, store.clone());
        rig.ctl
            .handle_command(Command::Open { duration_sec: Some(600) })
            .unwrap();
        rig.flow(900, 1_000);
        rig.ctl.tick();
        assert!(store.get(KEY_FLOW_TOTAL).is_none());

        rig.clock.advance_ms(60_000);
        rig.ctl.tick();
        let saved = store.get_float(KEY_FLOW_TOTAL, 0.0);
        assert!((saved - 2.0).abs() < 1e-6);

        let again = Rig::with(ManualClock::new(datetime!(2024-06-02 13:00:00 UTC)), store);
        assert!((again.ctl.status().flow_total_l - 2.0).abs() < 1e-6);
    }

    #[test]
    fn prepare_restart_closes_and_flushes() {
        let store = SharedStore::default();
        let mut rig = Rig::with(ManualClock::new(datetime!(2024-06-02 12:00:00 UTC)), store.clone());
        rig.ctl
            .handle_command(Command::Open { duration_sec: Some(600) })
            .unwrap();
        rig.flow(450, 1_000);
        rig.ctl.tick();

        rig.ctl.prepare_restart().unwrap();
        assert_eq!(rig.ctl.valve_state(), ValveState::Closed);
        assert!((store.get_float(KEY_FLOW_TOTAL, 0.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn scheduled_reboot_is_reported() {
        let store = SharedStore::default();
        let clock = ManualClock::new(datetime!(2024-06-02 02:00:00 UTC));
        let mut rig = Rig::with(clock, store);
        rig.ctl.apply_settings(&SettingsUpdate {
            reboot_hour: Some(3),
            ..SettingsUpdate::default()
        });
        assert!(!rig.ctl.tick().reboot);

        rig.clock.advance_ms(3_600_000);
        let out = rig.ctl.tick();
        assert!(out.reboot);
        assert!(Rig::names(&out).contains(&EventName::RebootScheduled));
    }

    // -- Maintenance & watchdog -------------------------------------------

    #[test]
    fn watchdog_fed_every_tick() {
        let mut rig = Rig::new();
        for _ in 0..3 {
            rig.clock.advance_ms(50);
            rig.ctl.tick();
        }
        assert_eq!(rig.dog.feeds.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn maintenance_refuses_open() {
        let mut rig = Rig::new();
        rig.ctl
            .handle_command(Command::Open { duration_sec: Some(60) })
            .unwrap();
        rig.ctl.enter_maintenance();
        assert_eq!(rig.ctl.valve_state(), ValveState::Closed);
        assert_eq!(rig.dog.suspended.load(Ordering::SeqCst), 1);
        assert!(rig
            .ctl
            .handle_command(Command::Open { duration_sec: None })
            .is_err());

        rig.ctl.leave_maintenance();
        assert_eq!(rig.dog.suspended.load(Ordering::SeqCst), 0);
        assert!(rig
            .ctl
            .handle_command(Command::Open { duration_sec: None })
            .is_ok());
    }

    #[test]
    fn refused_open_leaves_mode_untouched() {
        let mut rig = Rig::new();
        rig.ctl.enter_maintenance();
        assert!(rig
            .ctl
            .handle_command(Command::Open { duration_sec: Some(60) })
            .is_err());
        assert_eq!(rig.ctl.status().irr_mode, Mode::Auto);
        assert!(!rig.ctl.status().irr_running);
    }

    #[test]
    fn acknowledge_resets_diag() {
        let mut rig = Rig::new();
        rig.ctl.tick();
        rig.trickle(Some(222), 6_000);
        assert_ne!(rig.ctl.status().diag, "OK");
        rig.ctl.acknowledge_alarms();
        assert_eq!(rig.ctl.status().diag, "OK");
    }
}
