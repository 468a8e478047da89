//! MQTT telemetry/command link.
//!
//! Two halves share one `AsyncClient`:
//! - [`Publisher`] lives in the control loop and turns each tick's output
//!   into publishes. It only ever uses `try_publish`, so a slow or absent
//!   broker never stalls the loop.
//! - [`run`] drives the rumqttc event loop: connection state, the retained
//!   Online/Offline status, and inbound commands.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use irrigation_core::controller::TickOutput;
use irrigation_core::telemetry::{
    parse_command, telemetry_interval_ms, DeviceEvent, EventName, HistoryPoint, StatusSnapshot,
};
use irrigation_core::valve::ValveState;

use crate::config::MqttConfig;
use crate::{SharedController, FW_VERSION};

/// History points kept while the broker is unreachable. Oldest go first.
pub const HISTORY_QUEUE_MAX: usize = 150;

const ONLINE: &str = "Online";
const OFFLINE: &str = "Offline";
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// OPEN / CLOSED.
    State,
    /// Status snapshot JSON.
    Tele,
    /// Inbound commands.
    Cmd,
    Diag,
    History,
    /// Seconds open today.
    Usage,
    /// Daily limit in seconds.
    Limit,
    Event,
    /// Online / Offline, also the last will.
    Status,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::State,
        Topic::Tele,
        Topic::Cmd,
        Topic::Diag,
        Topic::History,
        Topic::Usage,
        Topic::Limit,
        Topic::Event,
        Topic::Status,
    ];

    pub fn leaf(self) -> &'static str {
        match self {
            Topic::State => "state",
            Topic::Tele => "tele",
            Topic::Cmd => "cmd",
            Topic::Diag => "diag",
            Topic::History => "history",
            Topic::Usage => "usage",
            Topic::Limit => "limit",
            Topic::Event => "event",
            Topic::Status => "status",
        }
    }

    pub fn retained(self) -> bool {
        matches!(self, Topic::State | Topic::Usage | Topic::Limit | Topic::Status)
    }
}

#[derive(Debug, Clone)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(base_topic: &str) -> Self {
        Self {
            base: base_topic.trim_end_matches('/').to_string(),
        }
    }

    pub fn get(&self, topic: Topic) -> String {
        format!("{}/{}", self.base, topic.leaf())
    }

    /// Topic a publish arrived on, if it is one of ours.
    pub fn parse(&self, full: &str) -> Option<Topic> {
        let leaf = full.strip_prefix(&self.base)?.strip_prefix('/')?;
        Topic::ALL.into_iter().find(|t| t.leaf() == leaf)
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Link state shared with the web API.
#[derive(Debug, Default)]
pub struct LinkStatus {
    connected: AtomicBool,
    history_queued: AtomicUsize,
    shutting_down: AtomicBool,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn history_queued(&self) -> usize {
        self.history_queued.load(Ordering::Acquire)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

pub fn options(cfg: &MqttConfig, topics: &Topics) -> MqttOptions {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_s));
    opts.set_last_will(LastWill::new(
        topics.get(Topic::Status),
        OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));
    opts
}

pub fn connect(cfg: &MqttConfig, topics: &Topics) -> (AsyncClient, EventLoop) {
    AsyncClient::new(options(cfg, topics), 20)
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TelemetryPayload<'a> {
    pub fw: &'static str,
    #[serde(flatten)]
    pub status: &'a StatusSnapshot,
}

impl<'a> TelemetryPayload<'a> {
    pub fn new(status: &'a StatusSnapshot) -> Self {
        Self {
            fw: FW_VERSION,
            status,
        }
    }
}

// ---------------------------------------------------------------------------
// History queue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct HistoryQueue {
    points: VecDeque<HistoryPoint>,
    dropped: u64,
}

impl HistoryQueue {
    pub fn push(&mut self, point: HistoryPoint) {
        if self.points.len() == HISTORY_QUEUE_MAX {
            self.points.pop_front();
            self.dropped += 1;
        }
        self.points.push_back(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn pop(&mut self) -> Option<HistoryPoint> {
        self.points.pop_front()
    }

    fn unpop(&mut self, point: HistoryPoint) {
        self.points.push_front(point);
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct Publisher {
    client: AsyncClient,
    topics: Topics,
    link: Arc<LinkStatus>,
    history: HistoryQueue,
    was_connected: bool,
    last_tele_ms: Option<u64>,
    last_state: Option<ValveState>,
    last_usage: Option<u32>,
    last_limit: Option<u32>,
    last_diag: Option<String>,
}

impl Publisher {
    pub fn new(client: AsyncClient, topics: Topics, link: Arc<LinkStatus>) -> Self {
        Self {
            client,
            topics,
            link,
            history: HistoryQueue::default(),
            was_connected: false,
            last_tele_ms: None,
            last_state: None,
            last_usage: None,
            last_limit: None,
            last_diag: None,
        }
    }

    /// Publish everything one control-loop tick produced.
    pub fn publish_tick(&mut self, out: &TickOutput, status: &StatusSnapshot, now_ms: u64) {
        let connected = self.link.is_connected();
        if connected && !self.was_connected {
            // Fresh session: resend retained topics and telemetry right away.
            self.last_tele_ms = None;
            self.last_state = None;
            self.last_usage = None;
            self.last_limit = None;
            self.last_diag = None;
        }
        self.was_connected = connected;

        for event in &out.events {
            self.send_json(Topic::Event, event);
        }

        let dropped_before = self.history.dropped();
        for point in &out.history {
            self.history.push(point.clone());
        }
        if self.history.dropped() > dropped_before {
            warn!(
                dropped_total = self.history.dropped(),
                "history queue full, oldest points dropped"
            );
        }
        if connected {
            self.flush_history();
        }
        self.link
            .history_queued
            .store(self.history.len(), Ordering::Release);

        if !connected {
            return;
        }

        if self.last_state != Some(status.valve) && self.send(Topic::State, status.valve.to_string()) {
            self.last_state = Some(status.valve);
        }

        let interval = telemetry_interval_ms(status.valve, status.flow_lpm);
        let due = self
            .last_tele_ms
            .map_or(true, |t| now_ms.saturating_sub(t) >= interval);
        if due {
            self.last_tele_ms = Some(now_ms);
            self.send_json(Topic::Tele, &TelemetryPayload::new(status));

            if self.last_usage != Some(status.daily_open_s)
                && self.send(Topic::Usage, status.daily_open_s.to_string())
            {
                self.last_usage = Some(status.daily_open_s);
            }
            if self.last_limit != Some(status.daily_limit_s)
                && self.send(Topic::Limit, status.daily_limit_s.to_string())
            {
                self.last_limit = Some(status.daily_limit_s);
            }
        }

        if self.last_diag.as_deref() != Some(status.diag.as_str())
            && self.send(Topic::Diag, status.diag.clone())
        {
            self.last_diag = Some(status.diag.clone());
        }
    }

    fn flush_history(&mut self) {
        while let Some(point) = self.history.pop() {
            let payload = match serde_json::to_vec(&point) {
                Ok(p) => p,
                Err(e) => {
                    warn!("mqtt: history point not serialisable: {e}");
                    continue;
                }
            };
            if self
                .client
                .try_publish(self.topics.get(Topic::History), QoS::AtLeastOnce, false, payload)
                .is_err()
            {
                // Request queue full; retry on a later tick.
                self.history.unpop(point);
                break;
            }
        }
    }

    fn send(&self, topic: Topic, payload: impl Into<Vec<u8>>) -> bool {
        match self.client.try_publish(
            self.topics.get(topic),
            QoS::AtLeastOnce,
            topic.retained(),
            payload,
        ) {
            Ok(()) => true,
            Err(e) => {
                debug!(topic = topic.leaf(), "mqtt publish skipped: {e}");
                false
            }
        }
    }

    fn send_json<T: Serialize>(&self, topic: Topic, value: &T) -> bool {
        match serde_json::to_vec(value) {
            Ok(payload) => self.send(topic, payload),
            Err(e) => {
                warn!(topic = topic.leaf(), "mqtt payload not serialisable: {e}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Drive the connection until [`go_offline`] has run.
pub async fn run(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    link: Arc<LinkStatus>,
    controller: SharedController,
) {
    let mut boot_sent = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                link.set_connected(true);

                let cmd = topics.get(Topic::Cmd);
                if let Err(e) = client.try_subscribe(&cmd, QoS::AtLeastOnce) {
                    warn!(topic = %cmd, "mqtt subscribe failed: {e}");
                }
                if let Err(e) =
                    client.try_publish(topics.get(Topic::Status), QoS::AtLeastOnce, true, ONLINE)
                {
                    warn!("mqtt online status failed: {e}");
                }

                if !boot_sent {
                    let uptime_ms = controller.lock().await.uptime_ms();
                    let boot = DeviceEvent::new(EventName::Boot, uptime_ms)
                        .with_detail(format!("fw {FW_VERSION}"));
                    match serde_json::to_vec(&boot) {
                        Ok(payload) => {
                            boot_sent = client
                                .try_publish(topics.get(Topic::Event), QoS::AtLeastOnce, false, payload)
                                .is_ok();
                        }
                        Err(e) => warn!("boot event not serialisable: {e}"),
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => match topics.parse(&p.topic) {
                Some(Topic::Cmd) => {
                    handle_command(&p.payload, &controller, &client, &topics).await;
                }
                _ => debug!(topic = %p.topic, "unhandled topic"),
            },
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                link.set_connected(false);
            }
            Ok(_) => {}
            Err(e) => {
                link.set_connected(false);
                if link.shutting_down.load(Ordering::Acquire) {
                    debug!("mqtt event loop finished");
                    return;
                }
                warn!("mqtt error: {e}. reconnecting...");
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn handle_command(
    payload: &[u8],
    controller: &SharedController,
    client: &AsyncClient,
    topics: &Topics,
) {
    let result = match parse_command(payload) {
        Ok(cmd) => controller.lock().await.handle_command(cmd),
        Err(e) => Err(e),
    };
    if let Err(msg) = result {
        warn!("mqtt command rejected: {msg}");
        report_rejection(client, topics, msg);
    }
}

/// Echo a refused command on the diag topic. Returns whether it was queued.
fn report_rejection(client: &AsyncClient, topics: &Topics, msg: String) -> bool {
    match client.try_publish(topics.get(Topic::Diag), QoS::AtLeastOnce, false, msg) {
        Ok(()) => true,
        Err(e) => {
            debug!(topic = Topic::Diag.leaf(), "mqtt rejection reply skipped: {e}");
            false
        }
    }
}

/// Announce the shutdown and close the session. The event loop task ends
/// once the disconnect has gone out.
pub async fn go_offline(client: &AsyncClient, topics: &Topics, link: &LinkStatus) -> Result<()> {
    link.shutting_down.store(true, Ordering::Release);
    client
        .publish(topics.get(Topic::Status), QoS::AtLeastOnce, true, OFFLINE)
        .await
        .context("publishing offline status failed")?;
    client.disconnect().await.context("mqtt disconnect failed")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
