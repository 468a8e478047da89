mod clock;
mod config;
mod db;
mod hw;
mod mqtt;
mod watchdog;
mod web;

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use irrigation_core::flow::PulseCounter;
use irrigation_core::{Controller, ControllerOptions, Hardware};

use clock::SystemClock;
use db::{Db, SqliteStore};
use mqtt::{LinkStatus, Publisher, Topics};
use watchdog::{LoopWatchdog, LOOP_TIMEOUT};
use web::AppState;

pub(crate) const FW_VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) type SharedController = Arc<Mutex<Controller>>;

/// Why the process is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shutdown {
    /// Auto-reboot hour reached.
    Scheduled,
    /// Restart asked for over the web API.
    Requested,
    /// SIGINT.
    Signal,
}

/// Budget for each shutdown step. Well inside the loop watchdog timeout,
/// which keeps running once the control loop has stopped.
const SHUTDOWN_STEP: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:irrigation-valve.db?mode=rwc".to_string());

    // ── Settings store ──────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    let (store, flusher, _writer) = SqliteStore::open(db).await?;

    // ── Hardware ────────────────────────────────────────────────────
    let clock = SystemClock::new(cfg.device.utc_offset_hours)?;
    let pulses = Arc::new(PulseCounter::new());
    let hw::Devices {
        output,
        battery,
        flow: _flow,
    } = hw::open(&cfg.hardware, Arc::clone(&pulses), clock.epoch())?;

    let dog = LoopWatchdog::spawn(LOOP_TIMEOUT, |silent| {
        error!(silent_s = silent.as_secs(), "watchdog expired, exiting");
        std::process::exit(1);
    })?;

    let controller: SharedController = Arc::new(Mutex::new(Controller::new(
        Hardware {
            output,
            battery,
            clock: Box::new(clock),
            store: Box::new(store),
            watchdog: Box::new(dog),
            pulses,
        },
        ControllerOptions {
            overflow_policy: cfg.device.overflow_policy,
            total_persist_interval_ms: cfg.device.total_persist_min * 60_000,
        },
    )));
    info!(device = %cfg.device.name, fw = FW_VERSION, "controller started");

    // ── MQTT ────────────────────────────────────────────────────────
    let topics = Topics::new(&cfg.mqtt.base_topic);
    let (client, eventloop) = mqtt::connect(&cfg.mqtt, &topics);
    let link = Arc::new(LinkStatus::default());
    let mqtt_task = tokio::spawn(mqtt::run(
        eventloop,
        client.clone(),
        topics.clone(),
        Arc::clone(&link),
        Arc::clone(&controller),
    ));
    info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        base = %cfg.mqtt.base_topic,
        "mqtt link started"
    );

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(4);

    // ── Web API ─────────────────────────────────────────────────────
    let web_state = AppState {
        controller: Arc::clone(&controller),
        link: Arc::clone(&link),
        shutdown: shutdown_tx.clone(),
    };
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("web api stopped: {e:#}");
        }
    });

    // ── Control loop ────────────────────────────────────────────────
    let publisher = Publisher::new(client.clone(), topics.clone(), Arc::clone(&link));
    let control = tokio::spawn(control_loop(
        Arc::clone(&controller),
        publisher,
        Duration::from_millis(cfg.device.tick_ms),
        shutdown_tx,
    ));

    let reason = tokio::select! {
        r = shutdown_rx.recv() => r.unwrap_or(Shutdown::Requested),
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                warn!("signal handler failed: {e}");
            }
            Shutdown::Signal
        }
    };

    // ── Graceful restart ────────────────────────────────────────────
    info!(?reason, "shutting down");
    control.abort();

    if let Err(e) = controller.lock().await.prepare_restart() {
        error!("closing down the controller failed: {e:#}");
    }
    match timeout(SHUTDOWN_STEP, mqtt::go_offline(&client, &topics, &link)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{e:#}"),
        Err(_) => warn!("mqtt did not go offline in time"),
    }
    match timeout(SHUTDOWN_STEP, flusher.flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("settings flush failed: {e:#}"),
        Err(_) => warn!("settings flush timed out"),
    }
    let _ = timeout(SHUTDOWN_STEP, mqtt_task).await;

    info!("bye");
    Ok(())
}

async fn control_loop(
    controller: SharedController,
    mut publisher: Publisher,
    period: Duration,
    shutdown: mpsc::Sender<Shutdown>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let (out, status, now_ms) = {
            let mut ctl = controller.lock().await;
            let out = ctl.tick();
            (out, ctl.status(), ctl.uptime_ms())
        };
        publisher.publish_tick(&out, &status, now_ms);

        if out.reboot {
            info!("scheduled restart due");
            let _ = shutdown.send(Shutdown::Scheduled).await;
            return;
        }
    }
}
