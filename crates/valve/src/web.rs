use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use irrigation_core::controller::Diagnostics;
use irrigation_core::events::LogEntry;
use irrigation_core::scheduler::{IrrigationSlot, Mode};
use irrigation_core::settings::{Settings, SettingsUpdate};
use irrigation_core::telemetry::{parse_command, Command, StatusSnapshot};

use crate::mqtt::LinkStatus;
use crate::{SharedController, Shutdown, FW_VERSION};

#[derive(Clone)]
pub struct AppState {
    pub controller: SharedController,
    pub link: Arc<LinkStatus>,
    pub shutdown: mpsc::Sender<Shutdown>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/diag", get(api_diag))
        .route("/api/diag/clear", post(api_diag_clear))
        .route("/api/events", get(api_events))
        .route("/api/slots", get(api_slots).put(api_put_slots))
        .route("/api/valve", post(api_valve))
        .route("/api/mode", post(api_mode))
        .route("/api/settings", get(api_settings).post(api_post_settings))
        .route("/api/maintenance", post(api_maintenance))
        .route("/api/restart", post(api_restart))
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// -- Read side ---------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    fw: &'static str,
    #[serde(flatten)]
    status: StatusSnapshot,
    mqtt_connected: bool,
}

async fn status_response(state: &AppState) -> Json<StatusResponse> {
    let status = state.controller.lock().await.status();
    Json(StatusResponse {
        fw: FW_VERSION,
        status,
        mqtt_connected: state.link.is_connected(),
    })
}

async fn api_status(State(state): State<AppState>) -> Json<StatusResponse> {
    status_response(&state).await
}

#[derive(Serialize)]
struct DiagResponse {
    fw: &'static str,
    #[serde(flatten)]
    diagnostics: Diagnostics,
    /// Resident memory of this process.
    mem_kb: Option<u64>,
    mqtt_connected: bool,
    history_queued: usize,
}

fn process_memory_kb() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new().with_memory(),
    );
    sys.process(pid).map(|p| p.memory() / 1024)
}

async fn api_diag(State(state): State<AppState>) -> Json<DiagResponse> {
    let diagnostics = state.controller.lock().await.diagnostics();
    Json(DiagResponse {
        fw: FW_VERSION,
        diagnostics,
        mem_kb: process_memory_kb(),
        mqtt_connected: state.link.is_connected(),
        history_queued: state.link.history_queued(),
    })
}

#[derive(Serialize)]
struct EventsResponse {
    system: Vec<LogEntry>,
    flow: Vec<LogEntry>,
}

async fn api_events(State(state): State<AppState>) -> Json<EventsResponse> {
    let ctl = state.controller.lock().await;
    Json(EventsResponse {
        system: ctl.system_events(),
        flow: ctl.flow_events(),
    })
}

async fn api_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.controller.lock().await.settings().clone())
}

// -- Slots -------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct SlotEntry {
    index: usize,
    #[serde(flatten)]
    slot: IrrigationSlot,
}

async fn api_slots(State(state): State<AppState>) -> Json<Vec<SlotEntry>> {
    let slots = state.controller.lock().await.slots();
    Json(
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| SlotEntry { index, slot })
            .collect(),
    )
}

#[derive(Serialize)]
struct SlotsUpdated {
    applied: usize,
}

async fn api_put_slots(
    State(state): State<AppState>,
    Json(entries): Json<Vec<SlotEntry>>,
) -> ApiResult<SlotsUpdated> {
    let updates: Vec<(usize, IrrigationSlot)> =
        entries.into_iter().map(|e| (e.index, e.slot)).collect();
    let applied = state
        .controller
        .lock()
        .await
        .update_slots(&updates)
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;
    Ok(Json(SlotsUpdated { applied }))
}

// -- Commands ----------------------------------------------------------------

async fn run_command(state: &AppState, cmd: Command) -> ApiResult<StatusResponse> {
    state
        .controller
        .lock()
        .await
        .handle_command(cmd)
        .map_err(|e| ApiError(StatusCode::CONFLICT, e))?;
    Ok(status_response(state).await)
}

/// Body is a command in the same form the MQTT `cmd` topic takes.
async fn api_valve(State(state): State<AppState>, body: Bytes) -> ApiResult<StatusResponse> {
    let cmd = parse_command(&body).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e))?;
    run_command(&state, cmd).await
}

#[derive(Deserialize)]
struct ModeRequest {
    mode: Mode,
}

async fn api_mode(
    State(state): State<AppState>,
    Json(req): Json<ModeRequest>,
) -> ApiResult<StatusResponse> {
    let cmd = match req.mode {
        Mode::Auto => Command::SetAuto,
        Mode::Manual => Command::SetManual,
    };
    run_command(&state, cmd).await
}

// -- Settings, alarms, maintenance -------------------------------------------

async fn api_post_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Json<Settings> {
    let mut ctl = state.controller.lock().await;
    ctl.apply_settings(&update);
    Json(ctl.settings().clone())
}

async fn api_diag_clear(State(state): State<AppState>) -> Json<StatusResponse> {
    state.controller.lock().await.acknowledge_alarms();
    status_response(&state).await
}

#[derive(Deserialize)]
struct MaintenanceRequest {
    active: bool,
}

async fn api_maintenance(
    State(state): State<AppState>,
    Json(req): Json<MaintenanceRequest>,
) -> Json<Diagnostics> {
    let mut ctl = state.controller.lock().await;
    if req.active {
        ctl.enter_maintenance();
    } else {
        ctl.leave_maintenance();
    }
    Json(ctl.diagnostics())
}

async fn api_restart(State(state): State<AppState>) -> Response {
    match state.shutdown.try_send(Shutdown::Requested) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "restarting": true })),
        )
            .into_response(),
        Err(e) => ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!(%addr, "web api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
