//! REST API module
//!
//! HTTP control surface for the panel: coil listing, pulses, sequence
//! control and a WebSocket stream of controller events.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::SequenceConfig;
use crate::controller::{CoilSnapshot, PulseController};
use crate::error::ControlError;
use crate::input;

pub mod ws;

/// Values used when a request leaves a field out
#[derive(Debug, Clone)]
pub struct ControlDefaults {
    pub pulse_duration_secs: f64,
    pub sequence: SequenceConfig,
}

impl Default for ControlDefaults {
    fn default() -> Self {
        Self {
            pulse_duration_secs: 60.0,
            sequence: SequenceConfig::default(),
        }
    }
}

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub controller: PulseController,
    pub defaults: ControlDefaults,
    pub metrics_handle: Option<PrometheusHandle>,
    pub ws_connections: Arc<AtomicUsize>,
}

impl ApiState {
    pub fn new(controller: PulseController, defaults: ControlDefaults) -> Self {
        Self {
            controller,
            defaults,
            metrics_handle: None,
            ws_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_metrics(
        controller: PulseController,
        defaults: ControlDefaults,
        handle: PrometheusHandle,
    ) -> Self {
        Self {
            metrics_handle: Some(handle),
            ..Self::new(controller, defaults)
        }
    }
}

/// Create the API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/api/coils", get(list_coils))
        .route("/api/coils/refresh", post(refresh_all))
        .route("/api/coils/off", post(all_off))
        .route("/api/coils/:coil_id", get(get_coil))
        .route("/api/coils/:coil_id/refresh", post(refresh_coil))
        .route("/api/coils/:coil_id/pulse", post(pulse_coil))
        .route("/api/coils/:coil_id/cancel", post(cancel_coil))
        .route(
            "/api/sequence",
            get(get_sequence).post(start_sequence).delete(stop_sequence),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Error body returned for every failed request
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// Controller errors rendered as HTTP responses
pub struct ApiError(pub ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ControlError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlError::UnknownCoil(_) => StatusCode::NOT_FOUND,
            ControlError::Busy(_) => StatusCode::CONFLICT,
            ControlError::Io { .. } => StatusCode::BAD_GATEWAY,
            ControlError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::Fault { .. } | ControlError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.0.kind().as_str(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Parse an optional JSON body; an empty body means "use defaults"
fn parse_body<T>(body: &Bytes) -> Result<T, ApiError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError(ControlError::validation(format!("invalid request body: {}", e))))
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connected: bool,
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connected: state.controller.is_connected(),
    })
}

async fn render_metrics(State(state): State<Arc<ApiState>>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Coil list response
#[derive(Serialize)]
struct CoilListResponse {
    coils: Vec<CoilSnapshot>,
    sequence_running: bool,
}

async fn list_coils(State(state): State<Arc<ApiState>>) -> Json<CoilListResponse> {
    Json(CoilListResponse {
        coils: state.controller.snapshot(),
        sequence_running: state.controller.is_sequence_running(),
    })
}

async fn get_coil(
    State(state): State<Arc<ApiState>>,
    Path(coil_id): Path<usize>,
) -> Result<Json<CoilSnapshot>, ApiError> {
    state.controller.coil(coil_id)?;

    let snapshot = state
        .controller
        .snapshot()
        .into_iter()
        .find(|c| c.id == coil_id)
        .ok_or(ControlError::UnknownCoil(coil_id))?;

    Ok(Json(snapshot))
}

#[derive(Serialize)]
struct CoilStateResponse {
    id: usize,
    state: bool,
}

async fn refresh_coil(
    State(state): State<Arc<ApiState>>,
    Path(coil_id): Path<usize>,
) -> Result<Json<CoilStateResponse>, ApiError> {
    let value = state.controller.refresh(coil_id).await?;
    Ok(Json(CoilStateResponse {
        id: coil_id,
        state: value,
    }))
}

#[derive(Serialize)]
struct RefreshResponse {
    states: Vec<CoilStateResponse>,
    errors: Vec<ErrorBody>,
}

async fn refresh_all(State(state): State<Arc<ApiState>>) -> Json<RefreshResponse> {
    let report = state.controller.refresh_all().await;

    Json(RefreshResponse {
        states: report
            .states
            .into_iter()
            .map(|(id, state)| CoilStateResponse { id, state })
            .collect(),
        errors: report
            .errors
            .into_iter()
            .map(|e| ErrorBody {
                error: e.kind().as_str(),
                message: e.to_string(),
            })
            .collect(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct PulseRequest {
    duration_secs: Option<f64>,
}

#[derive(Serialize)]
struct PulseAccepted {
    coil: usize,
    duration_secs: f64,
}

async fn pulse_coil(
    State(state): State<Arc<ApiState>>,
    Path(coil_id): Path<usize>,
    body: Bytes,
) -> Result<(StatusCode, Json<PulseAccepted>), ApiError> {
    let request: PulseRequest = parse_body(&body)?;
    let secs = request
        .duration_secs
        .unwrap_or(state.defaults.pulse_duration_secs);
    let duration = input::press_duration(secs)?;

    let handle = state.controller.pulse(coil_id, duration)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PulseAccepted {
            coil: handle.coil(),
            duration_secs: secs,
        }),
    ))
}

#[derive(Serialize)]
struct CancelResponse {
    coil: usize,
    cancelled: bool,
}

async fn cancel_coil(
    State(state): State<Arc<ApiState>>,
    Path(coil_id): Path<usize>,
) -> Result<Json<CancelResponse>, ApiError> {
    state.controller.coil(coil_id)?;
    let cancelled = state.controller.cancel(coil_id);

    Ok(Json(CancelResponse {
        coil: coil_id,
        cancelled,
    }))
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

async fn all_off(State(state): State<Arc<ApiState>>) -> Result<Json<StatusResponse>, ApiError> {
    state.controller.all_off().await?;
    Ok(Json(StatusResponse { status: "off" }))
}

#[derive(Serialize)]
struct SequenceStatus {
    running: bool,
}

async fn get_sequence(State(state): State<Arc<ApiState>>) -> Json<SequenceStatus> {
    Json(SequenceStatus {
        running: state.controller.is_sequence_running(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct SequenceRequest {
    steps: Option<Vec<usize>>,
    press_duration_secs: Option<f64>,
    wait_duration_secs: Option<f64>,
    #[serde(rename = "loop")]
    looping: Option<bool>,
}

#[derive(Serialize)]
struct SequenceStarted {
    running: bool,
    steps: Vec<usize>,
    press_duration_secs: f64,
    wait_duration_secs: f64,
    #[serde(rename = "loop")]
    looping: bool,
}

async fn start_sequence(
    State(state): State<Arc<ApiState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<SequenceStarted>), ApiError> {
    let request: SequenceRequest = parse_body(&body)?;
    let defaults = &state.defaults.sequence;

    let steps = request.steps.unwrap_or_else(|| defaults.steps.clone());
    let press_secs = request
        .press_duration_secs
        .unwrap_or(defaults.press_duration_secs);
    let wait_secs = request
        .wait_duration_secs
        .unwrap_or(defaults.wait_duration_secs);
    let looping = request.looping.unwrap_or(defaults.looping);

    let press = input::press_duration(press_secs)?;
    let wait = input::wait_duration(wait_secs)?;

    state
        .controller
        .start_sequence(steps.clone(), press, wait, looping)
        .await?;
    info!("Sequence started via API");

    Ok((
        StatusCode::ACCEPTED,
        Json(SequenceStarted {
            running: true,
            steps,
            press_duration_secs: press_secs,
            wait_duration_secs: wait_secs,
            looping,
        }),
    ))
}

#[derive(Serialize)]
struct StopResponse {
    stopped: bool,
}

async fn stop_sequence(State(state): State<Arc<ApiState>>) -> Json<StopResponse> {
    let stopped = state.controller.stop_sequence().await;
    if !stopped {
        warn!("Stop requested but no sequence was running");
    }
    Json(StopResponse { stopped })
}
