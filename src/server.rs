//! ==============================================================================
//! server.rs - http surface
//! ==============================================================================
//!
//! purpose:
//!     the axum router the browser, the debug dashboard and the esp32 boards
//!     talk to. handlers stay thin: they update the shared metrics record,
//!     hand snapshots to the relay, or call the device channel directly.
//!
//! routes:
//!     GET  /api                   video feed (catalog.rs)
//!     POST /upload-video          multipart `my-video` (upload.rs)
//!     GET  /api/scroll-metrics    latest ScrollMetrics
//!     POST /api/scroll-metrics    fold a ScrollSample in, relay (debounced)
//!     POST /api/device-command    send one command now (dashboard motor buttons)
//!     POST /api/reconnect-esp32   close + re-open the transport
//!     GET  /api/device-status     transport state + relay counters
//!     POST /api/log-transmission  client-side transmission log sink
//!     GET  /scroll-speeds         debug dashboard (dashboard.rs)
//!     GET  /esp32                 websocket for esp32 boards
//!     /uploads/*                  uploaded videos (Range supported)
//!     *                           front-end build, index.html fallback
//!
//! errors:
//!     every handler error is an ApiError; a panic becomes the same
//!     {"error":"Something broke!"} body as any other unexpected failure.
//!
//! ==============================================================================

use std::any::Any;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, State, WebSocketUpgrade,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any as AnyOrigin, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::command::{speed_to_byte, speed_to_interval, MAX_ANGLE, MAX_INTERVAL_MS, MIN_INTERVAL_MS};
use crate::config::RelayConfig;
use crate::device::{ChannelStatus, DeviceChannel, SendOutcome, TransportError};
use crate::domain::{DeviceCommand, ScrollSample};
use crate::metrics::{now_ms, ScrollAggregator};
use crate::relay::{Relay, RelayStats};
use crate::upload::{self, UploadError, FIELD_NAME, MAX_UPLOAD_BYTES};
use crate::{catalog, dashboard, websocket};

// ==============================================================================
// shared state
// ==============================================================================
// cheap to clone: every field is a handle.
// - metrics: the single ScrollMetrics record (plus the aggregation history
//   behind it), replaced wholesale by each POST
// - relay / channel: device side
// - settings: immutable after startup

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<RwLock<ScrollAggregator>>,
    pub relay: Relay,
    pub channel: DeviceChannel,
    pub settings: Arc<Settings>,
}

pub struct Settings {
    pub uploads_dir: PathBuf,
    pub client_build_dir: PathBuf,
    pub allowed_origin: String,
    pub catalog_limit: usize,
    /// dashboard refresh period
    pub poll_interval_ms: u64,
}

impl AppState {
    pub fn new(config: &RelayConfig, channel: DeviceChannel, relay: Relay) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(ScrollAggregator::new(
                config.metrics.window,
                config.metrics.container_height_px,
            ))),
            relay,
            channel,
            settings: Arc::new(Settings {
                uploads_dir: config.server.uploads_dir.clone(),
                client_build_dir: config.server.client_build_dir.clone(),
                allowed_origin: config.server.allowed_origin.clone(),
                catalog_limit: config.catalog.limit,
                poll_interval_ms: 100,
            }),
        }
    }
}

// ==============================================================================
// errors
// ==============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    TooLarge(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("catalog: {0:#}")]
    Catalog(anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => {
                debug!("[HTTP] rejected: {}", message);
                (StatusCode::BAD_REQUEST, Json(json!({ "status": "error", "error": message }))).into_response()
            }
            ApiError::TooLarge(message) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "status": "error", "error": message })),
            )
                .into_response(),
            ApiError::Transport(e) => {
                warn!("[HTTP] device transport: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "status": "error", "message": e.to_string() })),
                )
                    .into_response()
            }
            ApiError::Catalog(e) => {
                error!("[HTTP] error fetching videos: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Error fetching videos" })),
                )
                    .into_response()
            }
            ApiError::Internal(e) => {
                error!("[HTTP] {:#}", e);
                something_broke()
            }
        }
    }
}

fn something_broke() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Something broke!" })),
    )
        .into_response()
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::TooLarge(e.body_text())
        } else {
            ApiError::Validation(e.body_text())
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        if e.is_client_error() {
            ApiError::Validation(e.to_string())
        } else {
            ApiError::Internal(anyhow::Error::new(e))
        }
    }
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("[HTTP] handler panicked: {}", detail);
    something_broke()
}

// ==============================================================================
// router
// ==============================================================================

fn cors_layer(allowed_origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::RANGE]);

    if allowed_origin == "*" {
        return layer.allow_origin(AnyOrigin);
    }
    match HeaderValue::from_str(allowed_origin) {
        Ok(origin) => layer.allow_origin(origin),
        Err(_) => {
            warn!("[HTTP] invalid allowed_origin {:?}, allowing any origin", allowed_origin);
            layer.allow_origin(AnyOrigin)
        }
    }
}

pub fn router(state: AppState) -> Router {
    let build_dir = &state.settings.client_build_dir;
    let front_end = ServeDir::new(build_dir).fallback(ServeFile::new(build_dir.join("index.html")));
    let uploads = ServeDir::new(&state.settings.uploads_dir);
    let cors = cors_layer(&state.settings.allowed_origin);

    Router::new()
        .route("/api", get(list_videos))
        .route(
            "/upload-video",
            post(upload_video).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/scroll-metrics", get(get_metrics).post(post_metrics))
        .route("/api/device-command", post(device_command))
        .route("/api/reconnect-esp32", post(reconnect))
        .route("/api/device-status", get(device_status))
        .route("/api/log-transmission", post(log_transmission))
        .route("/scroll-speeds", get(scroll_speeds))
        .route("/esp32", get(esp32_socket))
        .nest_service("/uploads", uploads)
        .fallback_service(front_end)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// serve until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("[HTTP] listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server failed")?;
    Ok(())
}

// ==============================================================================
// handlers
// ==============================================================================

async fn list_videos(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let dir = state.settings.uploads_dir.clone();
    let limit = state.settings.catalog_limit;

    let videos = tokio::task::spawn_blocking(move || catalog::list_recent(&dir, limit))
        .await
        .map_err(|e| ApiError::Catalog(e.into()))?
        .map_err(ApiError::Catalog)?;

    debug!("[HTTP] returning {} videos", videos.len());
    Ok(Json(json!({ "videos": videos })))
}

async fn upload_video(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, ApiError> {
    let mut multipart = multipart?;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FIELD_NAME) {
            continue;
        }
        let original = field
            .file_name()
            .map(str::to_string)
            .ok_or(UploadError::MissingFile)?;
        // reject before reading the body
        upload::validate_extension(&original)?;

        let bytes = field.bytes().await?;
        let stored = upload::store(&state.settings.uploads_dir, &original, &bytes).await?;
        info!("[HTTP] video uploaded: {}", stored);
        return Ok(Json(json!({ "success": true, "filename": stored })));
    }

    Err(UploadError::MissingFile.into())
}

async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.read().await.snapshot().clone())
}

async fn post_metrics(
    State(state): State<AppState>,
    payload: Result<Json<ScrollSample>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(sample) = payload?;
    if !sample.scroll_position.is_finite() {
        return Err(ApiError::Validation("scrollPosition must be a finite number".to_string()));
    }

    let snapshot = state.metrics.write().await.update(&sample, now_ms());
    debug!(
        "[HTTP] sample: pos {:.0} speed {:.0}px/s avg {:.0}px/s {:?}",
        snapshot.scroll_position, snapshot.current_speed, snapshot.average_speed, snapshot.direction
    );
    state.relay.submit(snapshot);

    Ok(Json(json!({
        "success": true,
        "status": "received",
        "message": "Metrics queued for processing",
        "debounceMs": state.relay.debounce().as_millis() as u64,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// body of POST /api/device-command
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub angle: Option<f64>,
    /// 0/1 or "up"/"down"
    pub direction: Option<Value>,
    pub speed: Option<f64>,
    pub interval: Option<u32>,
}

impl CommandRequest {
    pub fn into_command(self) -> Result<DeviceCommand, ApiError> {
        let angle = self
            .angle
            .filter(|a| a.is_finite())
            .ok_or_else(|| ApiError::Validation("angle is required".to_string()))?;
        let direction = self
            .direction
            .as_ref()
            .ok_or_else(|| ApiError::Validation("direction is required".to_string()))
            .and_then(|d| {
                parse_direction(d)
                    .ok_or_else(|| ApiError::Validation(format!("invalid direction {d}")))
            })?;
        let speed = self.speed.unwrap_or(0.0);

        Ok(DeviceCommand {
            angle_deg: angle.round().clamp(0.0, f64::from(MAX_ANGLE)) as u8,
            direction,
            speed_byte: speed_to_byte(speed),
            interval_ms: self
                .interval
                .map(|i| i.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS))
                .unwrap_or_else(|| speed_to_interval(speed)),
        })
    }
}

fn parse_direction(value: &Value) -> Option<u8> {
    match value {
        Value::Number(n) => n.as_u64().filter(|d| *d <= 1).map(|d| d as u8),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "down" | "1" => Some(1),
            "up" | "none" | "0" => Some(0),
            _ => None,
        },
        _ => None,
    }
}

async fn device_command(
    State(state): State<AppState>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let command = request.into_command()?;
    info!(
        "[HTTP] manual command: angle {} dir {} speed {}",
        command.angle_deg, command.direction, command.speed_byte
    );

    let outcome = state.channel.send(&command).await?;
    Ok(Json(json!({
        "status": "success",
        "command": command,
        "acknowledged": matches!(outcome, SendOutcome::Acknowledged { .. }),
        "outcome": outcome,
    })))
}

async fn reconnect(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    info!("[HTTP] POST /api/reconnect-esp32");
    state.channel.reconnect().await?;
    Ok(Json(json!({ "status": "success", "message": "Reconnected" })))
}

#[derive(Serialize)]
struct DeviceStatus {
    #[serde(flatten)]
    channel: ChannelStatus,
    relay: RelayStats,
}

async fn device_status(State(state): State<AppState>) -> Json<DeviceStatus> {
    Json(DeviceStatus {
        channel: state.channel.status().await,
        relay: state.relay.stats(),
    })
}

async fn log_transmission(body: Bytes) -> Json<Value> {
    debug!("[TRANSMISSION] {}", String::from_utf8_lossy(&body));
    Json(json!({ "status": "success" }))
}

async fn scroll_speeds(State(state): State<AppState>) -> Html<String> {
    Html(dashboard::render(
        state.settings.poll_interval_ms,
        &state.channel.transport_name(),
    ))
}

async fn esp32_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    match state.channel.hub() {
        Some(hub) => {
            let hub = hub.clone();
            ws.on_upgrade(move |socket| websocket::serve_socket(socket, hub))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "error", "message": "websocket transport is not enabled" })),
        )
            .into_response(),
    }
}
