// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP control surface — runs alongside the supervisors.
//!
//! Endpoints:
//!   GET  /api/status                       → system status (JSON)
//!   GET  /api/disk                         → record/backup volume free space
//!   GET  /api/cameras                      → camera list (URLs redacted)
//!   POST /api/cameras/reload               → reload list, reconcile streams
//!   POST /api/cameras/{id}/reboot          → best-effort hardware reboot
//!   POST /api/streams/{id}/restart         → restart one stream
//!   POST /api/streams/{id}/stop            → stop one stream
//!   POST /api/streams/restart_all          → restart every enabled stream
//!   POST /api/recordings/start             → start one recording (id + URL)
//!   POST /api/recordings/stop              → stop one recording
//!   POST /api/recordings/start_all         → start all enabled cameras
//!   POST /api/recordings/stop_all          → stop everything
//!   POST /api/recordings/cleanup           → groom old recordings
//!   GET  /hls/… /record/… /backup/…        → static file service

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use chrono::Local;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::cameras::{redact_credentials, CameraRegistry};
use crate::config::Settings;
use crate::error::CamError;
use crate::fsutil;
use crate::recording::RecordingSupervisor;
use crate::resources::ResourceMonitor;
use crate::streaming::StreamingSupervisor;
use crate::{cleanup, fsutil::format_size};

/// Shared state passed to all handlers.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<CameraRegistry>,
    pub streaming: Arc<StreamingSupervisor>,
    pub recording: Arc<RecordingSupervisor>,
    pub resources: Arc<ResourceMonitor>,
}

#[derive(Deserialize)]
pub struct StartRecordingParams {
    camera_id: String,
    rtsp_url: String,
}

#[derive(Deserialize)]
pub struct StopRecordingParams {
    camera_id: String,
}

// ──────────────── router ──────────────────────────────────────────────────

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let settings = state.settings.clone();
    Router::new()
        .route("/api/status", get(handle_status))
        .route("/api/disk", get(handle_disk))
        // Camera management
        .route("/api/cameras", get(handle_list_cameras))
        .route("/api/cameras/reload", post(handle_reload_cameras))
        .route("/api/cameras/{camera_id}/reboot", post(handle_reboot_camera))
        // Streaming control
        .route("/api/streams/{camera_id}/restart", post(handle_restart_stream))
        .route("/api/streams/{camera_id}/stop", post(handle_stop_stream))
        .route("/api/streams/restart_all", post(handle_restart_all_streams))
        // Recording control
        .route("/api/recordings/start", post(handle_start_recording))
        .route("/api/recordings/stop", post(handle_stop_recording))
        .route("/api/recordings/start_all", post(handle_start_all_recordings))
        .route("/api/recordings/stop_all", post(handle_stop_all_recordings))
        .route("/api/recordings/cleanup", post(handle_cleanup_recordings))
        // Media file service
        .nest_service("/hls", ServeDir::new(&settings.tmp_path))
        .nest_service("/record", ServeDir::new(&settings.record_path))
        .nest_service("/backup", ServeDir::new(&settings.backup_path))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    info!(port, "HTTP API listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
    }
}

// ──────────────── status handlers ─────────────────────────────────────────

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sample = state.resources.latest();
    let (active_streams, streams) = state.streaming.status();
    let recordings = state.recording.status();

    let volume = |path: &std::path::Path| {
        json!({
            "path": path.display().to_string(),
            "free_bytes": fsutil::free_space(path),
            "free_gb": (fsutil::free_space_gb(path) * 100.0).round() / 100.0,
        })
    };

    (
        StatusCode::OK,
        axum::Json(json!({
            "timestamp": Local::now().to_rfc3339(),
            "system": {
                "cpu_percent": sample.cpu_percent,
                "memory_percent": sample.memory_percent,
            },
            "disk": {
                "tmp": volume(&state.settings.tmp_path),
                "record": volume(&state.settings.record_path),
                "backup": volume(&state.settings.backup_path),
            },
            "streaming": {
                "active_count": active_streams,
                "sessions": streams,
            },
            "recording": {
                "active_count": recordings.len(),
                "sessions": recordings,
            },
        })),
    )
}

async fn handle_disk(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let record_free = fsutil::free_space(&state.settings.record_path);
    let backup_free = fsutil::free_space(&state.settings.backup_path);
    let record_used = fsutil::directory_size(&state.settings.record_path);
    let backup_used = fsutil::directory_size(&state.settings.backup_path);

    (
        StatusCode::OK,
        axum::Json(json!({
            "record_path": state.settings.record_path.display().to_string(),
            "record_free_bytes": record_free,
            "record_free_gb": (fsutil::free_space_gb(&state.settings.record_path) * 100.0).round() / 100.0,
            "record_used": format_size(record_used),
            "backup_path": state.settings.backup_path.display().to_string(),
            "backup_free_bytes": backup_free,
            "backup_free_gb": (fsutil::free_space_gb(&state.settings.backup_path) * 100.0).round() / 100.0,
            "backup_used": format_size(backup_used),
        })),
    )
}

// ──────────────── camera handlers ─────────────────────────────────────────

async fn handle_list_cameras(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.registry.cameras() {
        Ok(cameras) => {
            let list: Vec<_> = cameras
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "name": c.name,
                        "rtsp_url": redact_credentials(&c.rtsp_url),
                        "enabled": c.enabled,
                        "streaming": state.streaming.has_session(&c.id),
                        "recording": state.recording.has_session(&c.id),
                    })
                })
                .collect();
            (
                StatusCode::OK,
                axum::Json(json!({ "cameras": list, "total": list.len() })),
            )
                .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

async fn handle_reload_cameras(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.streaming.reconcile().await {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(json!({ "status": "reloaded" })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

async fn handle_reboot_camera(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.reboot_camera(&camera_id).await {
        Ok(true) => (
            StatusCode::OK,
            axum::Json(json!({ "status": "reboot requested", "camera_id": camera_id })),
        )
            .into_response(),
        Ok(false) => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "error": format!("camera '{camera_id}' did not accept a reboot request")
            })),
        )
            .into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

// ──────────────── streaming handlers ──────────────────────────────────────

async fn handle_restart_stream(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> impl IntoResponse {
    match state.streaming.restart_stream(&camera_id).await {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(json!({ "status": "restarting", "camera_id": camera_id })),
        )
            .into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

async fn handle_stop_stream(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> impl IntoResponse {
    match state.streaming.stop_stream(&camera_id).await {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(json!({ "status": "stopped", "camera_id": camera_id })),
        )
            .into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

async fn handle_restart_all_streams(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.streaming.restart_all().await {
        Ok((restarted, 0)) => (
            StatusCode::OK,
            axum::Json(json!({ "status": "restarted", "count": restarted })),
        )
            .into_response(),
        Ok((restarted, failed)) => (
            StatusCode::OK,
            axum::Json(json!({
                "status": "partial",
                "restarted": restarted,
                "failed": failed,
            })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

// ──────────────── recording handlers ──────────────────────────────────────

async fn handle_start_recording(
    State(state): State<Arc<AppState>>,
    axum::Json(params): axum::Json<StartRecordingParams>,
) -> impl IntoResponse {
    match state
        .recording
        .clone()
        .start_recording(&params.camera_id, &params.rtsp_url)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(json!({ "status": "recording started", "camera_id": params.camera_id })),
        )
            .into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

async fn handle_stop_recording(
    State(state): State<Arc<AppState>>,
    axum::Json(params): axum::Json<StopRecordingParams>,
) -> impl IntoResponse {
    match state.recording.stop_recording(&params.camera_id).await {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(json!({ "status": "recording stopped", "camera_id": params.camera_id })),
        )
            .into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

async fn handle_start_all_recordings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.recording.clone().start_all().await {
        (
            StatusCode::OK,
            axum::Json(json!({ "status": "all recordings started" })),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({ "status": "some recordings failed to start" })),
        )
    }
}

async fn handle_stop_all_recordings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ok = state.recording.stop_all().await;
    // Stopping tends to leave undersized fragments behind.
    fsutil::clean_small_recordings(&state.settings.record_path, 1024 * 1024);
    if ok {
        (
            StatusCode::OK,
            axum::Json(json!({ "status": "all recordings stopped" })),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({ "status": "some recordings failed to stop" })),
        )
    }
}

async fn handle_cleanup_recordings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let deleted = cleanup::groom_recordings(&state.settings)
        + fsutil::clean_small_recordings(&state.settings.record_path, 1024 * 1024);
    (
        StatusCode::OK,
        axum::Json(json!({ "status": "success", "files_deleted": deleted })),
    )
}

// ──────────────── helpers ─────────────────────────────────────────────────

fn status_for(error: &CamError) -> StatusCode {
    match error {
        CamError::CameraNotFound { .. } | CamError::NoActiveSession { .. } => {
            StatusCode::NOT_FOUND
        }
        CamError::CameraDisabled { .. } => StatusCode::CONFLICT,
        CamError::DiskSpace { .. } => StatusCode::INSUFFICIENT_STORAGE,
        CamError::RtspUnreachable { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, error: &CamError) -> axum::response::Response {
    (status, axum::Json(json!({ "error": error.to_string() }))).into_response()
}
