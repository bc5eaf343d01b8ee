// GET/POST handlers: version, status snapshot, logs, locate control

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sysinfo::System;

use super::AppState;
use crate::models::legal_pool_name;
use crate::version::{NAME, VERSION};

/// GET /version — returns service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "name": NAME,
        "version": VERSION,
    }))
}

/// GET /api/status — the latest pool/usage/iostat snapshot plus host figures.
pub(super) async fn api_status_handler(State(state): State<AppState>) -> Response {
    let snapshot = match state.snapshot.read() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("snapshot lock poisoned: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "snapshot unavailable").into_response();
        }
    };
    let load = System::load_average();
    let body = serde_json::json!({
        "pools": snapshot.pools,
        "usage": snapshot.usage,
        "iostat": snapshot.iostat,
        "uptimeSecs": System::uptime(),
        "loadAvg": [load.one, load.five, load.fifteen],
        "started": state.started.format("%Y-%m-%d %H:%M:%S").to_string(),
    });
    axum::Json(body).into_response()
}

/// GET /api/logs — the bounded recent-log ring, oldest first.
pub(super) async fn api_logs_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.web_log.entries())
}

fn bad_device(dev: &str) -> Option<Response> {
    if legal_pool_name(dev) {
        None
    } else {
        Some((StatusCode::BAD_REQUEST, "invalid device name").into_response())
    }
}

/// GET /api/locate/{dev} — whether the operator locate override is on.
pub(super) async fn locate_query_handler(
    State(state): State<AppState>,
    Path(dev): Path<String>,
) -> Response {
    if let Some(r) = bad_device(&dev) {
        return r;
    }
    let Some(leds) = &state.leds else {
        return (StatusCode::NOT_FOUND, "LED control disabled").into_response();
    };
    match leds.locate_query(&dev) {
        Ok(locate) => {
            axum::Json(serde_json::json!({ "device": dev, "locate": locate })).into_response()
        }
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

/// POST /api/locate/{dev}/on — force the locate indicator on.
pub(super) async fn locate_on_handler(
    State(state): State<AppState>,
    Path(dev): Path<String>,
) -> Response {
    set_locate(state, dev, true).await
}

/// POST /api/locate/{dev}/off — return the indicator to monitored state.
pub(super) async fn locate_off_handler(
    State(state): State<AppState>,
    Path(dev): Path<String>,
) -> Response {
    set_locate(state, dev, false).await
}

async fn set_locate(state: AppState, dev: String, on: bool) -> Response {
    if let Some(r) = bad_device(&dev) {
        return r;
    }
    let Some(leds) = &state.leds else {
        return (StatusCode::NOT_FOUND, "LED control disabled").into_response();
    };
    let result = if on { leds.locate_on(&dev).await } else { leds.locate_off(&dev).await };
    match result {
        Ok(()) => axum::Json(serde_json::json!({ "device": dev, "locate": on })).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}
