// Web view: JSON status API, recent-log ring and live log stream

mod http;
mod ws;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Router, routing::get, routing::post};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::config::WwwUser;
use crate::leds::LedRegistry;
use crate::models::Snapshot;
use crate::notifier::{Msg, MsgKind};

/// One rendered log line as shown by the web view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub time: String,
    pub severity: String,
    pub text: String,
    pub attachment: bool,
}

/// Bounded ring of recent log entries plus a live broadcast channel for
/// WebSocket clients. Registered as a callback sink on every notifier
/// instance, so it survives reconfigures.
pub struct WebLog {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
    tx: broadcast::Sender<LogEntry>,
}

impl WebLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(64);
        WebLog {
            capacity,
            entries: Mutex::new(VecDeque::new()),
            tx,
        }
    }

    /// Callback-sink handler: messages and attachments land in the ring,
    /// control markers are ignored.
    pub fn receive(&self, m: &Msg) {
        let attachment = match m.kind {
            MsgKind::Message => false,
            MsgKind::Attachment => true,
            MsgKind::Flush | MsgKind::Reopen => return,
        };
        if self.capacity == 0 {
            return;
        }
        let entry = LogEntry {
            time: m.time.format("%Y-%m-%d %H:%M:%S").to_string(),
            severity: m.severity.to_string(),
            text: m.text.clone(),
            attachment,
        };
        if let Ok(mut ring) = self.entries.lock() {
            while ring.len() >= self.capacity {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }
        let _ = self.tx.send(entry);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) snapshot: Arc<RwLock<Snapshot>>,
    pub(crate) web_log: Arc<WebLog>,
    pub(crate) leds: Option<Arc<LedRegistry>>,
    pub(crate) users: Arc<HashMap<String, WwwUser>>,
    pub(crate) started: DateTime<Local>,
}

fn basic_auth_ok(header_value: &str, users: &HashMap<String, WwwUser>) -> bool {
    let Some(encoded) = header_value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, password)) = credentials.split_once(':') else {
        return false;
    };
    users
        .get(user)
        .is_some_and(|u| u.enable && u.password == password)
}

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.users.values().any(|u| u.enable) {
        return next.run(request).await;
    }
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|h| basic_auth_ok(h, &state.users));
    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"zfsmon\"")],
            "unauthorized",
        )
            .into_response()
    }
}

pub fn app(
    snapshot: Arc<RwLock<Snapshot>>,
    web_log: Arc<WebLog>,
    leds: Option<Arc<LedRegistry>>,
    users: HashMap<String, WwwUser>,
) -> Router {
    let state = AppState {
        snapshot,
        web_log,
        leds,
        users: Arc::new(users),
        started: Local::now(),
    };
    Router::new()
        .route("/", get(|| async { "zfsmon - ZFS pool monitoring and notification daemon" }))
        .route("/version", get(http::version_handler)) // GET /version
        .route("/api/status", get(http::api_status_handler)) // GET /api/status
        .route("/api/logs", get(http::api_logs_handler)) // GET /api/logs
        .route("/api/locate/{dev}", get(http::locate_query_handler))
        .route("/api/locate/{dev}/on", post(http::locate_on_handler))
        .route("/api/locate/{dev}/off", post(http::locate_off_handler))
        .route("/ws/logs", get(ws::ws_logs)) // WS /ws/logs
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}
