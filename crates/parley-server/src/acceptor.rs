use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::serve::{ListenerExt, TapIo};
use axum::{Json, Router};
use futures::StreamExt;
use parley_telemetry::{MetricsSnapshot, ServerMetrics};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::SessionError;
use crate::registry::SessionRegistry;
use crate::session::{self, Session};

/// Hook run on every accepted TCP stream before axum sees it.
pub type AcceptTap = Box<dyn FnMut(&mut TcpStream) + Send>;

/// TCP listener that counts every accepted connection, including those
/// whose WebSocket handshake later fails.
pub type CountingListener = TapIo<TcpListener, AcceptTap>;

/// Bind `addr` and count each raw accept in `metrics`.
pub async fn bind_counting(
    addr: &str,
    metrics: Arc<ServerMetrics>,
) -> std::io::Result<CountingListener> {
    let tap: AcceptTap = Box::new(move |stream: &mut TcpStream| {
        metrics.record_connection_accepted();
        match stream.peer_addr() {
            Ok(remote) => debug!(%remote, "accepted connection"),
            Err(e) => debug!(error = %e, "accepted connection without peer address"),
        }
    });
    Ok(TcpListener::bind(addr).await?.tap_io(tap))
}

/// Per-connection limits applied when a session starts.
#[derive(Clone, Copy, Debug)]
pub struct SessionLimits {
    pub max_clients: usize,
    pub heartbeat_interval: Duration,
}

/// Shared state handed to the axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Arc<ServerMetrics>,
    pub limits: SessionLimits,
}

/// WebSocket on `/` and `/ws`, health report on `/health`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn ws_handler(
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(%remote, error = %rejection, "websocket handshake failed");
            return rejection.into_response();
        }
    };
    ws.on_failed_upgrade(move |e| warn!(%remote, error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, remote, state))
}

async fn handle_socket(mut socket: WebSocket, remote: SocketAddr, state: AppState) {
    let (session, outbox) = Session::new(remote, &state.registry, Arc::clone(&state.metrics));

    match session.start(state.limits.max_clients) {
        Ok(total) => {
            info!(session_id = %session.id(), client_id = %session.client_id(), total, "client connected");
        }
        Err(e) => {
            warn!(%remote, error = %e, "refusing client");
            let reason = match e {
                SessionError::RegistryFull { .. } => "server full",
                _ => "server unavailable",
            };
            let frame = CloseFrame {
                code: close_code::AGAIN,
                reason: Utf8Bytes::from_static(reason),
            };
            if let Err(e) = socket.send(Message::Close(Some(frame))).await {
                debug!(%remote, error = %e, "close frame not delivered");
            }
            return;
        }
    }

    let (sink, stream) = socket.split();
    session::run_connection(
        session,
        sink,
        stream,
        outbox,
        state.dispatcher,
        state.limits.heartbeat_interval,
    )
    .await;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime: String,
    pub connections: usize,
    pub messages_logged: usize,
    pub metrics: MetricsSnapshot,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "healthy",
        uptime: state.metrics.formatted_uptime(),
        connections: state.registry.len(),
        messages_logged: state.dispatcher.message_log().len(),
        metrics: state.metrics.snapshot(),
    })
}
