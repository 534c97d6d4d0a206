use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parley_core::MessageLog;
use parley_settings::ServerSettings;
use parley_telemetry::ServerMetrics;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::acceptor::{bind_counting, build_router, AppState, SessionLimits};
use crate::dispatch::Dispatcher;
use crate::error::ServerError;
use crate::reaper;
use crate::registry::SessionRegistry;

/// How long `stop` waits for the listener task to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub session_timeout: Duration,
    pub max_clients: usize,
    pub reap_interval: Duration,
    pub heartbeat_interval: Duration,
    pub message_log_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            session_timeout: Duration::from_secs(settings.session_timeout_secs),
            max_clients: settings.max_clients,
            reap_interval: Duration::from_secs(settings.reap_interval_secs),
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
            message_log_capacity: settings.message_log_capacity,
        }
    }
}

/// Bind the listener and start serving. Returns a handle to control the
/// running server.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, ServerError> {
    let metrics = Arc::new(ServerMetrics::new());
    let registry = Arc::new(SessionRegistry::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::new(MessageLog::new(config.message_log_capacity)),
    ));
    let shutdown = CancellationToken::new();

    let addr = format!("{}:{}", config.host, config.port);
    let listener = bind_counting(&addr, Arc::clone(&metrics))
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = axum::serve::Listener::local_addr(&listener)?;

    let reaper = reaper::start_reaper(
        Arc::clone(&registry),
        config.reap_interval,
        config.session_timeout,
        shutdown.clone(),
    );

    let router = build_router(AppState {
        dispatcher: Arc::clone(&dispatcher),
        registry: Arc::clone(&registry),
        metrics: Arc::clone(&metrics),
        limits: SessionLimits {
            max_clients: config.max_clients,
            heartbeat_interval: config.heartbeat_interval,
        },
    });

    let serve_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let service = router.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service)
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await
        {
            error!(error = %e, "server loop failed");
        }
    });

    info!(
        %local_addr,
        max_clients = config.max_clients,
        session_timeout_secs = config.session_timeout.as_secs(),
        "chat server started"
    );

    Ok(ServerHandle {
        local_addr,
        dispatcher,
        registry,
        metrics,
        shutdown,
        server,
        reaper,
    })
}

/// A running server. Dropping it leaves the server running; call
/// [`ServerHandle::stop`] to shut it down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<ServerMetrics>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn active_connections(&self) -> Vec<String> {
        self.registry.active_connections()
    }

    /// Stop accepting, close every session, and wait for the listener.
    pub async fn stop(self) {
        info!("stopping chat server");
        self.shutdown.cancel();

        let closed = self
            .registry
            .close()
            .iter()
            .filter(|s| s.disconnect())
            .count();

        let abort = self.server.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.server).await.is_err() {
            warn!("listener did not stop in time, aborting");
            abort.abort();
        }
        if let Err(e) = self.reaper.await {
            warn!(error = %e, "reaper task failed");
        }
        info!(closed, "chat server stopped");
    }
}
