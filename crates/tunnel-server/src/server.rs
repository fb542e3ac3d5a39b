//! Axum server: routes, shared state and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{any, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::coordinator::{Coordinator, CoordinatorConfig, start_cleanup_task};
use crate::dispatch::RestDispatcher;
use crate::health::{self, HealthResponse};
use crate::heartbeat::HeartbeatRegistry;
use crate::registry::PendingRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::{long_poll, sse, websocket};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection coordinator.
    pub coordinator: Arc<Coordinator>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
}

impl AppState {
    /// Bundle the coordinator with its configuration.
    pub fn new(config: ServerConfig, coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(config: ServerConfig) -> Self {
        use crate::dispatch::RouterDispatcher;
        use tokio_util::sync::CancellationToken;

        let backend = Router::new().route(
            "/topics",
            get(|| async { Json(serde_json::json!(["topic-a"])) }),
        );
        let coordinator = Coordinator::new(
            Arc::new(PendingRegistry::new()),
            Arc::new(HeartbeatRegistry::new(config.heartbeat_interval, CancellationToken::new())),
            Arc::new(RouterDispatcher::new(backend)),
            CoordinatorConfig::from(&config),
        );
        Self::new(config, Arc::new(coordinator))
    }
}

/// Build the Axum router with all routes, mounted under the configured path.
pub fn build_router(state: AppState) -> Router {
    let prefix = state.config.mount_prefix().to_owned();
    let tunnel = Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/sse", get(sse::sse_open))
        .route("/sse/{connection}", post(sse::sse_post))
        .route("/poll", get(long_poll::open_session))
        .route(
            "/poll/{connection}",
            get(long_poll::poll_session).delete(long_poll::close_session),
        )
        .route("/poll/{connection}/{*path}", any(long_poll::forward_request))
        .route("/health", get(health_handler))
        .with_state(state);

    let app = if prefix.is_empty() {
        tunnel
    } else {
        Router::new().nest(&prefix, tunnel)
    };
    app.layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive())
}

/// Bind the listener and start serving. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    dispatcher: Arc<dyn RestDispatcher>,
) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    let config = ServerConfig {
        port: addr.port(),
        ..config
    };

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let coordinator = Arc::new(Coordinator::new(
        Arc::new(PendingRegistry::new()),
        Arc::new(HeartbeatRegistry::new(config.heartbeat_interval, shutdown.child_token())),
        dispatcher,
        CoordinatorConfig::from(&config),
    ));

    shutdown.track(start_cleanup_task(
        Arc::clone(&coordinator),
        config.cleanup_interval,
        config.session_ttl,
        shutdown.child_token(),
    ));

    let shutdown_timeout = config.shutdown_timeout;
    let router = build_router(AppState::new(config, Arc::clone(&coordinator)));
    let token = shutdown.child_token();
    shutdown.track(tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await });
        if let Err(e) = serve.await {
            error!(error = %e, "server exited with error");
        }
    }));

    info!(%addr, "resttunnel server started");

    Ok(ServerHandle {
        addr,
        coordinator,
        shutdown,
        shutdown_timeout,
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    addr: SocketAddr,
    coordinator: Arc<Coordinator>,
    shutdown: Arc<ShutdownCoordinator>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The connection coordinator.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Close every tunnel connection, stop heartbeats and the listener, and
    /// wait for background tasks.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.coordinator.shutdown();
        self.shutdown.graceful_shutdown(self.shutdown_timeout).await;
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.coordinator.connection_count(),
        state.coordinator.heartbeats().member_count(),
    ))
}
