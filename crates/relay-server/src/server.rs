//! `RelayServer`: Axum HTTP + WebSocket server.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::{ConnectionId, RoomInfo};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::connection;
use crate::directory::RoomDirectory;
use crate::health::{self, HealthResponse};
use crate::router::MessageRouter;
use crate::shutdown::ShutdownCoordinator;
use crate::status::{StatusReporter, StatusSnapshot};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Rooms and sessions.
    pub directory: Arc<RoomDirectory>,
    /// Inbound frame dispatch.
    pub router: Arc<MessageRouter>,
    /// Diagnostics over the directory.
    pub status: Arc<StatusReporter>,
    /// Runtime configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`.
    pub metrics_handle: PrometheusHandle,
}

/// The signaling relay server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    directory: Arc<RoomDirectory>,
    router: Arc<MessageRouter>,
    status: Arc<StatusReporter>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics_handle: PrometheusHandle,
}

impl RelayServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, metrics_handle: PrometheusHandle) -> Self {
        let directory = Arc::new(RoomDirectory::new());
        Self {
            router: Arc::new(MessageRouter::new(Arc::clone(&directory), config.relay_policy)),
            status: Arc::new(StatusReporter::new(Arc::clone(&directory))),
            directory,
            config: Arc::new(config),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics_handle,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            directory: Arc::clone(&self.directory),
            router: Arc::clone(&self.router),
            status: Arc::clone(&self.status),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics_handle: self.metrics_handle.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/status", get(status_handler))
            .route("/rooms", get(rooms_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the listener and serve until the shutdown token fires.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %err, "server error");
            }
        });

        info!(%local_addr, "relay listening");
        Ok((local_addr, handle))
    }

    /// Spawn the periodic status logger; it stops with the shutdown token.
    pub fn spawn_status_logger(&self) -> JoinHandle<()> {
        let status = Arc::clone(&self.status);
        let interval = self.config.status_interval;
        let cancel = self.shutdown.token();
        tokio::spawn(async move { status.run_status_logger(interval, cancel).await })
    }

    /// Get the room directory.
    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    /// Get the status reporter.
    pub fn status(&self) -> &Arc<StatusReporter> {
        &self.status
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let id = ConnectionId::new();
    let max_message_size = state.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| connection::run_connection(socket, id, peer, state))
}

/// GET /status
async fn status_handler(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.status.snapshot())
}

/// GET /rooms
async fn rooms_handler(State(state): State<AppState>) -> Json<BTreeMap<String, RoomInfo>> {
    Json(state.status.rooms())
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.directory.connection_count(),
        state.directory.room_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    crate::metrics::render(&state.metrics_handle)
}
