use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parlor_core::{FormatterChain, RoomConfig};
use parlor_telemetry::MetricsRecorder;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::client::{self, ConnectionRegistry};
use crate::config::ServerConfig;
use crate::coordinator::{AdvanceSchedule, RoomCoordinator};
use crate::error::ServerError;
use crate::handlers::{self, Inbound};
use crate::shutdown::ShutdownCoordinator;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RoomCoordinator>,
    pub inbound_tx: mpsc::Sender<Inbound>,
    pub heartbeat: std::time::Duration,
    pub started_at: std::time::Instant,
    pub shutdown: tokio_util::sync::CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving one room. Returns once the listener is bound.
pub async fn start(
    config: ServerConfig,
    room: RoomConfig,
    formatter: FormatterChain,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, ServerError> {
    let shutdown = ShutdownCoordinator::new();
    let registry = Arc::new(ConnectionRegistry::new(
        config.max_send_queue,
        config.client_timeout,
    ));
    let coordinator = RoomCoordinator::new(
        room,
        formatter,
        Arc::clone(&registry),
        metrics,
        AdvanceSchedule {
            poll_interval: config.advance_poll_interval,
            timeout: config.advance_timeout,
        },
        shutdown.token(),
    );

    let cleanup = client::start_cleanup_task(
        Arc::clone(&registry),
        config.heartbeat_interval,
        shutdown.token(),
    );

    let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(config.inbound_queue);
    let processor = tokio::spawn(handlers::process_inbound(
        inbound_rx,
        Arc::clone(&coordinator),
        shutdown.token(),
    ));

    let router = build_router(AppState {
        coordinator: Arc::clone(&coordinator),
        inbound_tx,
        heartbeat: config.heartbeat_interval,
        started_at: std::time::Instant::now(),
        shutdown: shutdown.token(),
    });

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "parlor server listening");

    let token = shutdown.token();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        coordinator,
        shutdown,
        shutdown_timeout: config.shutdown_timeout,
        tasks: vec![server, processor, cleanup],
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    coordinator: Arc<RoomCoordinator>,
    shutdown: ShutdownCoordinator,
    shutdown_timeout: std::time::Duration,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn coordinator(&self) -> &Arc<RoomCoordinator> {
        &self.coordinator
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Stop accepting, cancel polls and wait for background tasks.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        self.shutdown
            .graceful_shutdown(self.tasks, self.shutdown_timeout)
            .await;
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let registry = Arc::clone(state.coordinator.registry());
    let (id, rx) = registry.register();
    tracing::debug!(connection_id = %id, "websocket connected");

    // Admission is queued before any frame from this socket can be.
    if state.inbound_tx.send(Inbound::Connected(id.clone())).await.is_err() {
        registry.unregister(&id);
        return;
    }

    client::handle_ws_connection(
        socket,
        id.clone(),
        rx,
        Arc::clone(&registry),
        state.inbound_tx.clone(),
        state.heartbeat,
        state.shutdown.clone(),
    )
    .await;

    let _ = state.inbound_tx.send(Inbound::Disconnected(id)).await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (users, queue, current) = state.coordinator.inspect(|room| {
        (
            room.registered_count(),
            room.queue().len(),
            room.current_id().map(|id| id.to_string()),
        )
    });
    Json(serde_json::json!({
        "status": "healthy",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "connections": state.coordinator.registry().count(),
        "users": users,
        "queueLength": queue,
        "current": current,
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.metrics().snapshot())
}
