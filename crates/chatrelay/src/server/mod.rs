//! WebSocket relay server
//!
//! Serves `GET /ws` for clients and `GET /health` for probes. Client
//! frames are decoded in [`connection`] and dispatched to the shared
//! [`RelayOrchestrator`].

pub mod connection;
pub mod registry;

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::{RelayError, Result};
use crate::relay::RelayOrchestrator;

pub use registry::{ClientId, ClientRegistry, ClientSink};

/// Shared application state for all handlers
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// Request pipeline shared by every connection
    pub orchestrator: Arc<RelayOrchestrator>,
    /// Connected clients
    pub registry: Arc<ClientRegistry>,
}

/// The relay server
pub struct RelayServer {
    state: Arc<AppState>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, orchestrator: Arc<RelayOrchestrator>) -> Self {
        let registry = Arc::new(ClientRegistry::new(config.send_queue));
        Self {
            state: Arc::new(AppState {
                config,
                orchestrator,
                registry,
            }),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Bind the configured address and serve until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let addr = self.state.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayError::Server(format!("Failed to bind to {addr}: {e}")))?;

        tracing::info!("Starting relay server on {addr}");
        tracing::info!(
            "Delivery mode: {:?}, stop on disconnect: {}",
            self.state.config.delivery,
            self.state.config.stop_on_disconnect
        );

        self.serve_on(listener, shutdown_signal()).await?;

        tracing::info!("Relay server shut down gracefully");
        Ok(())
    }

    /// Serve on an already-bound listener until `shutdown` resolves
    pub async fn serve_on<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = create_router(self.state());
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| RelayError::Server(format!("Server error: {e}")))
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.registry.count(),
        "conversations": state.orchestrator.tracker().len(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
