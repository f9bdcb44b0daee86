use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use termbridge_terminal::{NativePtyBackend, Reaper, SessionRegistry, SysinfoSampler};

use crate::config::AppConfig;
use crate::web::routes;

/// Web server instance
pub struct WebServer {
    config: AppConfig,
    registry: SessionRegistry,
}

impl WebServer {
    /// Create a server that spawns shells on the native PTY system
    pub fn new(config: AppConfig) -> Self {
        let registry = SessionRegistry::init(
            config.terminal.clone(),
            Arc::new(NativePtyBackend::new()),
        );
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: AppConfig, registry: SessionRegistry) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Router with CORS and request tracing applied
    pub fn router(&self, shutdown: CancellationToken) -> Router {
        let app_state = routes::AppState {
            registry: self.registry.clone(),
            server: Arc::new(self.config.server.clone()),
            shutdown,
        };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        routes::create_router(app_state)
            .layer(TraceLayer::new_for_http())
            .layer(cors)
    }

    /// Bind the configured address and serve until `shutdown` is cancelled
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.config.server.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener. On shutdown every session is
    /// stopped before open sockets are closed, so attached clients receive
    /// their `sessionClosed` frames.
    pub async fn serve(self, listener: tokio::net::TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr().context("listener has no local address")?;

        let reaper = Reaper::new(self.registry.clone(), Arc::new(SysinfoSampler::new()))
            .spawn(shutdown.child_token());

        // Sockets outlive graceful HTTP shutdown; they close on their own token
        let sockets = CancellationToken::new();
        let app = self.router(sockets.clone());

        info!(%addr, "termbridge listening");
        info!("WebSocket endpoint: ws://{}/ws/{{session_id}}", addr);
        info!("REST endpoints: http://{}/sessions", addr);

        let signal = shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
            .context("server error");

        // The server may also have stopped on its own
        shutdown.cancel();
        let stopped = self.registry.shutdown().await;
        sockets.cancel();
        let _ = reaper.await;
        info!(stopped, "termbridge stopped");

        served
    }
}
