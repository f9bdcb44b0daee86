#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use termbridge::{AppConfig, ServerConfig, WebServer};
use termbridge_terminal::testing::ScriptedBackend;
use termbridge_terminal::{SessionRegistry, TerminalConfig};

pub struct TestApp {
    pub router: Router,
    pub registry: SessionRegistry,
    pub backend: Arc<ScriptedBackend>,
    pub shutdown: CancellationToken,
}

pub fn terminal_config() -> TerminalConfig {
    TerminalConfig {
        working_dir: Some(std::env::temp_dir()),
        termination_grace_ms: 0,
        ..Default::default()
    }
}

pub fn app_with(server: ServerConfig, terminal: TerminalConfig) -> TestApp {
    let backend = Arc::new(ScriptedBackend::new());
    let registry = SessionRegistry::init(terminal.clone(), backend.clone());
    let shutdown = CancellationToken::new();
    let server = WebServer::with_registry(AppConfig { server, terminal }, registry.clone());
    TestApp {
        router: server.router(shutdown.clone()),
        registry,
        backend,
        shutdown,
    }
}

pub fn app() -> TestApp {
    app_with(ServerConfig::default(), terminal_config())
}

/// Send one request through the router and decode the JSON body (if any)
pub async fn call(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<&str>,
) -> (StatusCode, serde_json::Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if body.is_some() {
        request = request.header("content-type", "application/json");
    }
    let request = request
        .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, value)
}
