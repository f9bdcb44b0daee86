use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use termbridge_terminal::{CloseReason, SessionInfo, SessionRegistry, TerminalError};

use crate::config::ServerConfig;
use crate::web::{
    multiplexer::Connection,
    protocol::{ClientCommand, CreateRequest, ServerFrame, SessionId},
};

/// How long a closing socket may spend delivering its last frames
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(1);

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub server: Arc<ServerConfig>,
    /// Cancelled when the server shuts down; ends open sockets
    pub shutdown: CancellationToken,
}

/// Create router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/stats", get(stats))
        .route("/health", get(health))
        // WebSocket endpoints
        .route("/ws", get(websocket_handler))
        .route("/ws/:session_id", get(websocket_attach_handler))
        .with_state(state)
}

/// GET /health
async fn health() -> &'static str {
    "ok"
}

/// GET /sessions - List all sessions
async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.registry.list().await;
    Json(serde_json::json!({ "sessions": sessions }))
}

/// POST /sessions - Create a new session; the body is optional
async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let request: CreateRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateRequest::default()
    } else {
        serde_json::from_slice(&body)?
    };
    let (dimensions, options) = request.into_parts();

    let session = state
        .registry
        .create_session(None, dimensions, options)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": session.id(),
            "status": session.status(),
            "dimensions": session.dimensions(),
            "websocketUrl": format!("/ws/{}", session.id()),
        })),
    ))
}

/// GET /sessions/:id - Session status
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionInfo>, AppError> {
    let session = state.registry.require(&id).await?;
    Ok(Json(session.info()))
}

/// DELETE /sessions/:id - Terminate a session
async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if !state.server.allow_rest_delete {
        // Left to the idle reaper
        state.registry.require(&id).await?;
        info!(session = %id, "REST delete deferred to idle reaping");
        return Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "id": id, "terminated": false, "deferred": true })),
        ));
    }

    let performed = state.registry.terminate(&id, CloseReason::Requested).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": id, "terminated": performed, "deferred": false })),
    ))
}

/// GET /stats
async fn stats(State(state): State<AppState>) -> Json<termbridge_terminal::RegistryStats> {
    Json(state.registry.stats().await)
}

/// GET /ws - Multiplexed WebSocket endpoint
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, None))
}

/// Optional resume point for `/ws/:session_id`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeQuery {
    after_seq: Option<u64>,
}

/// GET /ws/:session_id - WebSocket that attaches to one session on connect
async fn websocket_attach_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Query(resume): Query<ResumeQuery>,
) -> Response {
    let attach = ClientCommand::Attach {
        session_id,
        after_seq: resume.after_seq,
    };
    ws.on_upgrade(move |socket| handle_websocket(socket, state, Some(attach)))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState, attach: Option<ClientCommand>) {
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<ServerFrame>(state.server.outbound_queue.max(1));
    let mut connection = Connection::new(state.registry.clone(), outbound_tx);
    debug!(connection = %connection.id(), "websocket connected");

    // Split socket
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Spawn task to send frames from the queue to the WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sink.send(WsMessage::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("failed to encode frame: {}", e),
            }
        }
        let _ = ws_sink.close().await;
    });

    if let Some(attach) = attach {
        connection.handle_command(attach).await;
    }

    // Handle incoming WebSocket messages
    let mut shutting_down = false;
    loop {
        let message = tokio::select! {
            _ = state.shutdown.cancelled() => {
                shutting_down = true;
                break;
            }
            message = ws_stream.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match message {
            Ok(WsMessage::Text(text)) => connection.handle_text(&text).await,
            Ok(WsMessage::Binary(_)) => {
                connection
                    .reject("binary frames are not supported; send JSON text frames")
                    .await
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = %connection.id(), "websocket error: {}", e);
                break;
            }
        }
    }

    if shutting_down {
        connection.drain(SHUTDOWN_FLUSH).await;
    } else {
        connection.close().await;
    }

    // Flush whatever is still queued, then let the socket go
    drop(connection);
    if tokio::time::timeout(SHUTDOWN_FLUSH, &mut send_task).await.is_err() {
        send_task.abort();
    }
}

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error("invalid request body: {0}")]
    BadRequest(#[from] serde_json::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Terminal(err) => match err {
                TerminalError::NotFound { .. } => StatusCode::NOT_FOUND,
                TerminalError::InvalidDimensions { .. } => StatusCode::BAD_REQUEST,
                TerminalError::InputQueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
                TerminalError::LimitReached { .. } | TerminalError::ShuttingDown => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                TerminalError::Spawn { .. }
                | TerminalError::Write { .. }
                | TerminalError::ResourceLimit { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };

        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
