use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;

use termbridge_terminal::{CloseReason, CreateOptions, Dimensions, SessionInfo, SessionStatus};

/// Session ID type
pub type SessionId = String;

/// Frame kinds a client may send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientKind {
    Input,
    Resize,
    Create,
    Attach,
    Detach,
    Terminate,
    List,
}

impl ClientKind {
    fn needs_session(self) -> bool {
        !matches!(self, ClientKind::Create | ClientKind::List)
    }
}

/// Raw client frame as it arrives on the socket
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub kind: ClientKind,
    #[serde(default)]
    pub payload: Value,
}

/// Body of `POST /sessions` and payload of a `create` frame
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateRequest {
    pub dimensions: Option<Dimensions>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl CreateRequest {
    pub fn into_parts(self) -> (Option<Dimensions>, CreateOptions) {
        (
            self.dimensions,
            CreateOptions {
                command: self.command,
                args: self.args,
                working_dir: self.cwd,
                env: self.env,
            },
        )
    }
}

/// A validated client request
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Input { session_id: SessionId, data: String },
    Resize { session_id: SessionId, dimensions: Dimensions },
    Create { request: CreateRequest },
    /// `after_seq`: the last output seq the client already has
    Attach {
        session_id: SessionId,
        after_seq: Option<u64>,
    },
    Detach { session_id: SessionId },
    Terminate { session_id: SessionId },
    List,
}

/// Why a client frame was rejected
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("'{kind}' frames require a sessionId")]
    MissingSession { kind: &'static str },

    #[error("invalid '{kind}' payload: {reason}")]
    InvalidPayload {
        session_id: Option<SessionId>,
        kind: &'static str,
        reason: String,
    },
}

impl FrameError {
    /// Session the rejected frame referred to, if it named one
    pub fn session_id(&self) -> Option<&str> {
        match self {
            FrameError::InvalidPayload { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }
}

fn kind_name(kind: ClientKind) -> &'static str {
    match kind {
        ClientKind::Input => "input",
        ClientKind::Resize => "resize",
        ClientKind::Create => "create",
        ClientKind::Attach => "attach",
        ClientKind::Detach => "detach",
        ClientKind::Terminate => "terminate",
        ClientKind::List => "list",
    }
}

/// Parse and validate one text frame
pub fn parse_client_frame(text: &str) -> Result<ClientCommand, FrameError> {
    let frame: ClientFrame =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
    let kind = kind_name(frame.kind);

    let session_id = match frame.session_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None if frame.kind.needs_session() => return Err(FrameError::MissingSession { kind }),
        None => String::new(),
    };

    let invalid = |reason: String| FrameError::InvalidPayload {
        session_id: Some(session_id.clone()).filter(|id| !id.is_empty()),
        kind,
        reason,
    };

    let command = match frame.kind {
        ClientKind::Input => match frame.payload {
            Value::String(data) => ClientCommand::Input {
                session_id: session_id.clone(),
                data,
            },
            other => return Err(invalid(format!("expected a string, got {}", other))),
        },
        ClientKind::Resize => {
            let dimensions: Dimensions =
                serde_json::from_value(frame.payload).map_err(|e| invalid(e.to_string()))?;
            if !dimensions.is_valid() {
                return Err(invalid(format!(
                    "rows and cols must be non-zero, got {}x{}",
                    dimensions.cols, dimensions.rows
                )));
            }
            ClientCommand::Resize {
                session_id: session_id.clone(),
                dimensions,
            }
        }
        ClientKind::Create => {
            let request = if frame.payload.is_null() {
                CreateRequest::default()
            } else {
                serde_json::from_value(frame.payload).map_err(|e| invalid(e.to_string()))?
            };
            ClientCommand::Create { request }
        }
        ClientKind::Attach => {
            let after_seq = match &frame.payload {
                Value::Null => None,
                Value::Object(fields) => match fields.get("afterSeq") {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(value.as_u64().ok_or_else(|| {
                        invalid(format!("afterSeq must be a non-negative integer, got {}", value))
                    })?),
                },
                other => return Err(invalid(format!("expected an object, got {}", other))),
            };
            ClientCommand::Attach {
                session_id: session_id.clone(),
                after_seq,
            }
        }
        ClientKind::Detach => ClientCommand::Detach {
            session_id: session_id.clone(),
        },
        ClientKind::Terminate => ClientCommand::Terminate {
            session_id: session_id.clone(),
        },
        ClientKind::List => ClientCommand::List,
    };

    Ok(command)
}

/// Frame kinds the server sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerKind {
    Output,
    SessionClosed,
    Error,
    SessionCreated,
    Attached,
    Detached,
    Sessions,
}

/// Frame sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    pub session_id: Option<SessionId>,
    pub kind: ServerKind,
    pub payload: Value,
    /// Output sequence number; lets a reconnecting client resume with `afterSeq`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl ServerFrame {
    fn new(session_id: Option<&str>, kind: ServerKind, payload: Value) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            kind,
            payload,
            seq: None,
        }
    }

    /// Output chunks are cut on character boundaries upstream, so lossy
    /// decoding only replaces bytes that were never valid UTF-8
    pub fn output(session_id: &str, seq: u64, data: &Bytes) -> Self {
        Self {
            seq: Some(seq),
            ..Self::new(
                Some(session_id),
                ServerKind::Output,
                Value::String(String::from_utf8_lossy(data).into_owned()),
            )
        }
    }

    pub fn session_closed(session_id: &str, reason: &CloseReason, exit_code: Option<i32>) -> Self {
        Self::new(
            Some(session_id),
            ServerKind::SessionClosed,
            json!({
                "reason": reason.to_string(),
                "code": reason.code(),
                "exitCode": exit_code,
            }),
        )
    }

    pub fn error(session_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(
            session_id,
            ServerKind::Error,
            json!({ "message": message.into() }),
        )
    }

    pub fn session_created(session_id: &str, status: SessionStatus, dimensions: Dimensions) -> Self {
        Self::new(
            Some(session_id),
            ServerKind::SessionCreated,
            json!({ "status": status, "dimensions": dimensions }),
        )
    }

    pub fn attached(
        session_id: &str,
        status: SessionStatus,
        dimensions: Dimensions,
        replayed: usize,
    ) -> Self {
        Self::new(
            Some(session_id),
            ServerKind::Attached,
            json!({ "status": status, "dimensions": dimensions, "replayed": replayed }),
        )
    }

    pub fn detached(session_id: &str) -> Self {
        Self::new(Some(session_id), ServerKind::Detached, Value::Null)
    }

    pub fn sessions(sessions: &[SessionInfo]) -> Self {
        Self::new(None, ServerKind::Sessions, json!(sessions))
    }
}
