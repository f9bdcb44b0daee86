use thiserror::Error;

/// Errors surfaced by the terminal session core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TerminalError {
    /// The OS refused to start the process; no session was created
    #[error("Failed to spawn terminal: {reason}")]
    Spawn { reason: String, retryable: bool },

    #[error("Session '{id}' not found")]
    NotFound { id: String },

    /// Input could not be delivered to a dead process
    #[error("Write to session '{id}' failed: {reason}")]
    Write { id: String, reason: String },

    /// Reaper-triggered termination; reported as a close reason, never to a caller
    #[error("Session '{id}' exceeded resource limit: {detail}")]
    ResourceLimit { id: String, detail: String },

    /// The process is not reading its input fast enough; the session stays up
    #[error("Input queue for session '{id}' is full")]
    InputQueueFull { id: String },

    #[error("Maximum concurrent sessions ({max}) reached")]
    LimitReached { max: usize },

    #[error("Invalid terminal dimensions {rows}x{cols}")]
    InvalidDimensions { rows: u16, cols: u16 },

    #[error("Session registry is shutting down")]
    ShuttingDown,
}

impl TerminalError {
    pub(crate) fn not_found(id: &str) -> Self {
        TerminalError::NotFound { id: id.to_string() }
    }

    pub(crate) fn spawn(reason: impl Into<String>, retryable: bool) -> Self {
        TerminalError::Spawn {
            reason: reason.into(),
            retryable,
        }
    }

    /// Transient failures (PTY allocation) that are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, TerminalError::Spawn { retryable: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, TerminalError>;
