//! Core types shared across termbridge crates
//!
//! This crate holds the small, wire-visible vocabulary of the terminal bridge:
//! terminal geometry, session status strings and close reasons.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Constants
// ============================================================================

/// Default terminal height in rows
pub const DEFAULT_ROWS: u16 = 24;

/// Default terminal width in columns
pub const DEFAULT_COLS: u16 = 80;

// ============================================================================
// Terminal geometry
// ============================================================================

/// Terminal geometry in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub rows: u16,
    pub cols: u16,
}

impl Dimensions {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// A zero-sized terminal cannot be applied to a PTY
    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

// ============================================================================
// Session status
// ============================================================================

/// Session status as reported on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Creating,
    Ready,
    Running,
    Idle,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Ready => "ready",
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    /// `stopped` is the only state with no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped)
    }

    /// Whether the session can still accept input
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionStatus::Ready | SessionStatus::Running | SessionStatus::Idle
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown session status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for SessionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creating" => Ok(SessionStatus::Creating),
            "ready" => Ok(SessionStatus::Ready),
            "running" => Ok(SessionStatus::Running),
            "idle" => Ok(SessionStatus::Idle),
            "stopped" => Ok(SessionStatus::Stopped),
            "error" => Ok(SessionStatus::Error),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

// ============================================================================
// Close reasons
// ============================================================================

/// Why a session reached `stopped`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "kebab-case")]
pub enum CloseReason {
    /// Explicit close from a client or the REST facade
    Requested,
    /// Detached and inactive past the idle threshold
    IdleTimeout,
    /// A sampled resource exceeded its configured cap
    ResourceLimit(String),
    /// The shell process exited on its own
    ProcessExited,
    /// PTY fault (spawn race, broken pipe, reader failure)
    Fault(String),
    /// Server shutting down
    Shutdown,
}

impl CloseReason {
    /// Short machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            CloseReason::Requested => "closed",
            CloseReason::IdleTimeout => "idle-timeout",
            CloseReason::ResourceLimit(_) => "resource-limit",
            CloseReason::ProcessExited => "exited",
            CloseReason::Fault(_) => "error",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("session closed by request"),
            CloseReason::IdleTimeout => f.write_str("idle-timeout: session inactive and detached"),
            CloseReason::ResourceLimit(detail) => write!(f, "resource-limit: {}", detail),
            CloseReason::ProcessExited => f.write_str("shell process exited"),
            CloseReason::Fault(detail) => write!(f, "terminal error: {}", detail),
            CloseReason::Shutdown => f.write_str("server shutting down"),
        }
    }
}
