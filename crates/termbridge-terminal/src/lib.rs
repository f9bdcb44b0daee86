// Terminal session core
//
// This crate owns pseudo-terminal sessions for the bridge: spawning shells behind
// a PTY, keeping their state and recent output alive across client reconnects,
// and retiring them once they go idle or exceed their resource caps.

mod error;
mod config;
mod output_buffer;
mod session;
mod registry;
mod logger;
pub mod backend;
mod pty_backend;
pub mod reaper;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export public API
pub use backend::{PtyBackend, PtyControl, PtyEvent, SpawnRequest, SpawnedPty};
pub use config::{ResourceLimits, TerminalConfig};
pub use error::{Result, TerminalError};
pub use output_buffer::{OutputBuffer, OutputChunk, Utf8Carry};
pub use pty_backend::NativePtyBackend;
pub use reaper::{Reaper, ResourceSampler, SweepReport, SysinfoSampler};
pub use registry::{Attachment, CreateOptions, RegistryStats, SessionRegistry};
pub use session::{
    ConnectionId, ResourceSample, Session, SessionEvent, SessionId, SessionInfo, SessionState,
};
pub use termbridge_types::{CloseReason, Dimensions, SessionStatus};

// Constants
pub const DEFAULT_MAX_SESSIONS: usize = 10;
pub const DEFAULT_OUTPUT_BUFFER_BYTES: usize = 256 * 1024;
pub const DEFAULT_OUTPUT_BUFFER_CHUNKS: usize = 2048;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800; // 30 minutes
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300; // 5 minutes
pub const READ_CHUNK_SIZE: usize = 4096;
/// Pending input chunks per session before writes are refused
pub const INPUT_QUEUE_CAPACITY: usize = 1024;
