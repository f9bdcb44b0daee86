/// PTY adapter abstraction: the only seam through which sessions touch
/// OS process and pseudo-terminal APIs
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

use termbridge_types::Dimensions;

use super::error::Result;

/// Everything needed to start a process behind a new pseudo-terminal
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub dimensions: Dimensions,
    /// Capacity of the event queue; the producer blocks when it is full
    pub event_capacity: usize,
}

/// Events produced by a running PTY, in production order
#[derive(Debug, Clone, PartialEq)]
pub enum PtyEvent {
    /// Raw bytes read from the PTY master
    Output(Bytes),
    /// The writer hit a broken pipe or similar
    WriteFailed(String),
    /// Process exited; always the final event
    Exited { code: Option<i32> },
}

/// Control half of a spawned PTY. Owned exclusively by one session.
pub trait PtyControl: Send + Sync {
    /// Queue bytes for the process. Order is preserved; fails once the
    /// writer side is gone.
    fn write(&self, data: Bytes) -> Result<()>;

    /// Apply new geometry. Unsupported or failed resizes are not errors.
    fn resize(&self, dimensions: Dimensions);

    /// Request termination. Killing an already-dead process is a no-op.
    fn kill(&self);

    fn pid(&self) -> Option<u32>;
}

/// A freshly spawned process: its control handle plus the output stream
pub struct SpawnedPty {
    pub control: Box<dyn PtyControl>,
    pub events: mpsc::Receiver<PtyEvent>,
}

impl std::fmt::Debug for SpawnedPty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedPty")
            .field("pid", &self.control.pid())
            .finish_non_exhaustive()
    }
}

/// Factory for PTY processes
#[async_trait]
pub trait PtyBackend: Send + Sync {
    /// Start `request.command` attached to a new pseudo-terminal.
    /// Fails with `TerminalError::Spawn` on invalid cwd, missing executable
    /// or OS resource limits.
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedPty>;

    /// Get backend name for debugging
    fn backend_name(&self) -> &str;
}
