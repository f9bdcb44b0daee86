use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use termbridge_types::{Dimensions, DEFAULT_COLS, DEFAULT_ROWS};

use super::{
    DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_SESSIONS, DEFAULT_OUTPUT_BUFFER_BYTES,
    DEFAULT_OUTPUT_BUFFER_CHUNKS, DEFAULT_SWEEP_INTERVAL_SECS,
};

/// Resource caps enforced by the reaper. `None` disables a check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_percent: Option<f32>,
    pub max_disk_bytes: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.max_memory_bytes.is_none()
            && self.max_cpu_percent.is_none()
            && self.max_disk_bytes.is_none()
    }
}

/// Configuration consumed by the session core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell to launch; falls back to $SHELL, then /bin/bash (cmd.exe on Windows)
    pub shell: Option<String>,
    pub shell_args: Vec<String>,
    /// Working directory for new sessions; defaults to the server's cwd
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub default_rows: u16,
    pub default_cols: u16,
    pub max_sessions: usize,
    /// Attempts for retryable spawn failures, with exponential backoff
    pub spawn_attempts: u32,
    /// Detached sessions idle longer than this are reaped
    pub idle_timeout_secs: u64,
    /// Running sessions idle longer than this are marked idle
    pub idle_after_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long a stopped session stays queryable before removal
    pub termination_grace_ms: u64,
    pub output_buffer_bytes: usize,
    pub output_buffer_chunks: usize,
    /// Capacity of the per-session PTY event queue; the reader blocks when full
    pub output_channel_capacity: usize,
    /// Capacity of the per-session fan-out channel to attached connections
    pub broadcast_capacity: usize,
    #[serde(flatten)]
    pub limits: ResourceLimits,
    /// Directory for JSON-lines session transcripts; disabled when unset
    pub transcript_dir: Option<PathBuf>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: None,
            shell_args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            default_rows: DEFAULT_ROWS,
            default_cols: DEFAULT_COLS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            spawn_attempts: 3,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            idle_after_secs: 60,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            termination_grace_ms: 2000,
            output_buffer_bytes: DEFAULT_OUTPUT_BUFFER_BYTES,
            output_buffer_chunks: DEFAULT_OUTPUT_BUFFER_CHUNKS,
            output_channel_capacity: 256,
            broadcast_capacity: 512,
            limits: ResourceLimits::default(),
            transcript_dir: None,
        }
    }
}

impl TerminalConfig {
    /// Resolve the shell command for new sessions
    pub fn resolved_shell(&self) -> String {
        if let Some(shell) = &self.shell {
            return shell.clone();
        }
        if cfg!(windows) {
            "cmd.exe".to_string()
        } else {
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
        }
    }

    pub fn resolved_working_dir(&self) -> PathBuf {
        self.working_dir.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
        })
    }

    pub fn default_dimensions(&self) -> Dimensions {
        Dimensions::new(self.default_rows, self.default_cols)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        // A zero interval would make tokio::time::interval panic
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}
