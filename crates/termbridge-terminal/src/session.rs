use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use termbridge_types::{CloseReason, Dimensions, SessionStatus};

use super::backend::PtyControl;
use super::error::{Result, TerminalError};
use super::logger::TranscriptLogger;
use super::output_buffer::{OutputBuffer, OutputChunk};

/// Session ID type
pub type SessionId = String;

/// Identifies one transport connection
pub type ConnectionId = Uuid;

/// Internal session state. `SessionStatus` is its wire projection.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Creating,
    Ready,
    Running,
    Idle,
    Error { message: String },
    Stopped {
        reason: CloseReason,
        exit_code: Option<i32>,
    },
}

impl SessionState {
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionState::Creating => SessionStatus::Creating,
            SessionState::Ready => SessionStatus::Ready,
            SessionState::Running => SessionStatus::Running,
            SessionState::Idle => SessionStatus::Idle,
            SessionState::Error { .. } => SessionStatus::Error,
            SessionState::Stopped { .. } => SessionStatus::Stopped,
        }
    }

    fn accepts_input(&self) -> bool {
        matches!(
            self,
            SessionState::Ready | SessionState::Running | SessionState::Idle
        )
    }
}

/// Last observed resource usage of the session's process
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub disk_written_bytes: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Events fanned out to every attached connection, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Output(OutputChunk),
    Error { message: String },
    /// Always the last event a session publishes
    Closed {
        reason: CloseReason,
        exit_code: Option<i32>,
    },
}

/// Serializable status snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub status: SessionStatus,
    pub command: String,
    pub working_dir: String,
    pub pid: Option<u32>,
    pub dimensions: Dimensions,
    pub created_at: String,
    pub last_activity_at: String,
    pub idle_seconds: u64,
    pub attached_connections: usize,
    pub owner_connection_id: Option<ConnectionId>,
    pub buffered_bytes: usize,
    pub exit_code: Option<i32>,
    pub close_reason: Option<String>,
    pub resource: Option<ResourceSample>,
}

/// What the reaper sees of a session in one sweep
#[derive(Debug, Clone, Copy)]
pub(crate) struct SweepCandidate {
    pub generation: u64,
    pub idle: Duration,
    pub attached: usize,
    pub pid: Option<u32>,
    pub status: SessionStatus,
}

struct SessionInner {
    state: SessionState,
    control: Option<Box<dyn PtyControl>>,
    pid: Option<u32>,
    owner: Option<ConnectionId>,
    attached: Vec<ConnectionId>,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    /// Bumped on every activity; lets the reaper detect races
    generation: u64,
    buffer: OutputBuffer,
    dimensions: Dimensions,
    resource: Option<ResourceSample>,
    transcript: Option<TranscriptLogger>,
}

impl SessionInner {
    fn touch(&mut self) {
        self.generation += 1;
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
        if matches!(self.state, SessionState::Ready | SessionState::Idle) {
            self.state = SessionState::Running;
        }
    }

    fn transcript<F>(&mut self, write: F)
    where
        F: FnOnce(&mut TranscriptLogger) -> std::io::Result<()>,
    {
        if let Some(logger) = self.transcript.as_mut() {
            if let Err(e) = write(logger) {
                warn!("transcript write failed, disabling transcript: {}", e);
                self.transcript = None;
            }
        }
    }
}

/// One interactive shell instance.
///
/// All state transitions happen here, under the session lock, which is never
/// held across an await point.
pub struct Session {
    id: SessionId,
    command: String,
    working_dir: PathBuf,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        command: String,
        working_dir: PathBuf,
        dimensions: Dimensions,
        buffer: OutputBuffer,
        broadcast_capacity: usize,
        owner: Option<ConnectionId>,
        transcript: Option<TranscriptLogger>,
    ) -> Self {
        let (events, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            id,
            command,
            working_dir,
            created_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Creating,
                control: None,
                pid: None,
                owner,
                attached: owner.into_iter().collect(),
                last_activity: Instant::now(),
                last_activity_at: Utc::now(),
                generation: 0,
                buffer,
                dimensions,
                resource: None,
                transcript,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        // A panic while holding the lock must not wedge the whole registry
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().state.status()
    }

    pub fn dimensions(&self) -> Dimensions {
        self.lock().dimensions
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn owner(&self) -> Option<ConnectionId> {
        self.lock().owner
    }

    pub fn attached_count(&self) -> usize {
        self.lock().attached.len()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn resource_sample(&self) -> Option<ResourceSample> {
        self.lock().resource
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.lock().last_activity)
    }

    /// Everything currently held in the replay buffer
    pub fn buffered_output(&self) -> Vec<OutputChunk> {
        self.lock().buffer.replay()
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.lock();
        let (exit_code, close_reason) = match &inner.state {
            SessionState::Stopped { reason, exit_code } => (*exit_code, Some(reason.to_string())),
            SessionState::Error { message } => (None, Some(message.clone())),
            _ => (None, None),
        };

        SessionInfo {
            id: self.id.clone(),
            status: inner.state.status(),
            command: self.command.clone(),
            working_dir: self.working_dir.display().to_string(),
            pid: inner.pid,
            dimensions: inner.dimensions,
            created_at: self.created_at.to_rfc3339(),
            last_activity_at: inner.last_activity_at.to_rfc3339(),
            idle_seconds: inner.last_activity.elapsed().as_secs(),
            attached_connections: inner.attached.len(),
            owner_connection_id: inner.owner,
            buffered_bytes: inner.buffer.total_bytes(),
            exit_code,
            close_reason,
            resource: inner.resource,
        }
    }

    /// Hand the spawned process to the session: `creating -> ready`.
    /// Gives the handle back if the session was stopped while spawning.
    pub(crate) fn bind_process(
        &self,
        control: Box<dyn PtyControl>,
    ) -> std::result::Result<(), Box<dyn PtyControl>> {
        let mut inner = self.lock();
        if inner.state != SessionState::Creating {
            return Err(control);
        }
        inner.pid = control.pid();
        inner.control = Some(control);
        inner.state = SessionState::Ready;
        inner.last_activity = Instant::now();
        inner.last_activity_at = Utc::now();

        let (pid, dimensions) = (inner.pid, inner.dimensions);
        let command = self.command.clone();
        let working_dir = self.working_dir.display().to_string();
        let id = self.id.clone();
        inner.transcript(|t| t.write_metadata(&id, &command, &working_dir, pid, dimensions));
        Ok(())
    }

    /// Mark the session active. Returns false once it can no longer run.
    pub(crate) fn record_activity(&self) -> bool {
        let mut inner = self.lock();
        if !inner.state.accepts_input() {
            return false;
        }
        inner.touch();
        true
    }

    /// Forward client input to the process
    pub(crate) fn write_input(&self, data: Bytes) -> Result<()> {
        let failure = {
            let mut inner = self.lock();
            if !inner.state.accepts_input() {
                return Err(TerminalError::not_found(&self.id));
            }
            inner.touch();
            inner.transcript(|t| t.log_input(&data));

            let control = match inner.control.as_ref() {
                Some(control) => control,
                None => return Err(TerminalError::not_found(&self.id)),
            };
            match control.write(data) {
                Ok(()) => return Ok(()),
                Err(TerminalError::InputQueueFull { .. }) => {
                    return Err(TerminalError::InputQueueFull {
                        id: self.id.clone(),
                    })
                }
                Err(e) => match e {
                    TerminalError::Write { reason, .. } => reason,
                    other => other.to_string(),
                },
            }
        };

        self.fault(format!("write failed: {}", failure));
        Err(TerminalError::Write {
            id: self.id.clone(),
            reason: failure,
        })
    }

    /// Apply new geometry. Returns whether anything changed.
    pub(crate) fn resize(&self, dimensions: Dimensions) -> Result<bool> {
        if !dimensions.is_valid() {
            return Err(TerminalError::InvalidDimensions {
                rows: dimensions.rows,
                cols: dimensions.cols,
            });
        }

        let mut inner = self.lock();
        if !inner.state.accepts_input() {
            return Err(TerminalError::not_found(&self.id));
        }
        inner.touch();
        if inner.dimensions == dimensions {
            return Ok(false);
        }
        if let Some(control) = inner.control.as_ref() {
            control.resize(dimensions);
        }
        inner.dimensions = dimensions;
        inner.transcript(|t| t.log_resize(dimensions));
        Ok(true)
    }

    /// Buffer and fan out one chunk of process output. Returns false when the
    /// session has already closed and the chunk was discarded.
    pub(crate) fn publish_output(&self, data: Bytes) -> bool {
        let mut inner = self.lock();
        if matches!(
            inner.state,
            SessionState::Stopped { .. } | SessionState::Error { .. }
        ) {
            return false;
        }
        inner.touch();
        inner.transcript(|t| t.log_output(&data));
        let chunk = inner.buffer.push(data);
        // No receivers is fine: output is still buffered for replay
        let _ = self.events.send(SessionEvent::Output(chunk));
        true
    }

    /// Register a connection and return the replay buffer together with a
    /// live subscription, taken atomically so no chunk falls in between
    pub(crate) fn attach(
        &self,
        connection: ConnectionId,
    ) -> Result<(Vec<OutputChunk>, broadcast::Receiver<SessionEvent>)> {
        let mut inner = self.lock();
        if matches!(
            inner.state,
            SessionState::Stopped { .. } | SessionState::Error { .. }
        ) {
            return Err(TerminalError::not_found(&self.id));
        }
        if !inner.attached.contains(&connection) {
            inner.attached.push(connection);
        }
        inner.owner = Some(connection);
        Ok((inner.buffer.replay(), self.events.subscribe()))
    }

    /// Returns true if the connection was attached
    pub(crate) fn detach(&self, connection: ConnectionId) -> bool {
        let mut inner = self.lock();
        let before = inner.attached.len();
        inner.attached.retain(|c| *c != connection);
        if inner.owner == Some(connection) {
            inner.owner = inner.attached.last().copied();
        }
        before != inner.attached.len()
    }

    /// Chunks newer than `after_seq` still in the buffer, and how many were lost
    pub fn output_since(&self, after_seq: u64) -> (Vec<OutputChunk>, u64) {
        self.lock().buffer.since(after_seq)
    }

    pub(crate) fn set_resource_sample(&self, sample: ResourceSample) {
        self.lock().resource = Some(sample);
    }

    /// Transition to `stopped`. Only the first call has any effect; it
    /// publishes `Closed` and kills the process.
    pub(crate) fn stop(&self, reason: CloseReason, exit_code: Option<i32>) -> bool {
        let control = {
            let mut inner = self.lock();
            match self.stop_locked(&mut inner, reason, exit_code) {
                Some(control) => control,
                None => return false,
            }
        };
        if let Some(control) = control {
            control.kill();
        }
        true
    }

    /// Returns `None` if already stopped, otherwise the released handle
    fn stop_locked(
        &self,
        inner: &mut SessionInner,
        reason: CloseReason,
        exit_code: Option<i32>,
    ) -> Option<Option<Box<dyn PtyControl>>> {
        if matches!(inner.state, SessionState::Stopped { .. }) {
            return None;
        }
        let control = inner.control.take();
        inner.state = SessionState::Stopped {
            reason: reason.clone(),
            exit_code,
        };
        inner.attached.clear();
        inner.owner = None;
        inner.transcript(|t| t.log_closed(&reason, exit_code));
        inner.transcript = None;

        info!(session = %self.id, reason = reason.code(), ?exit_code, "session stopped");
        let _ = self.events.send(SessionEvent::Closed { reason, exit_code });
        Some(control)
    }

    /// PTY fault: `-> error -> stopped`, notifying attached connections of both
    pub(crate) fn fault(&self, message: String) -> bool {
        let control = {
            let mut inner = self.lock();
            if matches!(
                inner.state,
                SessionState::Stopped { .. } | SessionState::Error { .. }
            ) {
                return false;
            }
            warn!(session = %self.id, "session fault: {}", message);
            inner.state = SessionState::Error {
                message: message.clone(),
            };
            let _ = self.events.send(SessionEvent::Error {
                message: message.clone(),
            });
            self.stop_locked(&mut inner, CloseReason::Fault(message), None)
        };
        if let Some(Some(control)) = control {
            control.kill();
        }
        true
    }

    /// The process went away on its own
    pub(crate) fn finish(&self, exit_code: Option<i32>) {
        if !self.stop(CloseReason::ProcessExited, exit_code) {
            // Already stopped by request; keep the exit code for status queries
            let mut inner = self.lock();
            if let SessionState::Stopped { exit_code: code, .. } = &mut inner.state {
                if code.is_none() {
                    *code = exit_code;
                }
            }
        }
    }

    pub(crate) fn sweep_candidate(&self, now: Instant) -> Option<SweepCandidate> {
        let inner = self.lock();
        if !inner.state.accepts_input() {
            // creating, error and stopped sessions are never swept
            return None;
        }
        Some(SweepCandidate {
            generation: inner.generation,
            idle: now.saturating_duration_since(inner.last_activity),
            attached: inner.attached.len(),
            pid: inner.pid,
            status: inner.state.status(),
        })
    }

    /// `running -> idle`, unless activity arrived since the snapshot
    pub(crate) fn mark_idle_if_unchanged(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != SessionState::Running {
            return false;
        }
        inner.state = SessionState::Idle;
        debug!(session = %self.id, "session marked idle");
        true
    }

    /// Reaper termination: re-checks, under the lock, that nothing happened
    /// since the sweep snapshot and that no connection attached meanwhile
    pub(crate) fn stop_if_unchanged(
        &self,
        generation: u64,
        require_detached: bool,
        reason: CloseReason,
    ) -> bool {
        let control = {
            let mut inner = self.lock();
            if inner.generation != generation || !inner.state.accepts_input() {
                return false;
            }
            if require_detached && !inner.attached.is_empty() {
                return false;
            }
            match self.stop_locked(&mut inner, reason, None) {
                Some(control) => control,
                None => return false,
            }
        };
        if let Some(control) = control {
            control.kill();
        }
        true
    }
}
