use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use termbridge_types::{CloseReason, Dimensions};

use super::backend::{PtyBackend, PtyEvent, SpawnRequest, SpawnedPty};
use super::config::TerminalConfig;
use super::error::{Result, TerminalError};
use super::logger::TranscriptLogger;
use super::output_buffer::{OutputBuffer, OutputChunk, Utf8Carry};
use super::session::{
    ConnectionId, Session, SessionEvent, SessionId, SessionInfo, SweepCandidate,
};

/// Per-request overrides for a new session
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Program to run instead of the configured shell
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// A connection's view of a session after attaching
pub struct Attachment {
    pub session: Arc<Session>,
    /// Buffered output produced before the attach, oldest first
    pub replay: Vec<OutputChunk>,
    /// Live events published after the replay snapshot
    pub events: broadcast::Receiver<SessionEvent>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("session", &self.session.id())
            .field("replay_chunks", &self.replay.len())
            .finish()
    }
}

/// Registry statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub sessions_by_status: BTreeMap<String, usize>,
    pub backend: String,
    pub platform: String,
    pub shell: String,
}

struct RegistryInner {
    config: TerminalConfig,
    backend: Arc<dyn PtyBackend>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    shutting_down: AtomicBool,
}

/// Authoritative store of terminal sessions.
///
/// Cheap to clone; every clone refers to the same sessions. Created once at
/// server start with [`SessionRegistry::init`] and torn down with
/// [`SessionRegistry::shutdown`].
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("backend", &self.inner.backend.backend_name())
            .field("max_sessions", &self.inner.config.max_sessions)
            .finish()
    }
}

impl SessionRegistry {
    pub fn init(config: TerminalConfig, backend: Arc<dyn PtyBackend>) -> Self {
        info!(
            backend = backend.backend_name(),
            max_sessions = config.max_sessions,
            "session registry initialised"
        );
        Self {
            inner: Arc::new(RegistryInner {
                config,
                backend,
                sessions: RwLock::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.inner.config
    }

    /// Spawn a new shell session.
    ///
    /// The entry is visible as `creating` while the process starts, and is
    /// removed again if the spawn fails.
    pub async fn create_session(
        &self,
        owner: Option<ConnectionId>,
        dimensions: Option<Dimensions>,
        options: CreateOptions,
    ) -> Result<Arc<Session>> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(TerminalError::ShuttingDown);
        }

        let config = &self.inner.config;
        let dimensions = dimensions.unwrap_or_else(|| config.default_dimensions());
        if !dimensions.is_valid() {
            return Err(TerminalError::InvalidDimensions {
                rows: dimensions.rows,
                cols: dimensions.cols,
            });
        }

        let (command, args) = match options.command {
            Some(command) => (command, options.args.unwrap_or_default()),
            None => (config.resolved_shell(), config.shell_args.clone()),
        };
        let working_dir = options
            .working_dir
            .unwrap_or_else(|| config.resolved_working_dir());
        let mut env = config.env.clone();
        env.extend(options.env);

        let id = Uuid::new_v4().to_string();
        let transcript = config.transcript_dir.as_ref().and_then(|dir| {
            TranscriptLogger::new(&id, dir)
                .map_err(|e| warn!(session = %id, "transcript disabled: {}", e))
                .ok()
        });

        let session = Arc::new(Session::new(
            id.clone(),
            command.clone(),
            working_dir.clone(),
            dimensions,
            OutputBuffer::new(config.output_buffer_bytes, config.output_buffer_chunks),
            config.broadcast_capacity,
            owner,
            transcript,
        ));

        let mut reclaimed = false;
        loop {
            let mut sessions = self.inner.sessions.write().await;
            // shutdown() may have drained the map while we waited for the lock
            if self.is_shutting_down() {
                return Err(TerminalError::ShuttingDown);
            }
            let live = sessions
                .values()
                .filter(|s| !s.status().is_terminal())
                .count();
            if live < config.max_sessions {
                sessions.insert(id.clone(), Arc::clone(&session));
                break;
            }
            drop(sessions);

            // At the cap: retire abandoned sessions before refusing
            if reclaimed || self.reap_idle_at(Instant::now()).await.is_empty() {
                return Err(TerminalError::LimitReached {
                    max: config.max_sessions,
                });
            }
            reclaimed = true;
        }

        let request = SpawnRequest {
            command,
            args,
            working_dir,
            env,
            dimensions,
            event_capacity: config.output_channel_capacity,
        };

        let SpawnedPty { control, events } = match self.spawn_with_retry(request).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.inner.sessions.write().await.remove(&id);
                warn!(session = %id, "spawn failed: {}", e);
                return Err(e);
            }
        };

        if let Err(control) = session.bind_process(control) {
            // Stopped while the process was starting (shutdown)
            control.kill();
            self.schedule_removal(&session);
            return Err(TerminalError::ShuttingDown);
        }

        self.spawn_pump(Arc::clone(&session), events);

        info!(
            session = %id,
            command = session.command(),
            pid = ?session.pid(),
            %dimensions,
            "session created"
        );
        Ok(session)
    }

    async fn spawn_with_retry(&self, request: SpawnRequest) -> Result<SpawnedPty> {
        let attempts = self.inner.config.spawn_attempts.max(1);
        let mut attempt = 0;

        loop {
            match self.inner.backend.spawn(request.clone()).await {
                Ok(spawned) => return Ok(spawned),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    attempt += 1;
                    // Exponential backoff
                    let wait = Duration::from_millis(100 * 2_u64.pow(attempt));
                    warn!(
                        attempt = attempt + 1,
                        "retrying PTY creation in {:?}: {}",
                        wait,
                        e
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain the PTY's event stream into the session, in production order
    fn spawn_pump(&self, session: Arc<Session>, mut events: mpsc::Receiver<PtyEvent>) {
        let registry = self.clone();

        tokio::spawn(async move {
            let mut carry = Utf8Carry::new();
            let mut exit_code = None;

            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::Output(data) => {
                        let complete = carry.push(&data);
                        if !complete.is_empty() {
                            // Returns false after close; keep draining for the exit code
                            session.publish_output(complete);
                        }
                    }
                    PtyEvent::WriteFailed(reason) => {
                        session.fault(format!("write failed: {}", reason));
                    }
                    PtyEvent::Exited { code } => {
                        exit_code = code;
                        break;
                    }
                }
            }

            if let Some(rest) = carry.flush() {
                session.publish_output(rest);
            }
            session.finish(exit_code);
            registry.schedule_removal(&session);
        });
    }

    /// Drop a stopped session from the map once the grace window has passed
    pub(crate) fn schedule_removal(&self, session: &Arc<Session>) {
        let registry = self.clone();
        let session = Arc::clone(session);
        let grace = self.inner.config.termination_grace();

        tokio::spawn(async move {
            if !grace.is_zero() {
                tokio::time::sleep(grace).await;
            }
            let mut sessions = registry.inner.sessions.write().await;
            let same = sessions
                .get(session.id())
                .map(|existing| Arc::ptr_eq(existing, &session))
                .unwrap_or(false);
            if same && session.status().is_terminal() {
                sessions.remove(session.id());
                debug!(session = %session.id(), "session removed from registry");
            }
        });
    }

    /// Stop every detached session idle for at least `idle_timeout`.
    /// Returns the ids it stopped.
    pub async fn reap_idle_at(&self, now: Instant) -> Vec<SessionId> {
        self.sessions()
            .await
            .into_iter()
            .filter(|session| match session.sweep_candidate(now) {
                Some(candidate) => self.reap_if_idle(session, &candidate),
                None => false,
            })
            .map(|session| session.id().to_string())
            .collect()
    }

    /// Idle retirement rule shared with the reaper. The stop re-checks the
    /// generation so activity since `candidate` was taken wins.
    pub(crate) fn reap_if_idle(&self, session: &Arc<Session>, candidate: &SweepCandidate) -> bool {
        let idle_timeout = self.inner.config.idle_timeout();
        // A zero timeout disables idle reaping
        if idle_timeout.is_zero() || candidate.attached > 0 || candidate.idle < idle_timeout {
            return false;
        }
        if !session.stop_if_unchanged(candidate.generation, true, CloseReason::IdleTimeout) {
            return false;
        }
        info!(session = %session.id(), idle = ?candidate.idle, "reaped idle session");
        self.schedule_removal(session);
        true
    }

    /// Get a session by ID
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().await.get(id).cloned()
    }

    pub async fn require(&self, id: &str) -> Result<Arc<Session>> {
        self.get(id)
            .await
            .ok_or_else(|| TerminalError::not_found(id))
    }

    /// Bind a connection to a session (first attach or reconnect)
    pub async fn attach(&self, id: &str, connection: ConnectionId) -> Result<Attachment> {
        let session = self.require(id).await?;
        let (replay, events) = session.attach(connection)?;
        debug!(session = %id, %connection, replay = replay.len(), "connection attached");
        Ok(Attachment {
            session,
            replay,
            events,
        })
    }

    pub async fn detach(&self, id: &str, connection: ConnectionId) -> bool {
        match self.get(id).await {
            Some(session) => session.detach(connection),
            None => false,
        }
    }

    /// Clear a closed connection from every session; the shells keep running
    pub async fn detach_all(&self, connection: ConnectionId) -> usize {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.read().await.values().cloned().collect();
        sessions
            .iter()
            .filter(|session| session.detach(connection))
            .count()
    }

    pub async fn record_activity(&self, id: &str) -> Result<()> {
        let session = self.require(id).await?;
        if session.record_activity() {
            Ok(())
        } else {
            Err(TerminalError::not_found(id))
        }
    }

    /// Send input bytes to a session's process
    pub async fn write(&self, id: &str, data: Bytes) -> Result<()> {
        let session = self.require(id).await?;
        let result = session.write_input(data);
        if let Err(TerminalError::Write { .. }) = &result {
            self.schedule_removal(&session);
        }
        result
    }

    pub async fn resize(&self, id: &str, dimensions: Dimensions) -> Result<bool> {
        self.require(id).await?.resize(dimensions)
    }

    /// Stop a session. Idempotent: returns whether this call did the stopping.
    pub async fn terminate(&self, id: &str, reason: CloseReason) -> Result<bool> {
        let session = self.require(id).await?;
        let performed = session.stop(reason, None);
        if performed {
            self.schedule_removal(&session);
        }
        Ok(performed)
    }

    /// Snapshot of every session, oldest first
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut sessions = self.sessions().await;
        sessions.sort_by_key(|s| s.created_at());
        sessions.iter().map(|s| s.info()).collect()
    }

    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> RegistryStats {
        let sessions = self.sessions().await;
        let mut by_status = BTreeMap::new();
        for session in &sessions {
            *by_status.entry(session.status().to_string()).or_insert(0) += 1;
        }
        let active = sessions
            .iter()
            .filter(|s| !s.status().is_terminal())
            .count();

        RegistryStats {
            active_sessions: active,
            max_sessions: self.inner.config.max_sessions,
            sessions_by_status: by_status,
            backend: self.inner.backend.backend_name().to_string(),
            platform: std::env::consts::OS.to_string(),
            shell: self.inner.config.resolved_shell(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Refuse new sessions and stop every existing one
    pub async fn shutdown(&self) -> usize {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();

        let stopped = sessions
            .iter()
            .filter(|session| session.stop(CloseReason::Shutdown, None))
            .count();
        info!(stopped, "session registry shut down");
        stopped
    }
}
