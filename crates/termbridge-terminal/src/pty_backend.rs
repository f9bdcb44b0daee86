/// Native PTY backend built on portable-pty
use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use termbridge_types::Dimensions;

use super::backend::{PtyBackend, PtyControl, PtyEvent, SpawnRequest, SpawnedPty};
use super::error::{Result, TerminalError};
use super::{INPUT_QUEUE_CAPACITY, READ_CHUNK_SIZE};

/// Spawns shells on the host's native pseudo-terminal system
#[derive(Debug, Default, Clone)]
pub struct NativePtyBackend;

impl NativePtyBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PtyBackend for NativePtyBackend {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedPty> {
        tokio::task::spawn_blocking(move || open_and_spawn(request))
            .await
            .map_err(|e| TerminalError::spawn(format!("spawn task failed: {}", e), false))?
    }

    fn backend_name(&self) -> &str {
        "native-pty"
    }
}

fn pty_size(dimensions: Dimensions) -> PtySize {
    PtySize {
        rows: dimensions.rows,
        cols: dimensions.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn open_and_spawn(request: SpawnRequest) -> Result<SpawnedPty> {
    // portable-pty quietly falls back to $HOME for a bad cwd, so check first
    if !request.working_dir.is_dir() {
        return Err(TerminalError::spawn(
            format!(
                "working directory '{}' does not exist or is not a directory",
                request.working_dir.display()
            ),
            false,
        ));
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(pty_size(request.dimensions))
        .map_err(|e| TerminalError::spawn(format!("failed to open PTY: {}", e), true))?;

    let mut cmd = CommandBuilder::new(&request.command);
    cmd.args(&request.args);
    cmd.cwd(&request.working_dir);
    if !request.env.contains_key("TERM") {
        cmd.env("TERM", "xterm-256color");
    }
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    let child = pair.slave.spawn_command(cmd).map_err(|e| {
        TerminalError::spawn(
            format!("failed to spawn '{}': {}", request.command, e),
            false,
        )
    })?;

    // Drop the slave so reads see EOF once the child exits
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| TerminalError::spawn(format!("failed to clone PTY reader: {}", e), false))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| TerminalError::spawn(format!("failed to take PTY writer: {}", e), false))?;

    let (event_tx, event_rx) = mpsc::channel(request.event_capacity.max(1));
    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);

    spawn_reader(reader, child, event_tx.clone())?;
    spawn_writer(writer, input_rx, event_tx)?;

    debug!(command = %request.command, ?pid, "PTY process spawned");

    Ok(SpawnedPty {
        control: Box::new(NativePtyControl {
            master: Mutex::new(pair.master),
            input: input_tx,
            killer: Mutex::new(killer),
            killed: AtomicBool::new(false),
            pid,
        }),
        events: event_rx,
    })
}

/// Blocking read loop. Sends output until EOF, then reaps the child and
/// reports its exit code as the final event.
fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    events: mpsc::Sender<PtyEvent>,
) -> Result<()> {
    thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || {
            let mut buffer = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buffer[..n]);
                        // Blocks while the session's queue is full
                        if events.blocking_send(PtyEvent::Output(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how Linux reports a hung-up PTY
                        debug!("PTY read ended: {}", e);
                        break;
                    }
                }
            }

            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    warn!("failed to reap PTY child: {}", e);
                    None
                }
            };
            let _ = events.blocking_send(PtyEvent::Exited { code });
        })
        .map(|_| ())
        .map_err(|e| TerminalError::spawn(format!("failed to start reader thread: {}", e), true))
}

/// Dedicated writer so a slow process never blocks the async runtime.
/// Input order is the channel order.
fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<PtyEvent>,
) -> Result<()> {
    thread::Builder::new()
        .name("pty-writer".into())
        .spawn(move || {
            while let Some(data) = input.blocking_recv() {
                let result = writer.write_all(&data).and_then(|_| writer.flush());
                if let Err(e) = result {
                    let _ = events.blocking_send(PtyEvent::WriteFailed(e.to_string()));
                    break;
                }
            }
        })
        .map(|_| ())
        .map_err(|e| TerminalError::spawn(format!("failed to start writer thread: {}", e), true))
}

/// The child leads its own session; background jobs it started stay in that
/// session and keep the PTY open until they are gone too.
fn kill_session_members(leader: u32) {
    let leader = Pid::from_u32(leader);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing(),
    );

    let mut killed = 0;
    for (pid, process) in system.processes() {
        if *pid != leader
            && process.session_id() == Some(leader)
            && process.kill_with(Signal::Kill).unwrap_or(false)
        {
            killed += 1;
        }
    }
    if killed > 0 {
        debug!(leader = %leader, killed, "killed remaining session processes");
    }
}

struct NativePtyControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    input: mpsc::Sender<Bytes>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    killed: AtomicBool,
    pid: Option<u32>,
}

impl PtyControl for NativePtyControl {
    fn write(&self, data: Bytes) -> Result<()> {
        let id = self.pid.map(|p| p.to_string()).unwrap_or_default();
        self.input.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => TerminalError::InputQueueFull { id },
            TrySendError::Closed(_) => TerminalError::Write {
                id,
                reason: "PTY writer has shut down".to_string(),
            },
        })
    }

    fn resize(&self, dimensions: Dimensions) {
        let master = match self.master.lock() {
            Ok(master) => master,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = master.resize(pty_size(dimensions)) {
            debug!(pid = ?self.pid, "PTY resize ignored: {}", e);
        }
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut killer = match self.killer.lock() {
            Ok(killer) => killer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = killer.kill() {
            // Usually ESRCH: the process already exited
            debug!(pid = ?self.pid, "kill was a no-op: {}", e);
        }
        drop(killer);

        if let Some(leader) = self.pid {
            kill_session_members(leader);
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}
