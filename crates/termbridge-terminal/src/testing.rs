//! Scripted in-memory PTY backend for deterministic tests.
//!
//! `ScriptedBackend` hands out `FakeControl` handles that record every write,
//! resize and kill, and let the test inject output and exit events.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

use termbridge_types::Dimensions;

use crate::backend::{PtyBackend, PtyControl, PtyEvent, SpawnRequest, SpawnedPty};
use crate::error::{Result, TerminalError};

#[derive(Default)]
struct FakeState {
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<Dimensions>>,
    kills: AtomicUsize,
    killed: AtomicBool,
    broken: AtomicBool,
    pid: Option<u32>,
    events: Mutex<Option<mpsc::Sender<PtyEvent>>>,
}

/// Recording PTY control handle
#[derive(Clone, Default)]
pub struct FakeControl {
    state: Arc<FakeState>,
}

impl FakeControl {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            state: Arc::new(FakeState {
                pid,
                ..Default::default()
            }),
        }
    }

    fn with_events(pid: Option<u32>, events: mpsc::Sender<PtyEvent>) -> Self {
        let control = Self::new(pid);
        *control.state.events.lock().unwrap() = Some(events);
        control
    }

    fn sender(&self) -> Option<mpsc::Sender<PtyEvent>> {
        self.state.events.lock().unwrap().clone()
    }

    /// All bytes written so far, in order
    pub fn written(&self) -> Vec<u8> {
        self.state.written.lock().unwrap().clone()
    }

    pub fn written_string(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    pub fn resizes(&self) -> Vec<Dimensions> {
        self.state.resizes.lock().unwrap().clone()
    }

    pub fn kill_count(&self) -> usize {
        self.state.kills.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail as if the process had gone away
    pub fn break_pipe(&self) {
        self.state.broken.store(true, Ordering::SeqCst);
    }

    /// Produce output as the process would
    pub async fn emit(&self, data: impl Into<Bytes>) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(PtyEvent::Output(data.into())).await;
        }
    }

    /// Report a writer-side failure through the event stream
    pub async fn fail_write(&self, reason: &str) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(PtyEvent::WriteFailed(reason.to_string())).await;
        }
    }

    /// End the output stream with an exit code
    pub async fn exit(&self, code: i32) {
        let sender = self.state.events.lock().unwrap().take();
        if let Some(tx) = sender {
            let _ = tx.send(PtyEvent::Exited { code: Some(code) }).await;
        }
    }
}

impl PtyControl for FakeControl {
    fn write(&self, data: Bytes) -> Result<()> {
        if self.state.broken.load(Ordering::SeqCst) {
            return Err(TerminalError::Write {
                id: String::new(),
                reason: "broken pipe".to_string(),
            });
        }
        self.state.written.lock().unwrap().extend_from_slice(&data);
        Ok(())
    }

    fn resize(&self, dimensions: Dimensions) {
        self.state.resizes.lock().unwrap().push(dimensions);
    }

    fn kill(&self) {
        self.state.kills.fetch_add(1, Ordering::SeqCst);
        if self.state.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        // A killed process ends its output stream
        if let Some(tx) = self.state.events.lock().unwrap().take() {
            let _ = tx.try_send(PtyEvent::Exited { code: None });
        }
    }

    fn pid(&self) -> Option<u32> {
        self.state.pid
    }
}

/// Backend that spawns `FakeControl`s instead of processes
#[derive(Default)]
pub struct ScriptedBackend {
    spawned: Mutex<Vec<(SpawnRequest, FakeControl)>>,
    failures: Mutex<VecDeque<TerminalError>>,
    gate: Mutex<Option<Arc<Notify>>>,
    attempts: AtomicUsize,
    next_pid: AtomicU32,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        }
    }

    /// Fail the next spawn attempt with `error`
    pub fn fail_next(&self, error: TerminalError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Make spawns wait until the returned `Notify` is signalled
    pub fn hold_spawns(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn control(&self, index: usize) -> FakeControl {
        self.spawned.lock().unwrap()[index].1.clone()
    }

    pub fn last_control(&self) -> FakeControl {
        self.spawned
            .lock()
            .unwrap()
            .last()
            .map(|(_, control)| control.clone())
            .expect("nothing spawned yet")
    }

    pub fn last_request(&self) -> SpawnRequest {
        self.spawned
            .lock()
            .unwrap()
            .last()
            .map(|(request, _)| request.clone())
            .expect("nothing spawned yet")
    }
}

#[async_trait]
impl PtyBackend for ScriptedBackend {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedPty> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if !request.working_dir.is_dir() {
            return Err(TerminalError::Spawn {
                reason: format!("working directory '{}' does not exist", request.working_dir.display()),
                retryable: false,
            });
        }

        let (tx, rx) = mpsc::channel(request.event_capacity.max(1));
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let control = FakeControl::with_events(Some(pid), tx);
        self.spawned
            .lock()
            .unwrap()
            .push((request, control.clone()));

        Ok(SpawnedPty {
            control: Box::new(control),
            events: rx,
        })
    }

    fn backend_name(&self) -> &str {
        "scripted"
    }
}
