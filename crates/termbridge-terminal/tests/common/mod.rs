#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use termbridge_terminal::testing::ScriptedBackend;
use termbridge_terminal::{SessionEvent, SessionRegistry, TerminalConfig};

pub fn config() -> TerminalConfig {
    TerminalConfig {
        working_dir: Some(std::env::temp_dir()),
        termination_grace_ms: 0,
        ..Default::default()
    }
}

pub fn scripted(config: TerminalConfig) -> (SessionRegistry, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::new());
    let registry = SessionRegistry::init(config, backend.clone());
    (registry, backend)
}

/// Next event, or panic after a second
pub async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

/// Collect output until `expected` bytes have arrived
pub async fn collect_output(
    events: &mut broadcast::Receiver<SessionEvent>,
    expected: usize,
) -> String {
    let mut out = Vec::new();
    while out.len() < expected {
        match next_event(events).await {
            SessionEvent::Output(chunk) => out.extend_from_slice(&chunk.data),
            other => panic!("unexpected event {:?}", other),
        }
    }
    String::from_utf8(out).unwrap()
}

/// Poll until `check` holds, for up to a second
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
