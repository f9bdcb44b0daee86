#![cfg(unix)]

mod common;

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use uuid::Uuid;

use termbridge_terminal::{
    CloseReason, CreateOptions, NativePtyBackend, SessionEvent, SessionRegistry, SessionStatus,
    TerminalConfig, TerminalError,
};

fn registry() -> SessionRegistry {
    SessionRegistry::init(
        TerminalConfig {
            shell: Some("/bin/sh".into()),
            working_dir: Some(std::env::temp_dir()),
            env: [("PS1".to_string(), "$ ".to_string())].into_iter().collect(),
            termination_grace_ms: 0,
            ..Default::default()
        },
        Arc::new(NativePtyBackend::new()),
    )
}

#[tokio::test]
async fn echo_round_trip_then_terminate() {
    let registry = registry();
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    assert!(session.pid().is_some());
    let mut attachment = registry.attach(session.id(), Uuid::new_v4()).await.unwrap();

    registry
        .write(session.id(), Bytes::from_static(b"echo hi-from-pty\n"))
        .await
        .unwrap();

    let mut seen = String::new();
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match attachment.events.recv().await {
                Ok(SessionEvent::Output(chunk)) => {
                    seen.push_str(&String::from_utf8_lossy(&chunk.data));
                    // The echoed command line contains it once, the output again
                    if seen.matches("hi-from-pty").count() >= 2 {
                        return true;
                    }
                }
                Ok(_) | Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(found, "output never arrived, got {:?}", seen);

    assert_eq!(
        registry.terminate(session.id(), CloseReason::Requested).await,
        Ok(true)
    );
    assert_eq!(session.status(), SessionStatus::Stopped);

    let err = registry
        .write(session.id(), Bytes::from_static(b"echo again\n"))
        .await
        .unwrap_err();
    assert!(matches!(err, TerminalError::NotFound { .. }));
}

#[tokio::test]
async fn shell_exit_is_reported() {
    let registry = registry();
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    let mut attachment = registry.attach(session.id(), Uuid::new_v4()).await.unwrap();

    registry
        .write(session.id(), Bytes::from_static(b"exit 4\n"))
        .await
        .unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match attachment.events.recv().await {
                Ok(SessionEvent::Closed { reason, exit_code }) => return Some((reason, exit_code)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(closed, Some((CloseReason::ProcessExited, Some(4))));
}

/// True once `pid` is gone or only a zombie waiting for its new parent
fn process_exited(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    match system.process(pid) {
        Some(process) => process.status() == ProcessStatus::Zombie,
        None => true,
    }
}

#[tokio::test]
async fn terminate_also_kills_background_jobs() {
    let registry = registry();
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    let mut attachment = registry.attach(session.id(), Uuid::new_v4()).await.unwrap();

    registry
        .write(session.id(), Bytes::from_static(b"sleep 4242 & echo bg=$!\n"))
        .await
        .unwrap();

    let mut seen = String::new();
    let background = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match attachment.events.recv().await {
                Ok(SessionEvent::Output(chunk)) => {
                    seen.push_str(&String::from_utf8_lossy(&chunk.data));
                    // Skip the echoed command line, which has "bg=$!"
                    for (at, _) in seen.match_indices("bg=") {
                        let digits: String = seen[at + 3..]
                            .chars()
                            .take_while(|c| c.is_ascii_digit())
                            .collect();
                        let terminated = seen[at + 3 + digits.len()..]
                            .starts_with(|c: char| c == '\r' || c == '\n');
                        if !digits.is_empty() && terminated {
                            return digits.parse::<u32>().ok();
                        }
                    }
                }
                Ok(_) | Err(_) => return None,
            }
        }
    })
    .await
    .unwrap_or(None)
    .expect("background job pid never printed");
    assert!(!process_exited(background));

    assert_eq!(
        registry.terminate(session.id(), CloseReason::Requested).await,
        Ok(true)
    );

    let mut gone = false;
    for _ in 0..100 {
        if process_exited(background) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "background job {} outlived its session", background);
}
