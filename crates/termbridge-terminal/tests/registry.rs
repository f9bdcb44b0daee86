mod common;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use uuid::Uuid;

use common::{collect_output, config, eventually, next_event, scripted};
use termbridge_terminal::{
    CloseReason, CreateOptions, Dimensions, Reaper, ResourceLimits, ResourceSample,
    ResourceSampler, SessionEvent, SessionState, SessionStatus, TerminalConfig, TerminalError,
};

struct NoSamples;

impl ResourceSampler for NoSamples {
    fn sample(&self, _pids: &[u32]) -> std::collections::HashMap<u32, ResourceSample> {
        Default::default()
    }
}

async fn wait_removed(registry: &termbridge_terminal::SessionRegistry, id: &str) {
    for _ in 0..100 {
        if registry.get(id).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} was never removed", id);
}

#[tokio::test]
async fn input_reaches_the_process_in_order() {
    let (registry, backend) = scripted(config());
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();

    for piece in ["echo ", "one", "\n", "echo two\n"] {
        registry
            .write(session.id(), Bytes::from(piece))
            .await
            .unwrap();
    }

    assert_eq!(backend.last_control().written_string(), "echo one\necho two\n");
    assert_eq!(session.status(), SessionStatus::Running);
}

#[tokio::test]
async fn output_is_delivered_in_production_order() {
    let (registry, backend) = scripted(config());
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    let mut attachment = registry.attach(session.id(), Uuid::new_v4()).await.unwrap();
    let control = backend.last_control();

    let mut expected = String::new();
    for i in 0..50 {
        let line = format!("line {}\n", i);
        expected.push_str(&line);
        control.emit(line).await;
    }

    let received = collect_output(&mut attachment.events, expected.len()).await;
    assert_eq!(received, expected);
}

#[tokio::test]
async fn split_utf8_characters_are_rejoined() {
    let (registry, backend) = scripted(config());
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    let mut attachment = registry.attach(session.id(), Uuid::new_v4()).await.unwrap();
    let control = backend.last_control();

    control.emit(Bytes::from_static(&[b'a', 0xC3])).await;
    control.emit(Bytes::from_static(&[0xA9, b'b'])).await;

    match next_event(&mut attachment.events).await {
        SessionEvent::Output(chunk) => assert_eq!(&chunk.data[..], b"a"),
        other => panic!("unexpected {:?}", other),
    }
    match next_event(&mut attachment.events).await {
        SessionEvent::Output(chunk) => assert_eq!(&chunk.data[..], "éb".as_bytes()),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn terminate_is_idempotent() {
    let (registry, backend) = scripted(TerminalConfig {
        termination_grace_ms: 50,
        ..config()
    });
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    let mut attachment = registry.attach(session.id(), Uuid::new_v4()).await.unwrap();

    assert_eq!(
        registry.terminate(session.id(), CloseReason::Requested).await,
        Ok(true)
    );
    assert_eq!(
        registry.terminate(session.id(), CloseReason::Requested).await,
        Ok(false)
    );
    assert_eq!(backend.last_control().kill_count(), 1);

    match next_event(&mut attachment.events).await {
        SessionEvent::Closed { reason, .. } => assert_eq!(reason, CloseReason::Requested),
        other => panic!("unexpected {:?}", other),
    }
    // Exactly one close notification
    let extra = tokio::time::timeout(Duration::from_millis(100), attachment.events.recv()).await;
    assert!(extra.is_err(), "unexpected event after close: {:?}", extra);

    wait_removed(&registry, session.id()).await;
    assert!(matches!(
        registry.terminate(session.id(), CloseReason::Requested).await,
        Err(TerminalError::NotFound { .. })
    ));
}

#[tokio::test]
async fn input_after_stop_is_rejected() {
    let (registry, _backend) = scripted(TerminalConfig {
        termination_grace_ms: 60_000,
        ..config()
    });
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    registry
        .terminate(session.id(), CloseReason::Requested)
        .await
        .unwrap();

    // Still listed during the grace window, but no longer writable
    assert!(registry.get(session.id()).await.is_some());
    let err = registry
        .write(session.id(), Bytes::from_static(b"ls\n"))
        .await
        .unwrap_err();
    assert!(matches!(err, TerminalError::NotFound { .. }));
    assert!(registry.attach(session.id(), Uuid::new_v4()).await.is_err());
}

#[tokio::test]
async fn reattach_replays_buffered_output() {
    let (registry, backend) = scripted(config());
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    let first = Uuid::new_v4();
    let mut attachment = registry.attach(session.id(), first).await.unwrap();
    let control = backend.last_control();

    control.emit("hello").await;
    assert_eq!(collect_output(&mut attachment.events, 5).await, "hello");

    assert!(registry.detach(session.id(), first).await);
    drop(attachment);

    // Output keeps accumulating while nobody is attached
    control.emit(" world").await;
    eventually(|| session.buffered_output().len() == 2).await;

    let second = registry.attach(session.id(), Uuid::new_v4()).await.unwrap();
    let replayed: Vec<u8> = second
        .replay
        .iter()
        .flat_map(|chunk| chunk.data.to_vec())
        .collect();
    assert_eq!(String::from_utf8(replayed).unwrap(), "hello world");
    assert_eq!(second.replay.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn lagging_subscriber_can_recover_from_the_buffer() {
    let (registry, backend) = scripted(TerminalConfig {
        broadcast_capacity: 4,
        ..config()
    });
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    let mut attachment = registry.attach(session.id(), Uuid::new_v4()).await.unwrap();
    let control = backend.last_control();

    for i in 0..20 {
        control.emit(format!("{},", i)).await;
    }
    eventually(|| session.buffered_output().len() == 20).await;

    assert!(matches!(
        attachment.events.recv().await,
        Err(RecvError::Lagged(_))
    ));
    let (missed, lost) = session.output_since(0);
    assert_eq!(lost, 0);
    assert_eq!(missed.len(), 20);
    assert_eq!(&missed[19].data[..], b"19,");
}

#[tokio::test]
async fn process_exit_closes_and_removes_the_session() {
    let (registry, backend) = scripted(config());
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    let mut attachment = registry.attach(session.id(), Uuid::new_v4()).await.unwrap();

    backend.last_control().exit(7).await;

    match next_event(&mut attachment.events).await {
        SessionEvent::Closed { reason, exit_code } => {
            assert_eq!(reason, CloseReason::ProcessExited);
            assert_eq!(exit_code, Some(7));
        }
        other => panic!("unexpected {:?}", other),
    }
    wait_removed(&registry, session.id()).await;
}

#[tokio::test]
async fn writer_failure_reports_error_then_close() {
    let (registry, backend) = scripted(config());
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    let mut attachment = registry.attach(session.id(), Uuid::new_v4()).await.unwrap();

    backend.last_control().fail_write("broken pipe").await;

    match next_event(&mut attachment.events).await {
        SessionEvent::Error { message } => assert!(message.contains("broken pipe")),
        other => panic!("unexpected {:?}", other),
    }
    match next_event(&mut attachment.events).await {
        SessionEvent::Closed { reason, .. } => assert_eq!(reason.code(), "error"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn invalid_working_dir_leaves_no_entry() {
    let (registry, backend) = scripted(config());
    let err = registry
        .create_session(
            None,
            None,
            CreateOptions {
                working_dir: Some(PathBuf::from("/no/such/dir/anywhere")),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TerminalError::Spawn { retryable: false, .. }));
    assert_eq!(backend.attempts(), 1);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn retryable_spawn_failures_are_retried() {
    let (registry, backend) = scripted(TerminalConfig {
        spawn_attempts: 3,
        ..config()
    });
    for _ in 0..2 {
        backend.fail_next(TerminalError::Spawn {
            reason: "out of ptys".into(),
            retryable: true,
        });
    }

    let started = std::time::Instant::now();
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();

    assert_eq!(backend.attempts(), 3);
    assert_eq!(session.status(), SessionStatus::Ready);
    // 200ms + 400ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(600));
}

#[tokio::test]
async fn retries_give_up_after_the_last_attempt() {
    let (registry, backend) = scripted(TerminalConfig {
        spawn_attempts: 2,
        ..config()
    });
    for _ in 0..2 {
        backend.fail_next(TerminalError::Spawn {
            reason: "out of ptys".into(),
            retryable: true,
        });
    }

    let err = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TerminalError::Spawn { retryable: true, .. }));
    assert_eq!(backend.attempts(), 2);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn session_cap_is_enforced() {
    let (registry, _backend) = scripted(TerminalConfig {
        max_sessions: 2,
        ..config()
    });
    let first = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();

    let err = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, TerminalError::LimitReached { max: 2 });

    // Stopped sessions do not count against the cap
    registry
        .terminate(first.id(), CloseReason::Requested)
        .await
        .unwrap();
    assert!(registry
        .create_session(None, None, CreateOptions::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn full_registry_reclaims_abandoned_idle_sessions() {
    let (registry, backend) = scripted(TerminalConfig {
        max_sessions: 1,
        idle_timeout_secs: 1,
        ..config()
    });
    let abandoned = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let replacement = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();

    assert!(replacement.status().is_live());
    assert_eq!(
        abandoned.state(),
        SessionState::Stopped {
            reason: CloseReason::IdleTimeout,
            exit_code: None,
        }
    );
    assert_eq!(backend.control(0).kill_count(), 1);
}

#[tokio::test]
async fn full_registry_keeps_attached_sessions() {
    let (registry, _backend) = scripted(TerminalConfig {
        max_sessions: 1,
        idle_timeout_secs: 1,
        ..config()
    });
    let watched = registry
        .create_session(Some(Uuid::new_v4()), None, CreateOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let err = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err, TerminalError::LimitReached { max: 1 });
    assert!(watched.status().is_live());
}

/// Reports every process as using far more memory than allowed
struct OverLimit;

impl ResourceSampler for OverLimit {
    fn sample(&self, pids: &[u32]) -> std::collections::HashMap<u32, ResourceSample> {
        pids.iter()
            .map(|pid| {
                (
                    *pid,
                    ResourceSample {
                        cpu_percent: 0.0,
                        memory_bytes: u64::MAX,
                        disk_written_bytes: 0,
                        sampled_at: chrono::Utc::now(),
                    },
                )
            })
            .collect()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_terminations_stop_the_session_once() {
    let (registry, backend) = scripted(TerminalConfig {
        termination_grace_ms: 60_000,
        limits: ResourceLimits {
            max_memory_bytes: Some(1),
            ..Default::default()
        },
        ..config()
    });
    let session = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    let mut attachment = registry.attach(session.id(), Uuid::new_v4()).await.unwrap();
    let reaper = Reaper::new(registry.clone(), std::sync::Arc::new(OverLimit));

    let terminations: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let id = session.id().to_string();
            tokio::spawn(async move { registry.terminate(&id, CloseReason::Requested).await })
        })
        .collect();
    let sweep = tokio::spawn(async move {
        reaper
            .sweep_at(Instant::now() + Duration::from_secs(3600))
            .await
    });

    let mut performed = 0;
    for task in terminations {
        if task.await.unwrap() == Ok(true) {
            performed += 1;
        }
    }
    performed += sweep.await.unwrap().reaped();

    assert_eq!(performed, 1);
    assert_eq!(backend.last_control().kill_count(), 1);
    assert_eq!(session.status(), SessionStatus::Stopped);

    let mut closes = 0;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(100), attachment.events.recv()).await
    {
        if matches!(event, SessionEvent::Closed { .. }) {
            closes += 1;
        }
    }
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn sweep_never_evicts_a_session_still_being_created() {
    let (registry, backend) = scripted(TerminalConfig {
        idle_timeout_secs: 1,
        ..config()
    });
    let gate = backend.hold_spawns();

    let creating = {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .create_session(None, None, CreateOptions::default())
                .await
        })
    };
    for _ in 0..100 {
        if !registry.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let listed = registry.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, SessionStatus::Creating);

    let reaper = Reaper::new(registry.clone(), std::sync::Arc::new(NoSamples));
    let report = reaper
        .sweep_at(Instant::now() + Duration::from_secs(3600))
        .await;
    assert_eq!(report.scanned, 0);
    assert!(report.reaped_idle.is_empty());

    gate.notify_one();
    let session = creating.await.unwrap().unwrap();
    assert_eq!(session.status(), SessionStatus::Ready);
}

#[tokio::test]
async fn resize_validates_and_reaches_the_pty() {
    let (registry, backend) = scripted(config());
    let session = registry
        .create_session(None, Some(Dimensions::new(24, 80)), CreateOptions::default())
        .await
        .unwrap();

    let err = registry
        .resize(session.id(), Dimensions::new(0, 80))
        .await
        .unwrap_err();
    assert_eq!(err, TerminalError::InvalidDimensions { rows: 0, cols: 80 });

    assert_eq!(registry.resize(session.id(), Dimensions::new(24, 80)).await, Ok(false));
    assert_eq!(registry.resize(session.id(), Dimensions::new(50, 132)).await, Ok(true));
    assert_eq!(backend.last_control().resizes(), vec![Dimensions::new(50, 132)]);
    assert_eq!(session.dimensions(), Dimensions::new(50, 132));
}

#[tokio::test]
async fn zero_initial_dimensions_are_rejected() {
    let (registry, backend) = scripted(config());
    let err = registry
        .create_session(None, Some(Dimensions::new(24, 0)), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TerminalError::InvalidDimensions { .. }));
    assert_eq!(backend.attempts(), 0);
}

#[tokio::test]
async fn closed_connection_is_detached_everywhere() {
    let (registry, _backend) = scripted(config());
    let connection = Uuid::new_v4();
    let a = registry
        .create_session(Some(connection), None, CreateOptions::default())
        .await
        .unwrap();
    let b = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    registry.attach(b.id(), connection).await.unwrap();

    assert_eq!(registry.detach_all(connection).await, 2);
    assert_eq!(a.attached_count(), 0);
    assert_eq!(b.attached_count(), 0);
    // Detaching never stops the shell
    assert!(a.status().is_live());
    assert!(b.status().is_live());
}

#[tokio::test]
async fn custom_command_and_env_reach_the_backend() {
    let (registry, backend) = scripted(TerminalConfig {
        shell: Some("/bin/zsh".into()),
        shell_args: vec!["-l".into()],
        ..config()
    });
    registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    let request = backend.last_request();
    assert_eq!(request.command, "/bin/zsh");
    assert_eq!(request.args, vec!["-l".to_string()]);

    let mut env = std::collections::HashMap::new();
    env.insert("FOO".to_string(), "bar".to_string());
    registry
        .create_session(
            None,
            None,
            CreateOptions {
                command: Some("/usr/bin/top".into()),
                env,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let request = backend.last_request();
    assert_eq!(request.command, "/usr/bin/top");
    assert!(request.args.is_empty());
    assert_eq!(request.env.get("FOO").map(String::as_str), Some("bar"));
}

#[tokio::test]
async fn shutdown_stops_everything_and_refuses_new_sessions() {
    let (registry, backend) = scripted(config());
    for _ in 0..2 {
        registry
            .create_session(None, None, CreateOptions::default())
            .await
            .unwrap();
    }

    assert_eq!(registry.shutdown().await, 2);
    assert!(registry.is_empty().await);
    assert_eq!(backend.control(0).kill_count(), 1);
    assert_eq!(backend.control(1).kill_count(), 1);

    let err = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, TerminalError::ShuttingDown);
}

#[tokio::test]
async fn list_and_stats_reflect_sessions() {
    let (registry, _backend) = scripted(TerminalConfig {
        max_sessions: 5,
        termination_grace_ms: 60_000,
        ..config()
    });
    let first = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    let second = registry
        .create_session(None, None, CreateOptions::default())
        .await
        .unwrap();
    registry
        .terminate(second.id(), CloseReason::Requested)
        .await
        .unwrap();

    let listed = registry.list().await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, first.id());
    assert_eq!(listed[1].status, SessionStatus::Stopped);

    let stats = registry.stats().await;
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.max_sessions, 5);
    assert_eq!(stats.backend, "scripted");
    assert_eq!(stats.sessions_by_status.get("stopped"), Some(&1));
}
