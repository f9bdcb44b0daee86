//! Idle and resource reaper.
//!
//! A recurring task that marks quiet sessions idle, retires detached
//! sessions once they have been idle past the timeout, and stops sessions
//! whose process exceeds a configured resource cap.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use termbridge_types::{CloseReason, SessionStatus};

use super::config::ResourceLimits;
use super::error::TerminalError;
use super::registry::SessionRegistry;
use super::session::{ResourceSample, SessionId};

/// Reads resource usage for a set of process ids. Called on a blocking thread.
pub trait ResourceSampler: Send + Sync + 'static {
    fn sample(&self, pids: &[u32]) -> HashMap<u32, ResourceSample>;
}

/// Samples processes through `sysinfo`.
///
/// Keeps one `System` across sweeps; CPU usage is measured between two
/// refreshes, so a process's first sample reports 0%.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&self, pids: &[u32]) -> HashMap<u32, ResourceSample> {
        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(poisoned) => poisoned.into_inner(),
        };

        let targets: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
        let refresh = ProcessRefreshKind::nothing()
            .with_cpu()
            .with_memory()
            .with_disk_usage();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&targets), true, refresh);

        let sampled_at = Utc::now();
        pids.iter()
            .filter_map(|pid| {
                let process = system.process(Pid::from_u32(*pid))?;
                Some((
                    *pid,
                    ResourceSample {
                        cpu_percent: process.cpu_usage(),
                        memory_bytes: process.memory(),
                        disk_written_bytes: process.disk_usage().total_written_bytes,
                        sampled_at,
                    },
                ))
            })
            .collect()
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub scanned: usize,
    pub sampled: usize,
    pub marked_idle: Vec<SessionId>,
    pub reaped_idle: Vec<SessionId>,
    pub reaped_resource: Vec<SessionId>,
}

impl SweepReport {
    pub fn reaped(&self) -> usize {
        self.reaped_idle.len() + self.reaped_resource.len()
    }
}

fn limit_violation(limits: &ResourceLimits, sample: &ResourceSample) -> Option<String> {
    if let Some(max) = limits.max_memory_bytes {
        if sample.memory_bytes > max {
            return Some(format!("memory {} bytes exceeds {} bytes", sample.memory_bytes, max));
        }
    }
    if let Some(max) = limits.max_cpu_percent {
        if sample.cpu_percent > max {
            return Some(format!("cpu {:.1}% exceeds {:.1}%", sample.cpu_percent, max));
        }
    }
    if let Some(max) = limits.max_disk_bytes {
        if sample.disk_written_bytes > max {
            return Some(format!(
                "disk writes {} bytes exceed {} bytes",
                sample.disk_written_bytes, max
            ));
        }
    }
    None
}

pub struct Reaper {
    registry: SessionRegistry,
    sampler: Arc<dyn ResourceSampler>,
}

impl Reaper {
    pub fn new(registry: SessionRegistry, sampler: Arc<dyn ResourceSampler>) -> Self {
        Self { registry, sampler }
    }

    /// Run sweeps every `sweep_interval` until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.registry.config().sweep_interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?period, "reaper started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.sweep().await;
                        if report.reaped() > 0 {
                            info!(
                                idle = report.reaped_idle.len(),
                                resource = report.reaped_resource.len(),
                                "reaper stopped sessions"
                            );
                        } else {
                            debug!(scanned = report.scanned, "sweep finished");
                        }
                    }
                }
            }
            debug!("reaper stopped");
        })
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// One sweep, measuring idleness against `now`
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let config = self.registry.config();
        let idle_after = config.idle_after();

        let candidates: Vec<_> = self
            .registry
            .sessions()
            .await
            .into_iter()
            .filter_map(|session| {
                let candidate = session.sweep_candidate(now)?;
                Some((session, candidate))
            })
            .collect();

        let mut report = SweepReport {
            scanned: candidates.len(),
            ..Default::default()
        };

        let pids: Vec<u32> = candidates.iter().filter_map(|(_, c)| c.pid).collect();
        let samples = if pids.is_empty() {
            HashMap::new()
        } else {
            let sampler = Arc::clone(&self.sampler);
            match tokio::task::spawn_blocking(move || sampler.sample(&pids)).await {
                Ok(samples) => samples,
                Err(e) => {
                    warn!("resource sampling failed: {}", e);
                    HashMap::new()
                }
            }
        };
        report.sampled = samples.len();

        for (session, candidate) in candidates {
            let id = session.id().to_string();

            if let Some(sample) = candidate.pid.and_then(|pid| samples.get(&pid)) {
                session.set_resource_sample(*sample);
                if let Some(detail) = limit_violation(&config.limits, sample) {
                    let violation = TerminalError::ResourceLimit {
                        id: id.clone(),
                        detail: detail.clone(),
                    };
                    warn!("{}", violation);
                    if session.stop(CloseReason::ResourceLimit(detail), None) {
                        self.registry.schedule_removal(&session);
                        report.reaped_resource.push(id);
                    }
                    continue;
                }
            }

            if candidate.status == SessionStatus::Running
                && candidate.idle >= idle_after
                && session.mark_idle_if_unchanged(candidate.generation)
            {
                report.marked_idle.push(id.clone());
            }

            if self.registry.reap_if_idle(&session, &candidate) {
                report.reaped_idle.push(id);
            }
        }

        report
    }
}
