//! Dependency-ordered start/stop with health gating.
//!
//! Each operator command produces an [`OrchestrationRun`] owned by the caller;
//! no service state is shared between runs beyond what the launcher persists.
use serde::Serialize;
use std::{
    collections::HashSet,
    fmt,
    sync::Arc,
};
use tracing::{debug, error, info, warn};

use crate::config::{DataDir, Service};
use crate::error::StackError;
use crate::graph::ServiceGraph;
use crate::poller::{CancelToken, HealthPoller, PollOutcome};
use crate::probe::HealthProbe;
use crate::process::{ServiceLauncher, ServiceLifecycleStatus};
use crate::snapshot::{Snapshot, SnapshotManager};

/// Which pass over the graph a run performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Start,
    Stop,
}

/// Per-service result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ServiceOutcome {
    /// Started (or already running) and verified healthy.
    Started,
    /// Launch failed or readiness never arrived within the budget.
    FailedToBecomeHealthy { reason: String },
    /// Not attempted because a direct dependency is not started.
    SkippedDueToDependencyFailure { dependency: String },
    /// The operator cancelled while this service was waiting.
    Aborted,
    /// Not attempted because the run was aborted earlier.
    SkippedDueToAbort,
    /// Stopped, or was not running.
    Stopped,
    /// Stop was attempted and failed.
    StopFailed { reason: String },
}

impl ServiceOutcome {
    fn is_success(&self) -> bool {
        matches!(self, ServiceOutcome::Started | ServiceOutcome::Stopped)
    }
}

impl fmt::Display for ServiceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceOutcome::Started => write!(f, "started"),
            ServiceOutcome::FailedToBecomeHealthy { reason } => {
                write!(f, "failed-to-become-healthy: {reason}")
            }
            ServiceOutcome::SkippedDueToDependencyFailure { dependency } => {
                write!(f, "skipped (dependency '{dependency}' not started)")
            }
            ServiceOutcome::Aborted => write!(f, "aborted"),
            ServiceOutcome::SkippedDueToAbort => write!(f, "skipped (aborted)"),
            ServiceOutcome::Stopped => write!(f, "stopped"),
            ServiceOutcome::StopFailed { reason } => write!(f, "stop-failed: {reason}"),
        }
    }
}

/// One service's line in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunEntry {
    pub service: String,
    #[serde(flatten)]
    pub outcome: ServiceOutcome,
}

/// Result of one start or stop pass over the whole graph.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationRun {
    pub kind: RunKind,
    pub entries: Vec<RunEntry>,
    pub aborted: bool,
}

impl OrchestrationRun {
    fn new(kind: RunKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
            aborted: false,
        }
    }

    fn record(&mut self, service: &str, outcome: ServiceOutcome) {
        self.entries.push(RunEntry {
            service: service.to_string(),
            outcome,
        });
    }

    /// True iff every service ended started (or stopped, for a stop run).
    pub fn success(&self) -> bool {
        !self.aborted && self.entries.iter().all(|entry| entry.outcome.is_success())
    }

    pub fn outcome(&self, service: &str) -> Option<&ServiceOutcome> {
        self.entries
            .iter()
            .find(|entry| entry.service == service)
            .map(|entry| &entry.outcome)
    }

    /// Entries that did not succeed.
    pub fn failures(&self) -> Vec<&RunEntry> {
        self.entries
            .iter()
            .filter(|entry| !entry.outcome.is_success())
            .collect()
    }

    /// Names of failed services, in processing order.
    pub fn failed_services(&self) -> Vec<String> {
        self.failures()
            .into_iter()
            .map(|entry| entry.service.clone())
            .collect()
    }
}

impl fmt::Display for OrchestrationRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            RunKind::Start => "start",
            RunKind::Stop => "stop",
        };
        for entry in &self.entries {
            writeln!(f, "  {:<20} {}", entry.service, entry.outcome)?;
        }
        if self.aborted {
            write!(f, "{label}: aborted by operator")
        } else if self.success() {
            write!(f, "{label}: ok")
        } else {
            write!(f, "{label}: failed ({})", self.failed_services().join(", "))
        }
    }
}

/// Result of a backup taken with the stack stopped.
#[derive(Debug)]
pub struct SafeBackup {
    pub snapshot: Snapshot,
    pub stop: Option<OrchestrationRun>,
    pub restart: Option<OrchestrationRun>,
}

/// Walks the service graph invoking the start/stop capability and health poller.
pub struct Orchestrator {
    graph: ServiceGraph,
    launcher: Arc<dyn ServiceLauncher>,
    probe: Arc<dyn HealthProbe>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(
        graph: ServiceGraph,
        launcher: Arc<dyn ServiceLauncher>,
        probe: Arc<dyn HealthProbe>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            graph,
            launcher,
            probe,
            cancel,
        }
    }

    /// Starts every service in dependency order, gating dependents on health.
    ///
    /// Already-running services are re-verified rather than restarted.
    pub fn start(&self) -> Result<OrchestrationRun, StackError> {
        info!("Starting all services...");
        let order = self.graph.topological_order()?;
        let poller = HealthPoller::new(self.probe.as_ref(), self.cancel.clone());
        let mut run = OrchestrationRun::new(RunKind::Start);
        let mut started: HashSet<&str> = HashSet::new();

        for service in order {
            let name = service.name.as_str();

            if run.aborted || self.cancel.is_cancelled() {
                run.aborted = true;
                run.record(name, ServiceOutcome::SkippedDueToAbort);
                continue;
            }

            if let Some(dependency) = service
                .depends_on
                .iter()
                .find(|dep| !started.contains(dep.as_str()))
            {
                error!("Skipping start of '{name}' because dependency '{dependency}' is not started.");
                self.launcher.record(name, ServiceLifecycleStatus::Skipped);
                run.record(
                    name,
                    ServiceOutcome::SkippedDueToDependencyFailure {
                        dependency: dependency.clone(),
                    },
                );
                continue;
            }

            let outcome = self.start_one(service, &poller);
            match &outcome {
                ServiceOutcome::Started => {
                    self.launcher.record(name, ServiceLifecycleStatus::Running);
                    started.insert(name);
                }
                ServiceOutcome::Aborted => {
                    run.aborted = true;
                }
                ServiceOutcome::FailedToBecomeHealthy { reason } => {
                    error!("Service '{name}' failed to become healthy: {reason}");
                    let blocked = self.graph.transitive_dependents(name);
                    if !blocked.is_empty() {
                        warn!("Not starting dependents of '{name}': {}", blocked.join(", "));
                    }
                    self.launcher.record(name, ServiceLifecycleStatus::Unhealthy);
                }
                _ => {}
            }
            run.record(name, outcome);
        }

        if run.success() {
            info!("All services started successfully.");
        }
        Ok(run)
    }

    fn start_one(&self, service: &Service, poller: &HealthPoller<'_>) -> ServiceOutcome {
        let name = service.name.as_str();

        if self.launcher.is_running(name) {
            info!("Service '{name}' already running; re-verifying health");
        } else if let Err(err) = self.launcher.start(service) {
            return ServiceOutcome::FailedToBecomeHealthy {
                reason: err.to_string(),
            };
        }

        match poller.wait_for(service) {
            PollOutcome::Healthy { .. } => ServiceOutcome::Started,
            PollOutcome::Cancelled { .. } => ServiceOutcome::Aborted,
            PollOutcome::TimedOut { attempts, last, .. } => {
                let timeout = StackError::HealthTimeout {
                    service: name.to_string(),
                    waited: service.max_wait,
                };
                let detail = last
                    .map(|result| format!("; last probe: {result}"))
                    .unwrap_or_default();
                ServiceOutcome::FailedToBecomeHealthy {
                    reason: format!("{timeout} after {attempts} attempt(s){detail}"),
                }
            }
        }
    }

    /// Stops services in reverse dependency order, continuing past failures.
    pub fn stop(&self) -> Result<OrchestrationRun, StackError> {
        info!("Stopping all services...");
        let order = self.graph.stop_order()?;
        let mut run = OrchestrationRun::new(RunKind::Stop);

        for service in order {
            let name = service.name.as_str();
            match self.launcher.stop(service) {
                Ok(()) => run.record(name, ServiceOutcome::Stopped),
                Err(err) => {
                    error!("Failed to stop service '{name}': {err}");
                    self.launcher.record(name, ServiceLifecycleStatus::StopFailed);
                    run.record(
                        name,
                        ServiceOutcome::StopFailed {
                            reason: err.to_string(),
                        },
                    );
                }
            }
        }

        if !run.success() {
            warn!("{}", StackError::PartialStopFailure {
                services: run.failed_services()
            });
        }
        Ok(run)
    }

    /// Stops then starts the whole stack.
    pub fn restart(&self) -> Result<(OrchestrationRun, OrchestrationRun), StackError> {
        let stop = self.stop()?;
        if !stop.success() {
            return Err(StackError::PartialStopFailure {
                services: stop.failed_services(),
            });
        }
        let start = self.start()?;
        Ok((stop, start))
    }

    /// Names of services whose process is alive, in declaration order.
    pub fn running_services(&self) -> Vec<String> {
        self.graph
            .services()
            .iter()
            .filter(|service| self.launcher.is_running(&service.name))
            .map(|service| service.name.clone())
            .collect()
    }

    /// Backup that stops the stack first and brings it back afterwards.
    pub fn safe_backup(
        &self,
        snapshots: &SnapshotManager,
        directories: &[DataDir],
    ) -> Result<SafeBackup, StackError> {
        let was_running = !self.running_services().is_empty();

        let stop = if was_running {
            let stop = self.stop()?;
            if !stop.success() {
                return Err(StackError::PartialStopFailure {
                    services: stop.failed_services(),
                });
            }
            Some(stop)
        } else {
            debug!("No services running; backing up without stopping");
            None
        };

        let backup = snapshots.backup(directories);

        let restart = if was_running {
            Some(self.start()?)
        } else {
            None
        };

        Ok(SafeBackup {
            snapshot: backup?,
            stop,
            restart,
        })
    }

    /// Restores a snapshot; every service must already be stopped.
    ///
    /// Directories used by a running service are named first, then any other
    /// running service still blocks the restore.
    pub fn restore(
        &self,
        snapshots: &SnapshotManager,
        snapshot_id: &str,
        directories: &[DataDir],
    ) -> Result<Snapshot, StackError> {
        let running = self.running_services();
        let active: HashSet<String> = running.iter().cloned().collect();
        SnapshotManager::ensure_not_in_use(directories, &active)?;
        if !running.is_empty() {
            return Err(StackError::PreconditionViolated(format!(
                "stop the stack before restoring; still running: {}",
                running.join(", ")
            )));
        }

        let snapshot = snapshots.load(snapshot_id)?;
        snapshots.restore(&snapshot, directories, &active)?;
        Ok(snapshot)
    }

    /// One probe per service, in declaration order.
    pub fn probe_all(&self) -> Vec<(String, crate::probe::HealthCheckResult)> {
        self.graph
            .services()
            .iter()
            .map(|service| {
                (
                    service.name.clone(),
                    self.probe.check(service, service.max_wait),
                )
            })
            .collect()
    }
}
