//! Status and health reports for the declared services.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;

use crate::orchestrator::Orchestrator;
use crate::probe::{HealthCheckResult, HealthStatus};
use crate::process::{ServiceLauncher, ServiceLifecycleStatus};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const RESET: &str = "\x1b[0m";

/// Observed state of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_state: Option<ServiceLifecycleStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub health: HealthCheckResult,
}

/// Snapshot of every declared service, in declaration order.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub services: Vec<ServiceStatus>,
}

impl StatusReport {
    /// Gathers PID, liveness, recorded state and one probe per service.
    pub fn collect(orchestrator: &Orchestrator, launcher: &dyn ServiceLauncher) -> Self {
        let probes = orchestrator.probe_all();
        let services = probes
            .into_iter()
            .map(|(name, health)| {
                let recorded = launcher.recorded(&name);
                ServiceStatus {
                    pid: launcher.pid(&name),
                    running: launcher.is_running(&name),
                    last_state: recorded.as_ref().map(|entry| entry.status),
                    updated_at: recorded.map(|entry| entry.updated_at),
                    health,
                    name,
                }
            })
            .collect();
        Self { services }
    }

    pub fn render(&self, color: bool) -> String {
        let mut out = String::new();
        for service in &self.services {
            let (marker, label) = if service.running && service.health.is_ready() {
                (GREEN_BOLD, "running")
            } else if service.running {
                (YELLOW_BOLD, "starting")
            } else {
                (RED_BOLD, "stopped")
            };
            let (marker, reset) = if color { (marker, RESET) } else { ("", "") };

            let pid = service
                .pid
                .filter(|_| service.running)
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".into());
            let recorded = match (&service.last_state, &service.updated_at) {
                (Some(state), Some(at)) => format!("{state} {}", format_since(*at)),
                _ => "-".into(),
            };

            let _ = writeln!(
                out,
                "{marker}●{reset} {:<20} {label:<9} pid {pid:<8} health {:<28} last {recorded}",
                service.name,
                service.health.to_string(),
            );
        }
        out
    }
}

/// Pass/fail of a single probe against every declared service.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub results: Vec<(String, HealthCheckResult)>,
}

impl TestReport {
    pub fn run(orchestrator: &Orchestrator) -> Self {
        Self {
            results: orchestrator.probe_all(),
        }
    }

    pub fn failed(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, result)| result.status != HealthStatus::Ready)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, result) in &self.results {
            let verdict = if result.is_ready() { "PASS" } else { "FAIL" };
            let _ = writeln!(out, "{verdict} {name:<20} {result}");
        }
        out
    }
}

fn format_since(at: DateTime<Utc>) -> String {
    let seconds = Utc::now()
        .signed_duration_since(at)
        .num_seconds()
        .max(0) as u64;
    format_elapsed(seconds)
}

fn format_elapsed(total_seconds: u64) -> String {
    match total_seconds {
        0..=59 => format!("{} secs ago", total_seconds),
        60..=3_599 => format!("{} mins ago", total_seconds / 60),
        3_600..=86_399 => format!("{} hours ago", total_seconds / 3_600),
        86_400..=604_799 => format!("{} days ago", total_seconds / 86_400),
        _ => format!("{} weeks ago", total_seconds / 604_800),
    }
}
