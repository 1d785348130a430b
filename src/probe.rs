//! Single-attempt readiness checks.
use reqwest::blocking::Client;
use serde::Serialize;
use std::{fmt, sync::Arc, time::Duration};
use strum_macros::Display;
use tracing::{debug, warn};

use crate::config::{HealthCheck, Service};
use crate::error::StackError;
use crate::process::ServiceLauncher;

/// Classification of one probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HealthStatus {
    /// Explicit success signal.
    Ready,
    /// Reachable but not ready, or refused/timed out on this attempt.
    NotReady,
    /// Malformed response or unexpected protocol failure.
    Error,
}

/// Outcome of one probe attempt plus an optional diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheckResult {
    pub fn ready() -> Self {
        Self {
            status: HealthStatus::Ready,
            message: None,
        }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::NotReady,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

impl fmt::Display for HealthCheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{} ({message})", self.status),
            None => write!(f, "{}", self.status),
        }
    }
}

/// Performs exactly one readiness check against a service.
///
/// Implementations must return within `limit` and must not mutate
/// orchestration state.
pub trait HealthProbe: Send + Sync {
    fn check(&self, service: &Service, limit: Duration) -> HealthCheckResult;
}

/// Probes an HTTP endpoint with a bounded per-request timeout.
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self, StackError> {
        let client = Client::builder()
            .build()
            .map_err(|err| StackError::Config(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }

    /// Performs a single request against `check.url`, bounded by the shorter
    /// of `check.timeout` and `limit`.
    pub fn check_endpoint(&self, check: &HealthCheck, limit: Duration) -> HealthCheckResult {
        let timeout = check.timeout.min(limit);
        let response = self.client.get(&check.url).timeout(timeout).send();

        match response {
            Ok(response) => {
                let status = response.status();
                let ready = match check.expect_status {
                    Some(expected) => status.as_u16() == expected,
                    None => status.is_success(),
                };

                if ready {
                    HealthCheckResult::ready()
                } else {
                    HealthCheckResult::not_ready(format!("HTTP {}", status.as_u16()))
                }
            }
            Err(err) if err.is_connect() => {
                HealthCheckResult::not_ready(format!("connection failed: {err}"))
            }
            Err(err) if err.is_timeout() => {
                HealthCheckResult::not_ready(format!("timed out after {timeout:?}"))
            }
            Err(err) => HealthCheckResult::error(err.to_string()),
        }
    }
}

/// Default probe: HTTP when a health check is declared, process liveness otherwise.
pub struct StackProbe {
    http: HttpProbe,
    launcher: Arc<dyn ServiceLauncher>,
}

impl StackProbe {
    pub fn new(launcher: Arc<dyn ServiceLauncher>) -> Result<Self, StackError> {
        Ok(Self {
            http: HttpProbe::new()?,
            launcher,
        })
    }
}

impl HealthProbe for StackProbe {
    fn check(&self, service: &Service, limit: Duration) -> HealthCheckResult {
        let result = match &service.health_check {
            Some(check) => self.http.check_endpoint(check, limit),
            None if self.launcher.is_running(&service.name) => HealthCheckResult::ready(),
            None => HealthCheckResult::not_ready("process is not running"),
        };
        debug!("Probe of '{}': {result}", service.name);
        if result.status == HealthStatus::Error {
            warn!(
                "{}",
                StackError::Probe {
                    service: service.name.clone(),
                    message: result.message.clone().unwrap_or_default(),
                }
            );
        }
        result
    }
}
