//! Fixed-interval readiness polling with operator cancellation.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::config::Service;
use crate::constants::CANCEL_CHECK_SLICE;
use crate::probe::{HealthCheckResult, HealthProbe};

/// Shared flag flipped when the operator aborts a command.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early if cancelled. Returns `true` when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(CANCEL_CHECK_SLICE.min(deadline - now));
        }
    }
}

/// Terminal state of one `wait_until_healthy` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The probe reported ready.
    Healthy { attempts: u32, elapsed: Duration },
    /// The budget elapsed without a ready probe.
    TimedOut {
        attempts: u32,
        elapsed: Duration,
        last: Option<HealthCheckResult>,
    },
    /// The operator aborted while polling.
    Cancelled { attempts: u32 },
}

/// Repeatedly probes a service until it is ready, the budget elapses or the
/// operator cancels.
pub struct HealthPoller<'a> {
    probe: &'a dyn HealthProbe,
    cancel: CancelToken,
}

impl<'a> HealthPoller<'a> {
    pub fn new(probe: &'a dyn HealthProbe, cancel: CancelToken) -> Self {
        Self { probe, cancel }
    }

    /// Polls with the service's own budget and interval.
    pub fn wait_for(&self, service: &Service) -> PollOutcome {
        self.wait_until_healthy(service, service.max_wait, service.poll_interval)
    }

    /// Probes every `poll_interval` until ready or `max_wait` has elapsed.
    ///
    /// Returns as soon as a probe reports ready. Each attempt is limited to
    /// the shorter of `poll_interval` and the remaining budget, so a stuck
    /// endpoint cannot push the timeout or an abort past one interval.
    pub fn wait_until_healthy(
        &self,
        service: &Service,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> PollOutcome {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut last = None;

        loop {
            if self.cancel.is_cancelled() {
                warn!("Readiness wait for '{}' cancelled", service.name);
                return PollOutcome::Cancelled { attempts };
            }

            attempts += 1;
            let limit = poll_interval.min(max_wait.saturating_sub(started.elapsed()));
            let result = self.probe.check(service, limit);
            if result.is_ready() {
                let elapsed = started.elapsed();
                info!(
                    "Service '{}' healthy after {attempts} attempt(s) in {elapsed:?}",
                    service.name
                );
                return PollOutcome::Healthy { attempts, elapsed };
            }

            debug!(
                "Attempt {attempts} for '{}' not ready: {result}",
                service.name
            );
            last = Some(result);

            let elapsed = started.elapsed();
            if elapsed >= max_wait {
                warn!(
                    "Service '{}' not healthy after {attempts} attempt(s) in {elapsed:?}",
                    service.name
                );
                return PollOutcome::TimedOut {
                    attempts,
                    elapsed,
                    last,
                };
            }

            if self.cancel.sleep(poll_interval.min(max_wait - elapsed)) {
                warn!("Readiness wait for '{}' cancelled", service.name);
                return PollOutcome::Cancelled { attempts };
            }
        }
    }
}
