//! Constants and default configuration values for stackctl.
//!
//! Centralizes timing defaults, file names and shell invocation details used
//! across the orchestrator.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "stackctl.yaml";

/// Directory (relative to the project) holding runtime state.
pub const DEFAULT_STATE_DIR: &str = ".stackctl";

/// Directory (relative to the project) holding snapshots.
pub const DEFAULT_SNAPSHOT_DIR: &str = "backups";

/// Name of the PID file stored in the state directory.
/// Contains mappings of service names to process IDs.
pub const PID_FILE_NAME: &str = "pid.json";

/// Name of the service state file stored in the state directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// Advisory lock taken by mutating commands.
pub const LOCK_FILE_NAME: &str = "stackctl.lock";

/// Subdirectory of the state directory holding service logs.
pub const LOG_DIR_NAME: &str = "logs";

/// Manifest written into every snapshot.
pub const SNAPSHOT_MANIFEST: &str = "manifest.json";

/// Format used for timestamp-named snapshot ids.
pub const SNAPSHOT_ID_FORMAT: &str = "%Y%m%dT%H%M%S";

// ============================================================================
// Shell Execution Constants
// ============================================================================

/// Default shell used for executing service commands.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";

// ============================================================================
// Health Check Timing
// ============================================================================

/// Interval between readiness probes when a service does not configure one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Total readiness budget when a service does not configure one.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(120);

/// Upper bound on a single probe attempt.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Granularity at which the poller re-checks the cancel token while sleeping.
pub const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(50);

// ============================================================================
// Process Management Timing
// ============================================================================

/// Number of checks to perform after SIGTERM before escalating to SIGKILL.
pub const STOP_GRACE_CHECKS: usize = 50;

/// Interval between liveness checks while waiting for a service to exit.
pub const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum number of log lines shown by default.
pub const DEFAULT_LOG_LINES: usize = 50;
