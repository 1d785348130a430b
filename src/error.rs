//! Error handling for stackctl.
use thiserror::Error;

/// Defines all possible errors raised while orchestrating the stack.
#[derive(Debug, Error)]
pub enum StackError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[source] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// Configuration is syntactically valid but semantically wrong.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error when a dependency reference is undefined in the configuration.
    #[error("Service '{service}' declares unknown dependency '{dependency}'")]
    UnknownDependency {
        /// The service with an invalid dependency reference.
        service: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// Error when the dependency graph contains a cycle.
    #[error("Detected dependency cycle: {}", members.join(" -> "))]
    DependencyCycle {
        /// Services on the cycle, first member repeated at the end.
        members: Vec<String>,
    },

    /// A single health probe attempt failed at the protocol level.
    #[error("Health probe for '{service}' failed: {message}")]
    Probe {
        /// The probed service.
        service: String,
        /// Diagnostic from the failed attempt.
        message: String,
    },

    /// A service never became healthy within its wait budget.
    #[error("Service '{service}' did not become healthy within {waited:?}")]
    HealthTimeout {
        /// The service that timed out.
        service: String,
        /// Budget that elapsed.
        waited: std::time::Duration,
    },

    /// An operation was attempted while its precondition does not hold.
    #[error("Precondition violated: {0}")]
    PreconditionViolated(String),

    /// One or more services failed to stop.
    #[error("Failed to stop service(s): {}", services.join(", "))]
    PartialStopFailure {
        /// Services whose stop failed.
        services: Vec<String>,
    },

    /// Error spawning a service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStartError {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error stopping a service process.
    #[error("Failed to stop service '{service}': {source}")]
    ServiceStopError {
        /// The service name that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Snapshot creation or restore failed.
    #[error("Snapshot error at '{path}': {source}")]
    Snapshot {
        /// Path being read or written.
        path: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A snapshot's contents do not match its manifest.
    #[error("Snapshot '{id}' is corrupt: {reason}")]
    SnapshotCorrupt {
        /// Snapshot id.
        id: String,
        /// What did not match.
        reason: String,
    },

    /// Corpus ingestion requested with no source documents present.
    #[error("Corpus source directories are empty: {0}")]
    CorpusEmpty(String),

    /// The ingestion command ran but did not succeed.
    #[error("Corpus ingestion failed: {0}")]
    Ingestion(String),

    /// The operator cancelled the command.
    #[error("Operation aborted by operator")]
    Aborted,

    /// Another mutating command already holds the project lock.
    #[error("Another stackctl command is running (lock held on {0})")]
    Locked(String),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),

    /// Error for PID file.
    #[error("PID file error: {0}")]
    PidFileError(#[from] PidFileError),

    /// Error for service state file.
    #[error("Service state error: {0}")]
    ServiceStateError(#[from] ServiceStateError),

    /// Error for logs manager.
    #[error("Logs error: {0}")]
    LogsError(#[from] LogsError),

    /// Generic I/O failure outside a more specific context.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl<T> From<std::sync::PoisonError<T>> for StackError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StackError::MutexPoisonError(err.to_string())
    }
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading or writing the PID file.
    #[error("Failed to access PID file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing the PID file.
    #[error("Failed to parse PID file: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Attempted to remove a service that has no PID entry.
    #[error("Service not found in PID file")]
    ServiceNotFound,
}

/// Error type for persistent service state file operations.
#[derive(Debug, Error)]
pub enum ServiceStateError {
    /// Error reading the state file from disk.
    #[error("Failed to read service state file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing JSON contents of the state file.
    #[error("Failed to parse service state file: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Error type for log inspection.
#[derive(Debug, Error)]
pub enum LogsError {
    /// The requested service is not declared.
    #[error("Service '{0}' is not declared in the configuration")]
    ServiceNotFound(String),

    /// Error while reading a log file.
    #[error("Failed to read log file: {0}")]
    ReadError(#[from] std::io::Error),
}
