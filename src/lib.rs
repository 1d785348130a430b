//! stackctl brings up a stack of dependent local services in dependency order,
//! waits for each one to report healthy before starting its dependents, stops
//! them in reverse order, and snapshots the data directories they share.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared defaults and file names.
pub mod constants;

/// Corpus ingestion.
pub mod corpus;

/// Error handling.
pub mod error;

/// Dependency graph and ordering.
pub mod graph;

/// Log files of launched services.
pub mod logs;

/// Start/stop passes over the service graph.
pub mod orchestrator;

/// Bounded readiness polling.
pub mod poller;

/// Single-shot health checks.
pub mod probe;

/// Launching and stopping service processes.
pub mod process;

/// State directory layout and the project lock.
pub mod runtime;

/// Backup and restore of data directories.
pub mod snapshot;

/// Status reports.
pub mod status;
