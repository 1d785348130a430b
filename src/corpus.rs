//! Corpus ingestion, gated on source documents being present.
use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, info};

use crate::config::{Config, CorpusConfig, resolve_path};
use crate::constants::{DEFAULT_SHELL, SHELL_COMMAND_FLAG};
use crate::error::StackError;
use crate::logs::{LogKind, open_log_file};
use crate::poller::CancelToken;
use crate::runtime::RuntimePaths;

/// Log stream name used for ingestion output.
const CORPUS_LOG: &str = "corpus";

/// Whether `dir` holds at least one visible entry.
fn has_documents(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .any(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        })
        .unwrap_or(false)
}

/// Source directories resolved against the project root.
pub fn source_dirs(config: &Config, corpus: &CorpusConfig) -> Vec<PathBuf> {
    corpus
        .source_dirs
        .iter()
        .map(|dir| resolve_path(&config.project_dir, dir))
        .collect()
}

/// Fails with [`StackError::CorpusEmpty`] unless some source directory has documents.
pub fn ensure_corpus_present(dirs: &[PathBuf]) -> Result<(), StackError> {
    if dirs.iter().any(|dir| has_documents(dir)) {
        return Ok(());
    }

    let listed: Vec<String> = dirs.iter().map(|dir| dir.display().to_string()).collect();
    Err(StackError::CorpusEmpty(listed.join(", ")))
}

/// Runs the ingestion command once the corpus precondition holds.
///
/// Output is appended to the `corpus` log files. Cancellation kills the command.
pub fn ingest(config: &Config, paths: &RuntimePaths, cancel: &CancelToken) -> Result<(), StackError> {
    let corpus = config
        .corpus
        .as_ref()
        .ok_or_else(|| StackError::Config("no corpus section configured".into()))?;

    let dirs = source_dirs(config, corpus);
    ensure_corpus_present(&dirs)?;

    let start_error = |source: std::io::Error| StackError::ServiceStartError {
        service: CORPUS_LOG.to_string(),
        source,
    };

    info!("Ingesting corpus from {} source director(ies)", dirs.len());
    debug!("Running ingestion command: `{}`", corpus.command);

    let mut child = Command::new(DEFAULT_SHELL)
        .arg(SHELL_COMMAND_FLAG)
        .arg(&corpus.command)
        .current_dir(&config.project_dir)
        .stdin(Stdio::null())
        .stdout(open_log_file(&paths.log_dir, CORPUS_LOG, LogKind::Stdout).map_err(start_error)?)
        .stderr(open_log_file(&paths.log_dir, CORPUS_LOG, LogKind::Stderr).map_err(start_error)?)
        .spawn()
        .map_err(start_error)?;

    loop {
        if let Some(status) = child.try_wait().map_err(start_error)? {
            if status.success() {
                info!("Corpus ingestion finished");
                return Ok(());
            }
            return Err(StackError::Ingestion(format!("command exited with {status}")));
        }

        if cancel.sleep(Duration::from_millis(100)) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(StackError::Aborted);
        }
    }
}
