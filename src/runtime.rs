//! Runtime paths and the project-wide command lock.
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::config::{Config, resolve_path};
use crate::constants::{
    DEFAULT_STATE_DIR, LOCK_FILE_NAME, LOG_DIR_NAME, PID_FILE_NAME, STATE_FILE_NAME,
};
use crate::error::StackError;

/// Where a project keeps its PIDs, state and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Root of the runtime state.
    pub state_dir: PathBuf,
    /// Per-service log files.
    pub log_dir: PathBuf,
    /// Working directory for service commands.
    pub project_dir: PathBuf,
}

impl RuntimePaths {
    /// Resolves the runtime layout for a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let raw = config.state_dir.as_deref().unwrap_or(DEFAULT_STATE_DIR);
        Self::new(resolve_path(&config.project_dir, raw), &config.project_dir)
    }

    pub fn new(state_dir: PathBuf, project_dir: &Path) -> Self {
        let log_dir = state_dir.join(LOG_DIR_NAME);
        Self {
            state_dir,
            log_dir,
            project_dir: project_dir.to_path_buf(),
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join(PID_FILE_NAME)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE_NAME)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE_NAME)
    }

    /// Creates the state and log directories.
    pub fn ensure(&self) -> Result<(), StackError> {
        fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}

/// Exclusive advisory lock held for the duration of a mutating command.
///
/// Released when dropped.
#[derive(Debug)]
pub struct ProjectLock {
    _file: File,
    path: PathBuf,
}

impl ProjectLock {
    /// Takes the lock without blocking; fails with [`StackError::Locked`] when held.
    pub fn acquire(paths: &RuntimePaths) -> Result<Self, StackError> {
        paths.ensure()?;
        let path = paths.lock_file();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if FileExt::try_lock_exclusive(&file).is_err() {
            let owner = fs::read_to_string(&path).unwrap_or_default();
            debug!("Lock on {:?} held by PID {}", path, owner.trim());
            return Err(StackError::Locked(path.display().to_string()));
        }

        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        debug!("Acquired project lock on {:?}", path);

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
