//! Per-service log files.
use std::{
    collections::VecDeque,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::error::LogsError;

/// Which output stream of a service to read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogKind {
    /// Standard output logs
    #[default]
    Stdout,
    /// Standard error logs
    Stderr,
}

impl LogKind {
    /// String representation for file paths and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Stdout => "stdout",
            LogKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stdout" => Ok(LogKind::Stdout),
            "stderr" => Ok(LogKind::Stderr),
            _ => Err(format!(
                "invalid log kind '{}', must be one of: stdout, stderr",
                s
            )),
        }
    }
}

/// Path of the log file for `service` and `kind`.
pub fn log_path(log_dir: &Path, service: &str, kind: LogKind) -> PathBuf {
    log_dir.join(format!("{service}.{}.log", kind.as_str()))
}

/// Opens (creating if needed) a service log file for appending.
pub fn open_log_file(log_dir: &Path, service: &str, kind: LogKind) -> io::Result<File> {
    fs::create_dir_all(log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(log_dir, service, kind))
}

/// Returns the last `lines` lines of a file, or nothing if it does not exist.
pub fn tail(path: &Path, lines: usize) -> Result<Vec<String>, LogsError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut buffer: VecDeque<String> = VecDeque::with_capacity(lines);
    for chunk in reader.split(b'\n') {
        if lines == 0 {
            break;
        }
        let mut bytes = chunk?;
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        if buffer.len() == lines {
            buffer.pop_front();
        }
        buffer.push_back(String::from_utf8_lossy(&bytes).into_owned());
    }

    Ok(buffer.into_iter().collect())
}

/// Reads the tail of each named service's log, in the given order.
pub fn collect_logs(
    log_dir: &Path,
    services: &[String],
    lines: usize,
    kind: LogKind,
) -> Result<Vec<(String, Vec<String>)>, LogsError> {
    services
        .iter()
        .map(|service| Ok((service.clone(), tail(&log_path(log_dir, service, kind), lines)?)))
        .collect()
}
