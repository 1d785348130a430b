//! Configuration management for stackctl.
use regex::Regex;
use serde::{
    Deserialize, Deserializer,
    de::{MapAccess, Visitor},
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    env, fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::constants::{
    DEFAULT_CONFIG_FILE, DEFAULT_MAX_WAIT, DEFAULT_POLL_INTERVAL, DEFAULT_PROBE_TIMEOUT,
    DEFAULT_SNAPSHOT_DIR, SNAPSHOT_MANIFEST,
};
use crate::error::StackError;
use crate::graph::ServiceGraph;

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Services in declaration order.
    pub services: ServiceMap,
    /// Persisted data directories and the snapshot store.
    pub data: Option<DataConfig>,
    /// Corpus ingestion settings.
    pub corpus: Option<CorpusConfig>,
    /// Override for the runtime state directory.
    pub state_dir: Option<String>,
    /// Root directory from which relative paths are resolved.
    #[serde(skip)]
    pub project_dir: PathBuf,
}

/// Service declarations keyed by name, keeping the order they were written in.
#[derive(Debug, Default, Clone)]
pub struct ServiceMap(Vec<(String, ServiceConfig)>);

impl ServiceMap {
    /// Looks up a service by name.
    pub fn get(&self, name: &str) -> Option<&ServiceConfig> {
        self.0
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, service)| service)
    }

    /// Iterates over services in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServiceConfig)> {
        self.0.iter().map(|(name, service)| (name, service))
    }

    /// Service names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for ServiceMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ServiceMapVisitor;

        impl<'de> Visitor<'de> for ServiceMapVisitor {
            type Value = ServiceMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of service names to service definitions")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries: Vec<(String, ServiceConfig)> = Vec::new();
                while let Some((name, service)) =
                    access.next_entry::<String, ServiceConfig>()?
                {
                    if entries.iter().any(|(existing, _)| existing == &name) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate service '{name}'"
                        )));
                    }
                    entries.push((name, service));
                }
                Ok(ServiceMap(entries))
            }
        }

        deserializer.deserialize_map(ServiceMapVisitor)
    }
}

/// Configuration for an individual service.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceConfig {
    /// Command used to start the service.
    pub command: String,
    /// Command used to stop the service; signals the process group when absent.
    pub stop_command: Option<String>,
    /// Network port the service listens on, exported as `PORT`.
    pub port: Option<u16>,
    /// List of services that must be healthy before this service starts.
    pub depends_on: Option<Vec<String>>,
    /// Readiness endpoint for the service.
    pub health_check: Option<HealthCheckConfig>,
    /// Delay between readiness probes (e.g. "2s").
    pub poll_interval: Option<String>,
    /// Total readiness budget (e.g. "2m").
    pub max_wait: Option<String>,
    /// Optional environment variables for the service.
    pub env: Option<EnvConfig>,
}

/// HTTP readiness endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckConfig {
    /// URL polled for readiness.
    pub url: String,
    /// Exact status that signals readiness; any 2xx when unset.
    pub expect_status: Option<u16>,
    /// Per-attempt timeout (e.g. "5s").
    pub timeout: Option<String>,
}

/// Represents environment variables for a service.
#[derive(Debug, Deserialize, Clone)]
pub struct EnvConfig {
    /// Optional path to an environment file.
    pub file: Option<String>,
    /// Key-value pairs of environment variables.
    pub vars: Option<HashMap<String, String>>,
}

impl EnvConfig {
    /// Resolves the full path to the env file based on a base directory.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| resolve_path(base, f))
    }
}

/// Persisted data directories.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DataConfig {
    /// Where snapshots are written.
    pub snapshot_dir: Option<String>,
    /// Named directories covered by backup and restore.
    #[serde(default)]
    pub directories: BTreeMap<String, DataDirConfig>,
}

/// One persisted directory and the services that write to it.
#[derive(Debug, Deserialize, Clone)]
pub struct DataDirConfig {
    pub path: String,
    #[serde(default)]
    pub used_by: Vec<String>,
}

/// Corpus ingestion settings.
#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    /// Directories holding documents awaiting ingestion.
    pub source_dirs: Vec<String>,
    /// Ingestion command run from the project directory.
    pub command: String,
}

/// HTTP readiness check with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub url: String,
    pub expect_status: Option<u16>,
    pub timeout: Duration,
}

/// A fully resolved service declaration, immutable for the lifetime of a command.
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub command: String,
    pub stop_command: Option<String>,
    pub port: Option<u16>,
    pub depends_on: Vec<String>,
    pub health_check: Option<HealthCheck>,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub env: Option<EnvConfig>,
}

impl Service {
    /// Resolves durations and defaults for a raw service declaration.
    pub fn from_config(name: &str, raw: &ServiceConfig) -> Result<Self, StackError> {
        let poll_interval = match &raw.poll_interval {
            Some(value) => parse_duration(value)?,
            None => DEFAULT_POLL_INTERVAL,
        };
        let max_wait = match &raw.max_wait {
            Some(value) => parse_duration(value)?,
            None => DEFAULT_MAX_WAIT,
        };

        if poll_interval.is_zero() {
            return Err(StackError::Config(format!(
                "service '{name}' has a zero poll_interval"
            )));
        }
        if max_wait.is_zero() {
            return Err(StackError::Config(format!(
                "service '{name}' has a zero max_wait"
            )));
        }

        let health_check = match &raw.health_check {
            Some(check) => Some(HealthCheck {
                url: check.url.clone(),
                expect_status: check.expect_status,
                timeout: match &check.timeout {
                    Some(value) => parse_duration(value)?,
                    None => DEFAULT_PROBE_TIMEOUT,
                },
            }),
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            command: raw.command.clone(),
            stop_command: raw.stop_command.clone(),
            port: raw.port,
            depends_on: raw.depends_on.clone().unwrap_or_default(),
            health_check,
            poll_interval,
            max_wait,
            env: raw.env.clone(),
        })
    }
}

/// A data directory with its path resolved against the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    pub name: String,
    pub path: PathBuf,
    pub used_by: Vec<String>,
}

impl Config {
    /// Resolved services in declaration order.
    pub fn services(&self) -> Result<Vec<Service>, StackError> {
        self.services
            .iter()
            .map(|(name, raw)| Service::from_config(name, raw))
            .collect()
    }

    /// Builds the dependency graph, failing on unknown dependencies or cycles.
    pub fn graph(&self) -> Result<ServiceGraph, StackError> {
        ServiceGraph::new(self.services()?)
    }

    /// Data directories with absolute paths, sorted by name.
    pub fn data_dirs(&self) -> Vec<DataDir> {
        self.data
            .as_ref()
            .map(|data| {
                data.directories
                    .iter()
                    .map(|(name, dir)| DataDir {
                        name: name.clone(),
                        path: resolve_path(&self.project_dir, &dir.path),
                        used_by: dir.used_by.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Location of the snapshot store.
    pub fn snapshot_dir(&self) -> PathBuf {
        let raw = self
            .data
            .as_ref()
            .and_then(|data| data.snapshot_dir.as_deref())
            .unwrap_or(DEFAULT_SNAPSHOT_DIR);
        resolve_path(&self.project_dir, raw)
    }

    /// Checks everything that must hold before any service is touched.
    pub fn validate(&self) -> Result<(), StackError> {
        if self.services.is_empty() {
            return Err(StackError::Config("no services declared".into()));
        }

        self.graph()?;

        let declared: HashSet<String> = self.services.names().into_iter().collect();
        let snapshot_dir = self.snapshot_dir();
        for dir in self.data_dirs() {
            validate_data_dir_name(&dir.name)?;
            if snapshot_dir.starts_with(&dir.path) || dir.path.starts_with(&snapshot_dir) {
                return Err(StackError::Config(format!(
                    "data directory '{}' ({}) overlaps the snapshot store ({})",
                    dir.name,
                    dir.path.display(),
                    snapshot_dir.display()
                )));
            }
            for user in &dir.used_by {
                if !declared.contains(user) {
                    return Err(StackError::Config(format!(
                        "data directory '{}' is used by undeclared service '{user}'",
                        dir.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Data directory names become path components inside each snapshot.
fn validate_data_dir_name(name: &str) -> Result<(), StackError> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name == SNAPSHOT_MANIFEST;
    if invalid {
        return Err(StackError::Config(format!(
            "invalid data directory name '{name}': must be a plain name, not hidden, and not '{SNAPSHOT_MANIFEST}'"
        )));
    }
    Ok(())
}

/// Resolves `raw` against `base` unless it is already absolute.
pub fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Expands `${VAR}` references, failing on unset variables.
///
/// Bare `$VAR` is left alone for the service shell, which sees `PORT` and `env` entries.
fn expand_env_vars(input: &str) -> Result<String, StackError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|err| StackError::Config(err.to_string()))?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.push(var_name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(StackError::Config(format!(
            "missing environment variable(s): {}",
            missing.join(", ")
        )));
    }

    Ok(result.to_string())
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, StackError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(StackError::Config("Duration value cannot be empty".into()));
    }

    let invalid = || StackError::Config(format!("Invalid duration value: '{raw}'"));

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Loads, expands and validates the configuration file.
pub fn load_config(config_path: Option<&str>) -> Result<Config, StackError> {
    let config_path = Path::new(config_path.unwrap_or(DEFAULT_CONFIG_FILE));

    let content = fs::read_to_string(config_path).map_err(|e| {
        StackError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content)?;
    let mut config: Config = serde_yaml::from_str(&expanded)?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    config.project_dir = base_path
        .canonicalize()
        .unwrap_or_else(|_| base_path.to_path_buf());

    config.validate()?;
    Ok(config)
}
