//! Start and stop capabilities for orchestrated services.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};
use strum_macros::Display;
use tracing::{debug, error, info, warn};

use crate::config::{EnvConfig, Service};
use crate::constants::{
    DEFAULT_SHELL, SHELL_COMMAND_FLAG, STOP_CHECK_INTERVAL, STOP_GRACE_CHECKS,
};
use crate::error::{PidFileError, ServiceStateError, StackError};
use crate::logs::{LogKind, open_log_file};
use crate::runtime::RuntimePaths;

/// Upper bound for a configured `stop_command`.
const STOP_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the environment map for a service, giving inline `env.vars` precedence over entries loaded
/// from `env.file`.
fn collect_service_env(
    env: &Option<EnvConfig>,
    project_root: &Path,
    service_name: &str,
) -> HashMap<String, String> {
    let mut resolved = HashMap::new();

    if let Some(env_config) = env {
        if let Some(file_path) = env_config.path(project_root) {
            match fs::read_to_string(&file_path) {
                Ok(content) => {
                    for raw_line in content.lines() {
                        let line = raw_line.trim();
                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }

                        if let Some((key, value)) = line.split_once('=') {
                            let mut value = value.trim();
                            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"')
                            {
                                value = &value[1..value.len() - 1];
                            }
                            resolved
                                .entry(key.trim().to_string())
                                .or_insert_with(|| value.to_string());
                        } else {
                            warn!(
                                "Ignoring malformed line in env file for '{}': {}",
                                service_name, line
                            );
                        }
                    }
                }
                Err(err) => {
                    error!("Failed to read env file for '{}': {}", service_name, err);
                }
            }
        }

        if let Some(vars) = &env_config.vars {
            for (key, value) in vars {
                resolved.insert(key.clone(), value.clone());
            }
        }
    }

    resolved
}

/// Wait for a child process with a timeout, returning `Ok(None)` on timeout.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Returns true when a process with `pid` exists.
pub fn pid_alive(pid: u32) -> bool {
    let target = nix::unistd::Pid::from_raw(pid as i32);
    match nix::sys::signal::kill(target, None) {
        Ok(_) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Represents the PID file structure
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct PidFile {
    /// Map of service names to their respective PIDs.
    services: HashMap<String, u32>,
    #[serde(skip)]
    path: PathBuf,
}

impl PidFile {
    /// Loads the PID file from disk, starting empty when it does not exist.
    pub fn load(path: &Path) -> Result<Self, PidFileError> {
        let mut pid_file = if path.exists() {
            let contents = fs::read_to_string(path)?;
            serde_json::from_str::<Self>(&contents)?
        } else {
            Self::default()
        };
        pid_file.path = path.to_path_buf();
        Ok(pid_file)
    }

    /// Returns the services map.
    pub fn services(&self) -> &HashMap<String, u32> {
        &self.services
    }

    /// Saves the current state to the PID file
    pub fn save(&self) -> Result<(), PidFileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Inserts a new service PID and saves
    pub fn insert(&mut self, service: &str, pid: u32) -> Result<(), PidFileError> {
        self.services.insert(service.to_string(), pid);
        self.save()
    }

    /// Removes a service and saves
    pub fn remove(&mut self, service: &str) -> Result<(), PidFileError> {
        if self.services.remove(service).is_some() {
            self.save()
        } else {
            Err(PidFileError::ServiceNotFound)
        }
    }

    /// Retrieves a service PID
    pub fn get(&self, service: &str) -> Option<u32> {
        self.services.get(service).copied()
    }
}

/// Enumerates the persisted lifecycle states for managed services.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceLifecycleStatus {
    Starting,
    Running,
    Unhealthy,
    Skipped,
    Stopped,
    StopFailed,
}

/// Persisted service runtime metadata used to inform status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStateEntry {
    pub status: ServiceLifecycleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

/// Persistent record of the last-known state for every managed service.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct ServiceStateFile {
    services: HashMap<String, ServiceStateEntry>,
    #[serde(skip)]
    path: PathBuf,
}

impl ServiceStateFile {
    pub fn load(path: &Path) -> Result<Self, ServiceStateError> {
        let mut state = if path.exists() {
            let contents = fs::read_to_string(path)?;
            serde_json::from_str::<Self>(&contents)?
        } else {
            Self::default()
        };
        state.path = path.to_path_buf();
        Ok(state)
    }

    pub fn save(&self) -> Result<(), ServiceStateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn get(&self, service: &str) -> Option<&ServiceStateEntry> {
        self.services.get(service)
    }

    pub fn set(
        &mut self,
        service: &str,
        status: ServiceLifecycleStatus,
        pid: Option<u32>,
    ) -> Result<(), ServiceStateError> {
        self.services.insert(
            service.to_string(),
            ServiceStateEntry {
                status,
                pid,
                updated_at: Utc::now(),
            },
        );
        self.save()
    }
}

/// The opaque start/stop capability the orchestrator invokes.
pub trait ServiceLauncher: Send + Sync {
    /// Launches the service's process group without waiting for readiness.
    fn start(&self, service: &Service) -> Result<(), StackError>;

    /// Stops the service; stopping an already stopped service succeeds.
    fn stop(&self, service: &Service) -> Result<(), StackError>;

    /// Whether the service currently has a live process.
    fn is_running(&self, name: &str) -> bool;

    /// PID of the service's process, if one is tracked.
    fn pid(&self, _name: &str) -> Option<u32> {
        None
    }

    /// Records the orchestrator's verdict for status reporting.
    fn record(&self, _name: &str, _status: ServiceLifecycleStatus) {}

    /// Last recorded verdict.
    fn recorded(&self, _name: &str) -> Option<ServiceStateEntry> {
        None
    }
}

/// Launches services as detached `sh -c` process groups tracked through the PID file.
pub struct ShellLauncher {
    paths: RuntimePaths,
    /// Children spawned by this process, kept so exited ones can be reaped.
    children: Mutex<HashMap<String, Child>>,
    pid_file: Mutex<PidFile>,
    state_file: Mutex<ServiceStateFile>,
}

impl ShellLauncher {
    pub fn new(paths: RuntimePaths) -> Result<Self, StackError> {
        paths.ensure()?;
        let pid_file = PidFile::load(&paths.pid_file())?;
        let state_file = ServiceStateFile::load(&paths.state_file())?;
        Ok(Self {
            paths,
            children: Mutex::new(HashMap::new()),
            pid_file: Mutex::new(pid_file),
            state_file: Mutex::new(state_file),
        })
    }

    fn update_state(
        &self,
        service: &str,
        status: ServiceLifecycleStatus,
        pid: Option<u32>,
    ) -> Result<(), StackError> {
        self.state_file.lock()?.set(service, status, pid)?;
        Ok(())
    }

    fn forget_pid(&self, service: &str) -> Result<(), StackError> {
        match self.pid_file.lock()?.remove(service) {
            Ok(()) | Err(PidFileError::ServiceNotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Reaps an owned child if it has exited. Returns `Some(false)` when it is gone.
    fn owned_child_alive(&self, name: &str) -> Option<bool> {
        let mut children = self.children.lock().ok()?;
        let child = children.get_mut(name)?;
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Service '{name}' exited with {status}");
                children.remove(name);
                Some(false)
            }
            Ok(None) => Some(true),
            Err(err) => {
                warn!("Failed to poll child of '{name}': {err}");
                None
            }
        }
    }

    fn run_stop_command(&self, service: &Service, command: &str) -> Result<(), StackError> {
        debug!("Running stop command for '{}': `{command}`", service.name);

        let mut cmd = Command::new(DEFAULT_SHELL);
        cmd.arg(SHELL_COMMAND_FLAG)
            .arg(command)
            .current_dir(&self.paths.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in collect_service_env(&service.env, &self.paths.project_dir, &service.name)
        {
            cmd.env(key, value);
        }

        let stop_error = |source: std::io::Error| StackError::ServiceStopError {
            service: service.name.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(stop_error)?;
        match wait_with_timeout(&mut child, STOP_COMMAND_TIMEOUT).map_err(stop_error)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(stop_error(std::io::Error::other(format!(
                "stop command exited with {status}"
            )))),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(stop_error(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("stop command did not finish within {STOP_COMMAND_TIMEOUT:?}"),
                )))
            }
        }
    }
}

impl ServiceLauncher for ShellLauncher {
    fn start(&self, service: &Service) -> Result<(), StackError> {
        let name = service.name.as_str();
        debug!("Launching service '{name}' with command: `{}`", service.command);

        let start_error = |source: std::io::Error| StackError::ServiceStartError {
            service: name.to_string(),
            source,
        };

        let stdout = open_log_file(&self.paths.log_dir, name, LogKind::Stdout).map_err(start_error)?;
        let stderr = open_log_file(&self.paths.log_dir, name, LogKind::Stderr).map_err(start_error)?;

        let mut cmd = Command::new(DEFAULT_SHELL);
        cmd.arg(SHELL_COMMAND_FLAG)
            .arg(&service.command)
            .current_dir(&self.paths.project_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        let merged_env = collect_service_env(&service.env, &self.paths.project_dir, name);
        if !merged_env.is_empty() {
            let keys: Vec<_> = merged_env.keys().cloned().collect();
            debug!("Setting environment variables: {:?}", keys);
            cmd.envs(merged_env);
        }
        if let Some(port) = service.port {
            cmd.env("PORT", port.to_string());
        }

        unsafe {
            cmd.pre_exec(|| {
                // New session so the service outlives this command and owns its process group.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|err| {
            error!("Failed to start service '{name}': {err}");
            start_error(err)
        })?;
        let pid = child.id();
        info!("Service '{name}' launched with PID {pid}");

        self.children.lock()?.insert(name.to_string(), child);
        self.pid_file.lock()?.insert(name, pid)?;
        self.update_state(name, ServiceLifecycleStatus::Starting, Some(pid))?;
        Ok(())
    }

    fn stop(&self, service: &Service) -> Result<(), StackError> {
        let name = service.name.as_str();

        if let Some(command) = &service.stop_command {
            self.run_stop_command(service, command)?;
        }

        let pid = self.pid_file.lock()?.get(name);
        match pid {
            Some(pid) if self.is_running(name) => {
                terminate_process_group(pid, name)?;
            }
            Some(_) => debug!("Service '{name}' no longer has a live process"),
            None => debug!("Service '{name}' has no recorded PID"),
        }

        if let Some(mut child) = self.children.lock()?.remove(name) {
            let _ = child.wait();
        }

        self.forget_pid(name)?;
        self.update_state(name, ServiceLifecycleStatus::Stopped, None)?;
        debug!("Service '{name}' stopped");
        Ok(())
    }

    fn is_running(&self, name: &str) -> bool {
        if let Some(alive) = self.owned_child_alive(name) {
            return alive;
        }

        match self.pid_file.lock() {
            Ok(guard) => guard.get(name).is_some_and(pid_alive),
            Err(_) => false,
        }
    }

    fn pid(&self, name: &str) -> Option<u32> {
        self.pid_file.lock().ok()?.get(name)
    }

    fn record(&self, name: &str, status: ServiceLifecycleStatus) {
        let pid = self.pid(name);
        if let Err(err) = self.update_state(name, status, pid) {
            warn!("Failed to persist {status} state for '{name}': {err}");
        }
    }

    fn recorded(&self, name: &str) -> Option<ServiceStateEntry> {
        self.state_file.lock().ok()?.get(name).cloned()
    }
}

/// Sends SIGTERM to the service's process group, escalating to SIGKILL.
fn terminate_process_group(pid: u32, service_name: &str) -> Result<(), StackError> {
    fn nix_error_to_io(err: nix::errno::Errno) -> std::io::Error {
        std::io::Error::from_raw_os_error(err as i32)
    }

    let stop_error = |source: std::io::Error| StackError::ServiceStopError {
        service: service_name.to_string(),
        source,
    };

    let target = nix::unistd::Pid::from_raw(pid as i32);
    let own_pgid = nix::unistd::getpgrp();
    let group = match nix::unistd::getpgid(Some(target)) {
        Ok(pgid) if pgid != own_pgid => Some(pgid),
        Ok(_) => None,
        Err(nix::errno::Errno::ESRCH) => return Ok(()),
        Err(err) => return Err(stop_error(nix_error_to_io(err))),
    };

    debug!("Stopping service '{service_name}' (PID {pid}, group {group:?})");

    let signal_all = |signal: nix::sys::signal::Signal| -> Result<(), StackError> {
        if let Some(pgid) = group {
            match nix::sys::signal::killpg(pgid, signal) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(nix::errno::Errno::EPERM) => {
                    warn!(
                        "Insufficient permissions to signal process group {pgid} for '{service_name}'. Falling back to direct signal"
                    );
                }
                Err(err) => return Err(stop_error(nix_error_to_io(err))),
            }
        }
        match nix::sys::signal::kill(target, signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(err) => Err(stop_error(nix_error_to_io(err))),
        }
    };

    signal_all(nix::sys::signal::Signal::SIGTERM)?;

    for _ in 0..STOP_GRACE_CHECKS {
        thread::sleep(STOP_CHECK_INTERVAL);
        if !pid_alive(pid) || process_is_zombie(pid) {
            return Ok(());
        }
    }

    warn!("Service '{service_name}' did not exit after SIGTERM; sending SIGKILL");
    signal_all(nix::sys::signal::Signal::SIGKILL)
}

/// A zombie has exited but awaits reaping by its parent.
#[cfg(target_os = "linux")]
fn process_is_zombie(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let state = stat.rfind(')').map(|idx| stat[idx + 1..].trim_start().to_string())?;
            state.chars().next()
        })
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(not(target_os = "linux"))]
fn process_is_zombie(_pid: u32) -> bool {
    false
}
