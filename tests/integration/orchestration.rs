#[path = "common/mod.rs"]
mod common;

use std::{fs, sync::Arc};

use common::{HealthServer, closed_url, wait_for_lines, write_config};
use stackctl::{
    config::load_config,
    orchestrator::{Orchestrator, ServiceOutcome},
    poller::CancelToken,
    probe::StackProbe,
    process::{ServiceLauncher, ShellLauncher},
    runtime::RuntimePaths,
};
use tempfile::tempdir;

fn orchestrator_for(config_path: &std::path::Path) -> (Orchestrator, Arc<ShellLauncher>) {
    let config = load_config(Some(config_path.to_str().unwrap())).expect("config should load");
    let paths = RuntimePaths::from_config(&config);
    let launcher = Arc::new(ShellLauncher::new(paths).expect("launcher"));
    let probe = Arc::new(StackProbe::new(launcher.clone()).expect("probe"));
    let orchestrator = Orchestrator::new(
        config.graph().expect("graph"),
        launcher.clone(),
        probe,
        CancelToken::new(),
    );
    (orchestrator, launcher)
}

#[test]
fn unhealthy_service_blocks_only_its_dependents() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let server = HealthServer::start(200);

    let config = write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  store:
    command: "sleep 30"
    stop_command: "echo store >> stops.log"
    poll_interval: "50ms"
    max_wait: "2s"
    health_check:
      url: "{healthy}"
  inference:
    command: "sleep 30"
    stop_command: "echo inference >> stops.log"
    poll_interval: "50ms"
    max_wait: "300ms"
    health_check:
      url: "{broken}"
      timeout: "200ms"
  ui:
    command: "sleep 30"
    stop_command: "echo ui >> stops.log"
    depends_on: ["inference"]
  indexer:
    command: "sleep 30"
    stop_command: "echo indexer >> stops.log"
    poll_interval: "50ms"
    depends_on: ["store"]
"#,
            healthy = server.url(),
            broken = closed_url(),
        ),
    );

    let (orchestrator, launcher) = orchestrator_for(&config);

    let run = orchestrator.start().expect("start run");
    assert!(!run.success());
    assert!(!run.aborted);
    assert_eq!(run.outcome("store"), Some(&ServiceOutcome::Started));
    assert!(matches!(
        run.outcome("inference"),
        Some(ServiceOutcome::FailedToBecomeHealthy { .. })
    ));
    assert_eq!(
        run.outcome("ui"),
        Some(&ServiceOutcome::SkippedDueToDependencyFailure {
            dependency: "inference".into()
        })
    );
    assert_eq!(run.outcome("indexer"), Some(&ServiceOutcome::Started));
    assert_eq!(run.failed_services(), vec!["inference", "ui"]);
    assert!(!launcher.is_running("ui"), "skipped services are never launched");

    let stop = orchestrator.stop().expect("stop run");
    assert!(stop.success());
    let order: Vec<_> = stop.entries.iter().map(|entry| entry.service.as_str()).collect();
    assert_eq!(order, vec!["indexer", "ui", "inference", "store"]);

    let stops = wait_for_lines(&dir.join("stops.log"), 4);
    assert_eq!(stops, vec!["indexer", "ui", "inference", "store"]);
    for name in ["store", "inference", "indexer"] {
        assert!(!launcher.is_running(name), "'{name}' should be stopped");
    }
}

#[test]
fn chain_stops_in_reverse_dependency_order() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    // Declared out of dependency order on purpose.
    let config = write_config(
        dir,
        r#"version: "1"
services:
  c:
    command: "sleep 30"
    depends_on: ["b"]
    poll_interval: "50ms"
  a:
    command: "sleep 30"
    poll_interval: "50ms"
  b:
    command: "sleep 30"
    depends_on: ["a"]
    poll_interval: "50ms"
"#,
    );

    let (orchestrator, launcher) = orchestrator_for(&config);

    let start = orchestrator.start().expect("start run");
    assert!(start.success(), "start failed: {start}");
    let started: Vec<_> = start.entries.iter().map(|entry| entry.service.as_str()).collect();
    assert_eq!(started, vec!["a", "b", "c"]);

    #[cfg(target_os = "linux")]
    let pids: Vec<u32> = ["a", "b", "c"]
        .iter()
        .map(|name| launcher.pid(name).expect("pid recorded"))
        .collect();

    let stop = orchestrator.stop().expect("stop run");
    let stopped: Vec<_> = stop.entries.iter().map(|entry| entry.service.as_str()).collect();
    assert_eq!(stopped, vec!["c", "b", "a"]);

    #[cfg(target_os = "linux")]
    for pid in pids {
        common::wait_for_process_exit(pid);
    }
    assert!(orchestrator.running_services().is_empty());
}

#[test]
fn second_start_reverifies_instead_of_relaunching() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    let config = write_config(
        dir,
        r#"version: "1"
services:
  api:
    command: "echo launched >> launches.log; exec sleep 30"
    poll_interval: "50ms"
    env:
      vars:
        GREETING: "hello"
    port: 18080
"#,
    );

    let (orchestrator, launcher) = orchestrator_for(&config);

    assert!(orchestrator.start().expect("first start").success());
    let pid = launcher.pid("api").expect("pid recorded");
    assert!(orchestrator.start().expect("second start").success());
    assert_eq!(launcher.pid("api"), Some(pid));

    let launches = fs::read_to_string(dir.join("launches.log")).unwrap();
    assert_eq!(launches.lines().count(), 1);

    assert!(orchestrator.stop().expect("stop").success());
}
