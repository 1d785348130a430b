#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{HealthServer, closed_url, populate, stackctl, wait_for_lines, write_config};
use predicates::boolean::PredicateBooleanExt;
use predicates::str::contains;
use stackctl::{
    config::load_config,
    runtime::{ProjectLock, RuntimePaths},
};
use tempfile::tempdir;

#[test]
fn help_lists_operator_commands() {
    let temp = tempdir().expect("failed to create tempdir");
    let output = stackctl(temp.path())
        .arg("--help")
        .output()
        .expect("help runs");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in [
        "start", "stop", "restart", "status", "logs", "corpus", "backup", "restore",
        "snapshots", "test", "help",
    ] {
        assert!(stdout.contains(command), "help is missing '{command}'");
    }
}

#[test]
fn cyclic_configuration_is_rejected_before_anything_runs() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_config(
        dir,
        r#"version: "1"
services:
  alpha:
    command: "touch alpha.ran; sleep 30"
    depends_on: ["beta"]
  beta:
    command: "touch beta.ran; sleep 30"
    depends_on: ["alpha"]
"#,
    );

    stackctl(dir)
        .arg("start")
        .assert()
        .code(1)
        .stderr(contains("cycle").and(contains("alpha")).and(contains("beta")));

    assert!(!dir.join("alpha.ran").exists());
    assert!(!dir.join("beta.ran").exists());
}

#[test]
fn unknown_dependency_names_the_offender() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_config(
        dir,
        r#"version: "1"
services:
  ui:
    command: "sleep 30"
    depends_on: ["inference"]
"#,
    );

    stackctl(dir)
        .arg("status")
        .assert()
        .code(1)
        .stderr(contains("ui").and(contains("inference")));
}

#[test]
fn held_lock_is_reported_before_state_files_are_read() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config_path = write_config(
        dir,
        r#"version: "1"
services:
  api:
    command: "sleep 30"
"#,
    );
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    let paths = RuntimePaths::from_config(&config);
    let _held = ProjectLock::acquire(&paths).expect("lock acquired");
    // Looks like a pid file caught mid-write by the lock holder.
    fs::write(paths.pid_file(), "{\"services\": {\"api\": ").unwrap();

    stackctl(dir)
        .arg("stop")
        .assert()
        .code(1)
        .stderr(contains("Another stackctl command is running"));
}

#[test]
fn test_command_reports_pass_and_fail_per_service() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let server = HealthServer::start(200);
    write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  retrieval:
    command: "sleep 30"
    health_check:
      url: "{healthy}"
  inference:
    command: "sleep 30"
    health_check:
      url: "{broken}"
      timeout: "500ms"
"#,
            healthy = server.url(),
            broken = closed_url(),
        ),
    );

    stackctl(dir)
        .arg("test")
        .assert()
        .code(1)
        .stdout(contains("PASS retrieval").and(contains("FAIL inference")))
        .stderr(contains("Failing services: inference"));
}

#[test]
fn start_status_logs_and_stop_round_trip() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_config(
        dir,
        r#"version: "1"
services:
  store:
    command: "echo store ready on $PORT; exec sleep 30"
    port: 17001
    poll_interval: "50ms"
  api:
    command: "echo api says $GREETING; exec sleep 30"
    depends_on: ["store"]
    poll_interval: "50ms"
    env:
      vars:
        GREETING: "hello"
"#,
    );

    stackctl(dir)
        .arg("start")
        .assert()
        .success()
        .stdout(contains("start: ok"));

    stackctl(dir)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(contains("\"name\": \"store\"").and(contains("\"running\": true")));

    wait_for_lines(&dir.join(".stackctl/logs/api.stdout.log"), 1);
    stackctl(dir)
        .args(["logs", "--service", "api"])
        .assert()
        .success()
        .stdout(contains("api says hello"));
    stackctl(dir)
        .arg("logs")
        .assert()
        .success()
        .stdout(contains("store ready on 17001"));

    stackctl(dir)
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("stop: ok"));

    stackctl(dir)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(contains("\"running\": false").and(contains("\"running\": true").not()));
}

#[test]
fn failed_start_names_the_failing_and_skipped_services() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  inference:
    command: "sleep 30"
    poll_interval: "50ms"
    max_wait: "300ms"
    health_check:
      url: "{broken}"
      timeout: "100ms"
  ui:
    command: "sleep 30"
    depends_on: ["inference"]
"#,
            broken = closed_url(),
        ),
    );

    stackctl(dir)
        .arg("start")
        .assert()
        .code(1)
        .stdout(contains("failed-to-become-healthy").and(contains("dependency 'inference'")))
        .stderr(contains("Failed services: inference, ui"));

    stackctl(dir).arg("stop").assert().success();
}

#[test]
fn logs_for_undeclared_service_fail() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_config(
        dir,
        r#"version: "1"
services:
  api:
    command: "sleep 30"
"#,
    );

    stackctl(dir)
        .args(["logs", "--service", "ghost"])
        .assert()
        .code(1)
        .stderr(contains("ghost"));
}

#[test]
fn backup_list_and_restore_through_the_cli() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_config(
        dir,
        r#"version: "1"
services:
  retrieval:
    command: "sleep 30"
    poll_interval: "50ms"
data:
  directories:
    corpus:
      path: "data/corpus"
      used_by: ["retrieval"]
"#,
    );
    populate(&dir.join("data/corpus"), "corpus");

    let output = stackctl(dir).arg("backup").output().expect("backup runs");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let id = stdout
        .lines()
        .find_map(|line| line.strip_prefix("Created snapshot "))
        .expect("snapshot id printed")
        .trim()
        .to_string();

    stackctl(dir)
        .arg("snapshots")
        .assert()
        .success()
        .stdout(contains(id.as_str()).and(contains("corpus")));

    fs::write(dir.join("data/corpus/index.txt"), "changed").unwrap();

    stackctl(dir).arg("start").assert().success();
    stackctl(dir)
        .args(["restore", &id])
        .assert()
        .code(1)
        .stderr(contains("retrieval"));
    assert_eq!(
        fs::read_to_string(dir.join("data/corpus/index.txt")).unwrap(),
        "changed"
    );

    stackctl(dir).arg("stop").assert().success();
    stackctl(dir)
        .args(["restore", &id])
        .assert()
        .success()
        .stdout(contains(format!("Restored snapshot {id}")));
    assert_eq!(
        fs::read_to_string(dir.join("data/corpus/index.txt")).unwrap(),
        "corpus index\n"
    );
}

#[test]
fn safe_backup_restarts_a_running_stack() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_config(
        dir,
        r#"version: "1"
services:
  retrieval:
    command: "sleep 30"
    poll_interval: "50ms"
data:
  directories:
    corpus:
      path: "data/corpus"
"#,
    );
    populate(&dir.join("data/corpus"), "corpus");

    stackctl(dir).arg("start").assert().success();
    stackctl(dir)
        .args(["backup", "--safe"])
        .assert()
        .success()
        .stdout(
            contains("stop: ok")
                .and(contains("Created snapshot"))
                .and(contains("start: ok")),
        );
    stackctl(dir)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(contains("\"running\": true"));
    stackctl(dir).arg("stop").assert().success();
}
