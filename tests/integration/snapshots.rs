#[path = "common/mod.rs"]
mod common;

use std::{fs, sync::Arc};

use common::{populate, read_tree, write_config};
use stackctl::{
    config::load_config,
    error::StackError,
    orchestrator::Orchestrator,
    poller::CancelToken,
    probe::StackProbe,
    process::ShellLauncher,
    runtime::RuntimePaths,
    snapshot::SnapshotManager,
};
use tempfile::tempdir;

const CONFIG: &str = r#"version: "1"
services:
  retrieval:
    command: "sleep 30"
    poll_interval: "50ms"
data:
  snapshot_dir: "backups"
  directories:
    corpus:
      path: "data/corpus"
      used_by: ["retrieval"]
    models:
      path: "data/models"
"#;

#[test]
fn backup_then_restore_reproduces_directories_byte_for_byte() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config_path = write_config(dir, CONFIG);
    populate(&dir.join("data/corpus"), "corpus");
    populate(&dir.join("data/models"), "models");

    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    let directories = config.data_dirs();
    let snapshots = SnapshotManager::new(config.snapshot_dir());

    let before_corpus = read_tree(&dir.join("data/corpus"));
    let before_models = read_tree(&dir.join("data/models"));

    let snapshot = snapshots.backup(&directories).expect("backup");
    assert!(snapshot.source("corpus").is_some());
    assert!(snapshot.source("models").is_some());
    snapshots.verify(&snapshot).expect("fresh snapshot verifies");

    // Diverge from the snapshot.
    fs::write(dir.join("data/corpus/index.txt"), "rewritten").unwrap();
    fs::write(dir.join("data/corpus/extra.txt"), "new file").unwrap();
    fs::remove_dir_all(dir.join("data/models/nested")).unwrap();

    let paths = RuntimePaths::from_config(&config);
    let launcher = Arc::new(ShellLauncher::new(paths).unwrap());
    let probe = Arc::new(StackProbe::new(launcher.clone()).unwrap());
    let orchestrator =
        Orchestrator::new(config.graph().unwrap(), launcher, probe, CancelToken::new());

    let restored = orchestrator
        .restore(&snapshots, &snapshot.id, &directories)
        .expect("restore with stack stopped");
    assert_eq!(restored.id, snapshot.id);

    assert_eq!(read_tree(&dir.join("data/corpus")), before_corpus);
    assert_eq!(read_tree(&dir.join("data/models")), before_models);
}

#[test]
fn restore_is_refused_while_a_service_runs() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config_path = write_config(dir, CONFIG);
    populate(&dir.join("data/corpus"), "corpus");
    populate(&dir.join("data/models"), "models");

    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    let directories = config.data_dirs();
    let snapshots = SnapshotManager::new(config.snapshot_dir());
    let snapshot = snapshots.backup(&directories).unwrap();

    fs::write(dir.join("data/corpus/index.txt"), "live edit").unwrap();

    let paths = RuntimePaths::from_config(&config);
    let launcher = Arc::new(ShellLauncher::new(paths).unwrap());
    let probe = Arc::new(StackProbe::new(launcher.clone()).unwrap());
    let orchestrator =
        Orchestrator::new(config.graph().unwrap(), launcher, probe, CancelToken::new());
    assert!(orchestrator.start().unwrap().success());

    match orchestrator.restore(&snapshots, &snapshot.id, &directories) {
        Err(StackError::PreconditionViolated(message)) => assert!(message.contains("retrieval")),
        other => panic!("expected precondition failure, got {other:?}"),
    }
    assert_eq!(
        fs::read_to_string(dir.join("data/corpus/index.txt")).unwrap(),
        "live edit"
    );

    assert!(orchestrator.stop().unwrap().success());
    orchestrator
        .restore(&snapshots, &snapshot.id, &directories)
        .expect("restore after stop");
    assert_eq!(
        fs::read_to_string(dir.join("data/corpus/index.txt")).unwrap(),
        "corpus index\n"
    );
}

#[test]
fn snapshots_taken_in_the_same_second_get_distinct_ids() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let config_path = write_config(dir, CONFIG);
    populate(&dir.join("data/corpus"), "corpus");
    populate(&dir.join("data/models"), "models");

    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    let snapshots = SnapshotManager::new(config.snapshot_dir());

    let ids: Vec<String> = (0..3)
        .map(|_| snapshots.backup(&config.data_dirs()).unwrap().id)
        .collect();
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 3);

    let listed: Vec<String> = snapshots.list().unwrap().into_iter().map(|s| s.id).collect();
    for id in &ids {
        assert!(listed.contains(id));
    }
}
