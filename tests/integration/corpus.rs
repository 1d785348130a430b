#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{stackctl, write_config};
use predicates::boolean::PredicateBooleanExt;
use predicates::str::contains;
use tempfile::tempdir;

const CONFIG: &str = r#"version: "1"
services:
  retrieval:
    command: "sleep 30"
corpus:
  source_dirs: ["corpus/pdfs", "corpus/images"]
  command: "ls corpus/pdfs corpus/images > ingested.txt"
"#;

#[test]
fn ingestion_is_refused_while_sources_are_empty() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_config(dir, CONFIG);
    fs::create_dir_all(dir.join("corpus/pdfs")).unwrap();

    stackctl(dir)
        .arg("corpus")
        .assert()
        .code(1)
        .stderr(contains("corpus/pdfs").and(contains("corpus/images")));

    assert!(!dir.join("ingested.txt").exists());
}

#[test]
fn ingestion_runs_once_documents_are_present() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_config(dir, CONFIG);
    fs::create_dir_all(dir.join("corpus/pdfs")).unwrap();
    fs::create_dir_all(dir.join("corpus/images")).unwrap();
    fs::write(dir.join("corpus/pdfs/handbook.pdf"), b"%PDF-1.7").unwrap();

    stackctl(dir)
        .arg("corpus")
        .assert()
        .success()
        .stdout(contains("Corpus ingestion complete"));

    let listing = fs::read_to_string(dir.join("ingested.txt")).unwrap();
    assert!(listing.contains("handbook.pdf"));
}

#[test]
fn failing_ingestion_command_is_an_error() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_config(
        dir,
        r#"version: "1"
services:
  retrieval:
    command: "sleep 30"
corpus:
  source_dirs: ["corpus"]
  command: "echo conversion failed >&2; exit 3"
"#,
    );
    fs::create_dir_all(dir.join("corpus")).unwrap();
    fs::write(dir.join("corpus/scan.png"), b"\x89PNG").unwrap();

    stackctl(dir)
        .arg("corpus")
        .assert()
        .code(1)
        .stderr(contains("ingestion failed"));

    let stderr_log = fs::read_to_string(dir.join(".stackctl/logs/corpus.stderr.log")).unwrap();
    assert!(stderr_log.contains("conversion failed"));
}
