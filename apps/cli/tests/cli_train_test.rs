//! Integration tests for the `stackwise` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Small two-stage run over synthetic data: 2 + 4 steps.
fn write_config(temp_dir: &TempDir) -> PathBuf {
    let logs_dir = temp_dir.path().join("logs");
    let content = format!(
        r#"
epochs = 1
hidden_sizes = [4, 2]
batch_sizes = [16, 8]
logs_dir = '{}'

[data]
type = "synthetic"
size = 32
dim = 8
rank = 2
noise = 0.01
"#,
        logs_dir.display()
    );
    let path = temp_dir.path().join("stackwise.toml");
    std::fs::write(&path, content).unwrap();
    path
}

fn stackwise(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("stackwise").unwrap();
    cmd.current_dir(dir);
    cmd
}

#[test]
fn test_init_writes_default_config() {
    let temp_dir = TempDir::new().unwrap();

    stackwise(temp_dir.path()).arg("init").assert().success().stdout(predicate::str::contains("Wrote"));

    let content = std::fs::read_to_string(temp_dir.path().join("stackwise.toml")).unwrap();
    assert!(content.contains("hidden_sizes"));
    assert!(content.contains("[data]"));
}

#[test]
fn test_init_refuses_to_overwrite_without_force() {
    let temp_dir = TempDir::new().unwrap();
    stackwise(temp_dir.path()).arg("init").assert().success();

    stackwise(temp_dir.path()).arg("init").assert().failure().stderr(predicate::str::contains("already exists"));
    stackwise(temp_dir.path()).args(["init", "--force"]).assert().success();
}

#[test]
fn test_train_then_show_checkpoint() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);

    stackwise(temp_dir.path())
        .args(["train", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Training complete"));

    let assert = stackwise(temp_dir.path()).args(["checkpoint", "show", "--json"]).assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let record: serde_json::Value = serde_json::from_str(&stdout).expect("checkpoint show --json prints JSON");

    assert_eq!(record["step"], 6);
}

#[test]
fn test_train_json_summary() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);

    let assert = stackwise(temp_dir.path()).args(["train", "--json", "--config"]).arg(&config).assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let summary: serde_json::Value = serde_json::from_str(&stdout).expect("train --json prints JSON");

    assert_eq!(summary["final_step"], 6);
    assert_eq!(summary["stages_completed"], 2);
}

#[test]
fn test_restore_without_checkpoint_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);

    stackwise(temp_dir.path())
        .args(["train", "--restore", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to restore checkpoint"));
}

#[test]
fn test_mismatched_stage_lists_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.toml");
    std::fs::write(&path, "hidden_sizes = [4, 2]\nbatch_sizes = [16]\n").unwrap();

    stackwise(temp_dir.path())
        .args(["train", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("batch_sizes"));
}

#[test]
fn test_show_without_checkpoint() {
    let temp_dir = TempDir::new().unwrap();
    write_config(&temp_dir);

    stackwise(temp_dir.path())
        .args(["checkpoint", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No checkpoint found"));
}
