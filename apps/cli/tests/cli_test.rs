//! Integration tests for the `kiln` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Writes a config, a dataset and pretrained weights under `temp_dir`.
fn setup(temp_dir: &TempDir, with_journal: bool) -> PathBuf {
    let root = temp_dir.path();
    fs::create_dir_all(root.join("dataset")).unwrap();
    fs::create_dir_all(root.join("pretrained")).unwrap();
    fs::write(root.join("pretrained").join("yolov8n.pt"), b"weights").unwrap();

    let journal = if with_journal {
        format!("journal_dir = \"{}\"\n", root.join("journal").display())
    } else {
        String::new()
    };
    let config = format!(
        r#"
[scheduler]
global_limit = 2
per_user_limit = 1

[storage]
root = "{models}"

[runtime]
work_dir = "{work}"
pretrained_dir = "{pretrained}"
{journal}
[logging]
level = "error"

[[devices]]
id = "cpu0"
kind = "cpu"

[[devices]]
id = "gpu0"
kind = "accelerator"
"#,
        models = root.join("models").display(),
        work = root.join("work").display(),
        pretrained = root.join("pretrained").display(),
        journal = journal,
    );
    let path = root.join("kiln.toml");
    fs::write(&path, config).unwrap();
    path
}

fn write_batch(temp_dir: &TempDir, body: &str) -> PathBuf {
    let path = temp_dir.path().join("batch.toml");
    fs::write(&path, body).unwrap();
    path
}

fn train_entry(name: &str, user: &str, model: &str, dataset: &Path, extra: &str) -> String {
    format!(
        r#"
[[jobs]]
name = "{name}"
user = "{user}"
kind = "train"
{extra}
[jobs.params]
base_model = "yolov8n.pt"
dataset = "{dataset}"
epochs = 3
model_name = "{model}"
labels = ["car", "bus"]
"#,
        dataset = dataset.display(),
    )
}

fn kiln(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("kiln").unwrap();
    cmd.arg("--config").arg(config);
    cmd
}

fn json_stdout(cmd: &mut Command) -> Value {
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_help_lists_commands() {
    let mut cmd = Command::cargo_bin("kiln").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("devices"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("models"))
        .stdout(predicate::str::contains("jobs"));
}

#[test]
fn test_devices_prints_pool() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup(&temp_dir, false);

    kiln(&config)
        .arg("devices")
        .assert()
        .success()
        .stdout(predicate::str::contains("cpu0"))
        .stdout(predicate::str::contains("gpu0"))
        .stdout(predicate::str::contains("accelerator"));

    let devices = json_stdout(kiln(&config).args(["devices", "--json"]));
    let devices = devices.as_array().unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[1]["id"], "gpu0");
    assert_eq!(devices[1]["kind"], "accelerator");
}

#[test]
fn test_missing_config_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    kiln(&temp_dir.path().join("absent.toml"))
        .arg("devices")
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration"));
}

#[test]
fn test_run_batch_then_inspect_models_and_journal() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup(&temp_dir, true);
    let dataset = temp_dir.path().join("dataset");
    let batch = write_batch(
        &temp_dir,
        &format!(
            "{}{}",
            train_entry("a", "alice", "cars", &dataset, ""),
            train_entry("b", "bob", "buses", &dataset, "")
        ),
    );

    kiln(&config)
        .arg("run")
        .arg(&batch)
        .assert()
        .success()
        .stdout(predicate::str::contains("Summary"))
        .stdout(predicate::str::contains("completed"));

    let models = json_stdout(kiln(&config).args(["models", "list", "--user", "alice", "--json"]));
    let models = models.as_array().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0]["model_name"], "cars");
    assert_eq!(models[0]["labels"], serde_json::json!(["car", "bus"]));

    let jobs = json_stdout(kiln(&config).args(["jobs", "--json"]));
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job["state"] == "completed"));

    let bobs = json_stdout(kiln(&config).args(["jobs", "--user", "bob", "--json"]));
    assert_eq!(bobs.as_array().unwrap().len(), 1);

    kiln(&config)
        .args(["models", "delete", "--user", "alice", "--name", "cars"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted"));
    kiln(&config)
        .args(["models", "delete", "--user", "alice", "--name", "cars"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_run_stop_then_resume() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup(&temp_dir, false);
    let dataset = temp_dir.path().join("dataset");
    let body = format!(
        "step_delay_ms = 50\n{}{}",
        train_entry("base", "alice", "cars", &dataset, "stop_after = 1"),
        r#"
[[jobs]]
name = "again"
user = "alice"
kind = "resume"
[jobs.params]
source_job = "base"
"#
    );
    // Ten epochs leave plenty of room for the stop to land first.
    let batch = write_batch(&temp_dir, &body.replace("epochs = 3", "epochs = 10"));

    let summary = json_stdout(kiln(&config).arg("run").arg(&batch).arg("--json"));
    let jobs = summary["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["state"], "stopped");
    assert_eq!(jobs[1]["state"], "completed");
    assert_eq!(jobs[1]["resumed_from"], jobs[0]["id"]);
    assert_eq!(jobs[1]["latest_progress"]["step"], 10);
    assert!(summary["rejected"].as_array().unwrap().is_empty());
}

#[test]
fn test_run_reports_rejections_with_failure_status() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup(&temp_dir, false);
    let batch = write_batch(
        &temp_dir,
        &train_entry("broken", "alice", "cars", &temp_dir.path().join("missing"), ""),
    );

    kiln(&config)
        .arg("run")
        .arg(&batch)
        .assert()
        .failure()
        .stdout(predicate::str::contains("rejected"))
        .stderr(predicate::str::contains("1 of 1 job(s) failed"));
}

#[test]
fn test_run_rejects_empty_batch() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup(&temp_dir, false);
    let batch = write_batch(&temp_dir, "step_delay_ms = 0\n");

    kiln(&config)
        .arg("run")
        .arg(&batch)
        .assert()
        .failure()
        .stderr(predicate::str::contains("contains no jobs"));
}

#[test]
fn test_jobs_requires_journal() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup(&temp_dir, false);

    kiln(&config)
        .arg("jobs")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No journal configured"));
}
