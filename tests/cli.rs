use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

fn fieldsync(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("fieldsync").unwrap();
    cmd.env("FIELDSYNC_HOME", home.path())
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1");
    cmd
}

fn json_output(cmd: &mut Command) -> Value {
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "command failed: {output:?}");
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_help_lists_commands() {
    let home = TempDir::new().unwrap();
    fieldsync(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("enqueue"))
        .stdout(predicate::str::contains("retry"));
}

#[test]
fn test_enqueue_then_status() {
    let home = TempDir::new().unwrap();

    fieldsync(&home)
        .args(["enqueue", "-t", "plot-update", "-p", r#"{"id":"p1","crop":"soy"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queued Plot Update (ID: 1)"));

    let status = json_output(fieldsync(&home).args(["status", "-o", "json"]));
    assert_eq!(status["pending"], 1);
    assert!(home.path().join("fieldsync.db").exists());
}

#[test]
fn test_queue_survives_between_invocations() {
    let home = TempDir::new().unwrap();

    for id in ["f1", "f2"] {
        fieldsync(&home)
            .args(["enqueue", "-t", "farm-update", "-p"])
            .arg(format!(r#"{{"id":"{id}"}}"#))
            .assert()
            .success();
    }
    fieldsync(&home).args(["cancel", "1"]).assert().success();

    let listed = json_output(fieldsync(&home).args(["list", "-o", "json"]));
    assert_eq!(listed["count"], 1);
    assert_eq!(listed["items"][0]["id"], 2);
}

#[test]
fn test_dependency_must_exist() {
    let home = TempDir::new().unwrap();

    fieldsync(&home)
        .args(["enqueue", "-t", "farm-update", "-p", r#"{"id":"f1"}"#, "--depends-on", "7"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("error"))
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_unknown_operation_type() {
    let home = TempDir::new().unwrap();

    fieldsync(&home)
        .args(["enqueue", "-t", "teleport", "-p", "{}"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown operation type"));
}

#[test]
fn test_run_offline_keeps_queue() {
    let home = TempDir::new().unwrap();

    fieldsync(&home)
        .args(["enqueue", "-t", "farm-update", "-p", r#"{"id":"f1"}"#])
        .assert()
        .success();

    let report = json_output(fieldsync(&home).args(["run", "--offline", "-o", "json"]));
    assert_eq!(report["online"], false);

    let status = json_output(fieldsync(&home).args(["status", "-o", "json"]));
    assert_eq!(status["pending"], 1);
    assert!(status["last_sync"].is_null());
}

#[test]
fn test_run_against_unreachable_server() {
    let home = TempDir::new().unwrap();
    std::fs::write(
        home.path().join("config.yaml"),
        "server:\n  base_url: http://127.0.0.1:9\n  probe_timeout_secs: 1\n",
    )
    .unwrap();

    fieldsync(&home)
        .args(["enqueue", "-t", "farm-update", "-p", r#"{"id":"f1"}"#])
        .assert()
        .success();

    fieldsync(&home)
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Offline"));
}

#[test]
fn test_invalid_config_is_reported() {
    let home = TempDir::new().unwrap();
    std::fs::write(home.path().join("config.yaml"), "sync:\n  max_retries: 0\n").unwrap();

    fieldsync(&home)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_inspection_is_visible_in_cache() {
    let home = TempDir::new().unwrap();
    let inspection = json!({
        "local_id": "l1",
        "plot_id": "p1",
        "farm_id": "f1",
        "category": "pest",
        "title": "Aphids",
        "severity": "low",
    })
    .to_string();

    fieldsync(&home)
        .args([
            "enqueue",
            "-t",
            "inspection",
            "-p",
            inspection.as_str(),
        ])
        .assert()
        .success();

    let cached = json_output(
        fieldsync(&home).args(["cache", "show", "inspections", "l1", "-o", "json"]),
    );
    assert_eq!(cached["items"][0]["value"]["sync_status"], "pending");
}

#[test]
fn test_retry_needs_target() {
    let home = TempDir::new().unwrap();

    fieldsync(&home)
        .arg("retry")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--all"));
}
