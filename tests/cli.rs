//! End-to-end tests for the keel CLI.
//!
//! Every test runs the compiled binary against a topology in its own temp
//! directory, with keel's state directory redirected there too. None of the
//! commands exercised here contact a host.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

const TOPOLOGY: &str = r#"{
    "hosts": {
        "app": {"address": "10.0.0.2", "user": "deploy"},
        "observability": {"address": "10.0.0.3", "user": "deploy"}
    },
    "admin": {"user": "deploy", "groups": ["sudo"]},
    "secrets": [
        {"name": "DB_PASSWORD", "format": "alphanumeric", "minLength": 32},
        {"name": "APP_KEY", "format": "app-key"}
    ],
    "app": {
        "url": "https://shop.example.com",
        "database": {"name": "shop", "role": "shop", "passwordSecret": "DB_PASSWORD"},
        "release": {"deployPath": "/srv/shop"},
        "source": {"type": "git", "repository": "https://example.com/shop.git", "reference": "main"}
    },
    "services": [
        {"name": "postgres", "tier": "data", "actions": [{"type": "postgres_password", "role": "shop", "secret": "DB_PASSWORD"}]}
    ]
}"#;

/// Fresh keel command with config and state isolated in `tempdir`.
#[allow(deprecated)]
fn keel_cmd(tempdir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("keel").unwrap();
    cmd.env("KEEL_HOME", tempdir.path().join("state"));
    cmd.env_remove("KEEL_CONFIG");
    cmd.env_remove("KEEL_LOG");
    cmd.current_dir(tempdir.path());
    cmd
}

fn with_topology() -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("keel.json"), TOPOLOGY).unwrap();
    temp
}

fn json_stdout(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be a JSON envelope")
}

#[test]
fn test_plan_lists_all_phases_in_order() {
    let temp = with_topology();

    let output = keel_cmd(&temp).arg("plan").output().unwrap();
    assert!(output.status.success());

    let body = json_stdout(&output);
    assert_eq!(body["success"], true);
    let ids: Vec<&str> = body["data"]["phases"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    assert_eq!(
        ids,
        [
            "user-setup",
            "ssh",
            "secrets",
            "observability-prep",
            "app-prep",
            "deploy",
            "observability",
            "verification"
        ]
    );
    assert_eq!(body["data"]["topology"], "keel");
}

#[test]
fn test_plan_marks_skipped_phases() {
    let temp = with_topology();

    let output = keel_cmd(&temp)
        .args(["plan", "--skip", "ssh"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let body = json_stdout(&output);
    let ssh = &body["data"]["phases"][1];
    assert_eq!(ssh["id"], "ssh");
    assert_eq!(ssh["skipped"], true);
    assert_eq!(body["data"]["phases"][0]["skipped"], false);
}

#[test]
fn test_plan_rejects_unknown_phase() {
    let temp = with_topology();

    keel_cmd(&temp)
        .args(["plan", "--skip", "firewall"])
        .assert()
        .failure();
}

#[test]
fn test_dry_run_touches_nothing() {
    let temp = with_topology();

    let output = keel_cmd(&temp)
        .args(["run", "--dry-run", "--skip-observability"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let body = json_stdout(&output);
    assert_eq!(body["data"]["status"], "succeeded");
    assert_eq!(body["data"]["dryRun"], true);
    assert_eq!(body["data"]["phases"][0]["status"], "dry_run");
    assert_eq!(body["data"]["phases"][6]["status"], "skipped");
    assert!(
        !temp.path().join("state").join("keel").join("secrets.env").exists(),
        "a dry run must not write the secrets file"
    );
}

#[test]
fn test_missing_config_is_a_validation_failure() {
    let temp = TempDir::new().unwrap();

    keel_cmd(&temp)
        .arg("plan")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("config.missing_key"));
}

#[test]
fn test_config_flag_overrides_default_location() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("shop.json");
    fs::write(&path, TOPOLOGY).unwrap();

    keel_cmd(&temp)
        .arg("--config")
        .arg(&path)
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"topology\": \"shop\""));
}

#[test]
fn test_invalid_topology_reports_every_problem() {
    let temp = TempDir::new().unwrap();
    let broken = TOPOLOGY.replace("/srv/shop", "srv/shop").replace(
        "\"passwordSecret\": \"DB_PASSWORD\"",
        "\"passwordSecret\": \"MISSING\"",
    );
    fs::write(temp.path().join("keel.json"), broken).unwrap();

    let output = keel_cmd(&temp).arg("plan").output().unwrap();
    assert_eq!(output.status.code(), Some(2));

    let body = json_stdout(&output);
    assert_eq!(body["error"]["code"], "config.invalid_value");
    let problems = body["error"]["details"]["problems"].as_array().unwrap();
    assert!(problems.len() >= 2);
}

#[test]
fn test_secrets_generate_then_keep() {
    let temp = with_topology();

    let output = keel_cmd(&temp)
        .args(["secrets", "generate"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let body = json_stdout(&output);
    assert_eq!(body["data"]["generated"].as_array().unwrap().len(), 2);

    let path = temp.path().join("state").join("keel").join("secrets.env");
    let content = fs::read_to_string(&path).unwrap();
    assert!(content.starts_with("# keel-secrets version=1"));
    assert!(content.contains("DB_PASSWORD="));

    let output = keel_cmd(&temp)
        .args(["secrets", "generate"])
        .output()
        .unwrap();
    let body = json_stdout(&output);
    assert!(body["data"].get("generated").map_or(true, |g| g.as_array().unwrap().is_empty()));
    assert_eq!(body["data"]["kept"].as_array().unwrap().len(), 2);
    assert_eq!(fs::read_to_string(&path).unwrap(), content);
}

#[test]
fn test_secrets_list_masks_values() {
    let temp = with_topology();
    keel_cmd(&temp).args(["secrets", "generate"]).assert().success();

    let path = temp.path().join("state").join("keel").join("secrets.env");
    let content = fs::read_to_string(&path).unwrap();
    let db_value = content
        .lines()
        .find_map(|l| l.strip_prefix("DB_PASSWORD="))
        .unwrap()
        .to_string();

    keel_cmd(&temp)
        .args(["secrets", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("DB_PASSWORD"))
        .stdout(predicate::str::contains(db_value).not());
}

#[test]
fn test_secrets_validate_flags_placeholders() {
    let temp = with_topology();
    let state = temp.path().join("state").join("keel");
    fs::create_dir_all(&state).unwrap();
    fs::write(
        state.join("secrets.env"),
        "# keel-secrets version=3 updated=2026-01-01T00:00:00Z\nDB_PASSWORD=CHANGE_ME\n",
    )
    .unwrap();

    let output = keel_cmd(&temp)
        .args(["secrets", "validate"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let body = json_stdout(&output);
    assert_eq!(body["data"]["valid"], false);
    let names: Vec<&str> = body["data"]["findings"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"DB_PASSWORD"));
    assert!(names.contains(&"APP_KEY"));
}

#[test]
fn test_rotate_unknown_secret_is_not_found() {
    let temp = with_topology();

    keel_cmd(&temp)
        .args(["rotate", "NOPE", "--dry-run"])
        .assert()
        .code(4)
        .stdout(predicate::str::contains("secrets.unknown"));
}

#[test]
fn test_rotate_dry_run_lists_consumers() {
    let temp = with_topology();

    let output = keel_cmd(&temp)
        .args(["rotate", "DB_PASSWORD", "--dry-run"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let body = json_stdout(&output);
    assert_eq!(body["data"]["dryRun"], true);
    assert_eq!(body["data"]["services"][0]["service"], "postgres");
}

#[test]
fn test_deploy_dry_run_shows_steps() {
    let temp = with_topology();

    keel_cmd(&temp)
        .args(["deploy", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("https://example.com/shop.git@main"));
}
