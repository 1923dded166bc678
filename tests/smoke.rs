//! Smoke tests -- verify the binary runs and its subcommands behave.

use assert_cmd::Command;
use predicates::prelude::*;

fn machinewatch() -> Command {
    let mut cmd = Command::cargo_bin("machinewatch").unwrap();
    cmd.env_remove("MACHINEWATCH_CONFIG").env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_cli_help() {
    machinewatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Streaming anomaly detection"));
}

#[test]
fn test_cli_version() {
    machinewatch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("machinewatch"));
}

#[test]
fn test_run_subcommand_exists() {
    machinewatch().args(["run", "--help"]).assert().success();
}

#[test]
fn test_config_prints_defaults() {
    machinewatch()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("min_training_samples = 30"))
        .stdout(predicate::str::contains("contamination = 0.15"));
}

#[test]
fn test_config_file_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("machinewatch.toml");
    std::fs::write(&path, "[engine]\nmin_training_samples = 50\n").unwrap();
    machinewatch()
        .args(["--config", path.to_str().unwrap(), "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("min_training_samples = 50"));
}

#[test]
fn test_invalid_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[model]\ncontamination = 2.0\n").unwrap();
    machinewatch()
        .args(["--config", path.to_str().unwrap(), "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("contamination"));
}

#[test]
fn test_unreadable_env_config_warns_and_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[engine\n").unwrap();
    machinewatch()
        .env("MACHINEWATCH_CONFIG", &path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("min_training_samples = 30"))
        .stderr(predicate::str::contains("could not be loaded"));
}

#[test]
fn test_simulate_prints_readings() {
    let output = machinewatch()
        .args([
            "simulate",
            "--ticks",
            "2",
            "--machines",
            "3",
            "--interval-ms",
            "1",
            "--seed",
            "4",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 6);
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["machine_id"], "MACHINE_001");
    assert!(first["temperature"].is_number());
}

#[test]
fn test_inspect_model_missing_file() {
    machinewatch()
        .args(["inspect-model", "/nonexistent/M1.model.json"])
        .assert()
        .failure();
}
