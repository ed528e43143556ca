//! Command-line behavior of `gatewayd` that does not need a network.

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &tempfile::TempDir, json: &str) -> std::path::PathBuf {
    let path = dir.path().join("gateway.json");
    std::fs::write(&path, json).unwrap();
    path
}

#[test]
fn test_help_runs() {
    Command::cargo_bin("gatewayd")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--stop-timeout"));
}

#[test]
fn test_help_describes_shutdown() {
    Command::cargo_bin("gatewayd")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("interrupted (resumable)"))
        .stdout(predicate::str::contains("paused").not());
}

#[test]
fn test_version_runs() {
    Command::cargo_bin("gatewayd")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn test_config_is_required() {
    Command::cargo_bin("gatewayd")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("--config"));
}

#[test]
fn test_missing_config_file_fails() {
    let tmp = tempfile::tempdir().unwrap();
    Command::cargo_bin("gatewayd")
        .unwrap()
        .args(["--check", "--config"])
        .arg(tmp.path().join("nope.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read configuration file"));
}

#[test]
fn test_stop_timeout_accepts_human_durations() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_config(&tmp, "{}");
    for timeout in ["500ms", "10s", "1min"] {
        Command::cargo_bin("gatewayd")
            .unwrap()
            .args(["--check", "--stop-timeout", timeout, "--config"])
            .arg(&path)
            .assert()
            .success();
    }
    Command::cargo_bin("gatewayd")
        .unwrap()
        .args(["--check", "--stop-timeout", "soon", "--config"])
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn test_check_counts_services() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_config(
        &tmp,
        r#"{
            "data": {
                "localAgents": [
                    {"name": "r66_server", "protocol": "r66", "address": "127.0.0.1:0",
                     "protoConfig": {"serverPassword": "sesame"}},
                    {"name": "sftp_server", "protocol": "sftp", "address": "127.0.0.1:0"}
                ],
                "clients": [{"name": "r66_client", "protocol": "r66-tls"}]
            }
        }"#,
    );
    Command::cargo_bin("gatewayd")
        .unwrap()
        .args(["--check", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration OK: 2 service(s)"));
}

#[test]
fn test_check_rejects_bad_proto_config() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_config(
        &tmp,
        r#"{
            "data": {
                "localAgents": [
                    {"name": "r66_server", "protocol": "r66", "address": "127.0.0.1:0",
                     "protoConfig": {"blockSize": "big"}}
                ]
            }
        }"#,
    );
    Command::cargo_bin("gatewayd")
        .unwrap()
        .args(["--check", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration for server"));
}

#[test]
fn test_unknown_explicit_server_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_config(&tmp, r#"{"servers": ["ghost"]}"#);
    Command::cargo_bin("gatewayd")
        .unwrap()
        .args(["--check", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown server"));
}

#[test]
fn test_nothing_to_run_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_config(&tmp, "{}");
    Command::cargo_bin("gatewayd")
        .unwrap()
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("nothing to run"));
}
