//! CLI integration tests

use std::process::Command;

fn sift(args: &[&str]) -> std::process::Output {
    Command::new("cargo")
        .args(["run", "-q", "-p", "sift-cli", "--"])
        .args(args)
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = sift(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Active-learning screening"), "Should show app name");
    for command in ["simulate", "worker", "enqueue", "status", "reset"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = sift(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("sift"), "Should show binary name");
}

#[test]
fn test_worker_help() {
    let output = sift(&["worker", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Worker help should succeed");
    assert!(stdout.contains("--simulation"));
    assert!(stdout.contains("--project-id"));
    assert!(stdout.contains("--launch-id"));
    assert!(stdout.contains("--manager"));
}

#[test]
fn test_simulate_help() {
    let output = sift(&["simulate", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Simulate help should succeed");
    assert!(stdout.contains("--stopping"));
}

#[test]
fn test_global_options() {
    let output = sift(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("--format"), "Should show format option");
    assert!(stdout.contains("table"), "Should show table format");
    assert!(stdout.contains("json"), "Should show json format");
    assert!(stdout.contains("SIFT_MANAGER"), "Should show env var");
}

#[test]
fn test_invalid_stopping_rule() {
    let output = sift(&["simulate", "/tmp/none", "--stopping", "forever"]);
    assert!(!output.status.success(), "Unknown stopping rule should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--stopping"), "Should name the bad option");
}

#[test]
fn test_missing_argument() {
    let output = sift(&["enqueue"]);
    assert!(!output.status.success(), "Missing argument should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("required") || stderr.contains("error"),
        "Should show error about missing argument"
    );
}

#[test]
fn test_simulate_missing_project_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let missing = dir.path().join("absent");
    let output = sift(&["simulate", missing.to_str().unwrap()]);

    assert!(!output.status.success(), "Missing project should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Simulation failed"));
}
