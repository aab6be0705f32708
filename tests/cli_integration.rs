// Integration tests for CLI commands
// These run the built binary and check exit status and output; none of them
// need a listening orchestrator.

use std::io::Write;
use std::process::Command;
use tempfile::{NamedTempFile, TempDir};

fn cohort() -> Command {
    Command::new(env!("CARGO_BIN_EXE_cohort"))
}

#[test]
fn test_cli_help() {
    let output = cohort().arg("--help").output().expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Federated training orchestrator"));
    assert!(stdout.contains("run"));
    assert!(stdout.contains("simulate"));
    assert!(stdout.contains("validate-job"));
    assert!(stdout.contains("init-config"));
    assert!(stdout.contains("version"));
}

#[test]
fn test_cli_version() {
    let output = cohort().arg("version").output().expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("cohort"));
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_cli_validate_job_accepts_valid_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
name = "keyboard"
target_rounds = 20
initial_parameters = [0.0, 0.0, 0.0]
round_timeout = "45s"

[selection]
strategy = "largest_datasets"
min_participants = 3

[privacy]
epsilon = 4.0
mechanism = {{ mode = "per_round", cost = 0.2 }}
"#
    )
    .unwrap();

    let output = cohort()
        .arg("validate-job")
        .arg(file.path())
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("is valid"));
    assert!(stdout.contains("keyboard"));
}

#[test]
fn test_cli_validate_job_rejects_invalid_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "target_rounds = 5\ninitial_parameters = []").unwrap();

    let output = cohort()
        .arg("validate-job")
        .arg(file.path())
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"));
}

#[test]
fn test_cli_init_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    let output = cohort()
        .args(["init-config", "--path"])
        .arg(&path)
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("[orchestrator]"));
    assert!(contents.contains("master_secret"));

    // Second run without --force refuses to clobber the secret
    let output = cohort()
        .args(["init-config", "--path"])
        .arg(&path)
        .output()
        .expect("Failed to execute command");
    assert!(!output.status.success());
}

#[test]
fn test_cli_run_with_unreadable_config() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "this is not toml [").unwrap();

    let output = cohort()
        .args(["run", "--config"])
        .arg(file.path())
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to parse config file"));
}

#[test]
fn test_cli_simulate_prints_json_report() {
    let output = cohort()
        .args(["simulate", "--devices", "3", "--rounds", "2", "--dimension", "4"])
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["status"]["state"], "completed");
    assert!(report["rounds"].as_array().unwrap().len() <= 2);
    assert_eq!(report["final_model"].as_array().unwrap().len(), 4);
}
