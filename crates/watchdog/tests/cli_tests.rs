//! CLI integration tests

use std::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_container-tail-watchdog");

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = Command::new(BIN)
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("--marker"), "Should show marker flag");
    assert!(stdout.contains("--stall-timeout"), "Should show stall timeout flag");
    assert!(stdout.contains("--grace"), "Should show grace flag");
    assert!(stdout.contains("--cooldown"), "Should show cooldown flag");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = Command::new(BIN)
        .arg("--version")
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("container-tail-watchdog"), "Should show binary name");
}

#[test]
fn test_invalid_flag_fails() {
    let output = Command::new(BIN)
        .args(["--check-interval", "often"])
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
}
