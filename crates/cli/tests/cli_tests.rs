//! CLI integration tests

use std::process::{Command, Output};

fn kcm(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kcm"))
        .args(args)
        .env_remove("KCM_CLUSTER")
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = kcm(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(
        stdout.contains("Kubernetes Cluster Manager"),
        "Should show app name"
    );
    assert!(stdout.contains("node"), "Should show node command");
    assert!(stdout.contains("cluster"), "Should show cluster command");
    assert!(stdout.contains("--cluster"), "Should show cluster flag");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = kcm(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("kcm"), "Should show binary name");
}

#[test]
fn test_node_help_lists_lifecycle_commands() {
    let output = kcm(&["node", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    for command in ["create", "delete", "glass", "list", "purpose"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
}

#[test]
fn test_node_create_help() {
    let output = kcm(&["node", "create", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--role"));
    assert!(stdout.contains("--machine-config"));
    assert!(stdout.contains("--node-config"));
    assert!(stdout.contains("--secret-mount"));
    assert!(stdout.contains("--cloudflare-zone-id"));
}

#[test]
fn test_cluster_reconcile_help() {
    let output = kcm(&["cluster", "reconcile", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--fix-tags"));
}

#[test]
fn test_invalid_role_rejected() {
    let output = kcm(&[
        "node",
        "create",
        "alpha-worker-1",
        "--role",
        "database",
        "--cloudflare-zone-id",
        "zone",
        "--cloudflare-api-token",
        "token",
    ]);

    assert!(!output.status.success(), "Unknown role should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("database"));
}

#[test]
fn test_cloudflare_flags_must_be_paired() {
    let output = kcm(&["node", "delete", "alpha-worker-1", "--cloudflare-zone-id", "zone"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--cloudflare-api-token"));
}

#[test]
fn test_missing_subcommand_fails() {
    let output = kcm(&["node"]);
    assert!(!output.status.success());
}
