//! Integration tests for the `pm` binary
//!
//! These only cover failures that happen before any connection is made.

use std::fs;
use std::process::{Command, Output};
use tempfile::TempDir;

fn pm_bin() -> String {
    env!("CARGO_BIN_EXE_pm").to_string()
}

/// Run `pm` with a clean SSH environment plus `env`.
fn run_pm(args: &[&str], env: &[(&str, String)]) -> Output {
    let mut command = Command::new(pm_bin());
    command.args(args).env_remove("RUST_LOG");
    for var in [
        "PM_SSH_USER",
        "PM_SSH_HOST",
        "PM_SSH_PORT",
        "PM_SSH_KEY",
        "PM_SSH_KNOWN_HOSTS",
    ] {
        command.env_remove(var);
    }
    for (key, value) in env {
        command.env(key, value);
    }
    command.output().unwrap()
}

/// Credentials that pass the local checks; nothing listens on port 1.
fn credentials(dir: &TempDir) -> Vec<(&'static str, String)> {
    let key = dir.path().join("id_test");
    fs::copy(
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/keys/id_ed25519"),
        &key,
    )
    .unwrap();
    let known_hosts = dir.path().join("known_hosts");
    fs::write(&known_hosts, "").unwrap();

    vec![
        ("PM_SSH_USER", "deploy".to_string()),
        ("PM_SSH_HOST", "127.0.0.1".to_string()),
        ("PM_SSH_PORT", "1".to_string()),
        ("PM_SSH_KEY", key.display().to_string()),
        ("PM_SSH_KNOWN_HOSTS", known_hosts.display().to_string()),
    ]
}

#[test]
fn test_missing_settings_fail_fast() {
    let dir = TempDir::new().unwrap();
    let manifest = dir.path().join("package.json");
    fs::write(&manifest, r#"{"name": "demo", "ver": "1.0", "targets": []}"#).unwrap();

    let output = run_pm(&["create", manifest.to_str().unwrap()], &[]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("PM_SSH_USER"), "stderr: {}", stderr);
}

#[test]
fn test_missing_key_fails_fast() {
    let dir = TempDir::new().unwrap();
    let mut env = credentials(&dir);
    env.retain(|(k, _)| *k != "PM_SSH_KEY");
    env.push(("PM_SSH_KEY", dir.path().join("nope").display().to_string()));

    let output = run_pm(&["update", "packages.json"], &env);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read SSH key"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_port_rejected() {
    let dir = TempDir::new().unwrap();
    let mut env = credentials(&dir);
    env.retain(|(k, _)| *k != "PM_SSH_PORT");
    env.push(("PM_SSH_PORT", "70000".to_string()));

    let output = run_pm(&["create", "package.json"], &env);
    assert!(!output.status.success());
}

#[test]
fn test_unsupported_manifest_extension() {
    let dir = TempDir::new().unwrap();
    let manifest = dir.path().join("package.toml");
    fs::write(&manifest, "name = 'demo'").unwrap();

    let output = run_pm(
        &["create", manifest.to_str().unwrap()],
        &credentials(&dir),
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("toml"), "stderr: {}", stderr);
}

#[test]
fn test_update_with_unreachable_host_reports_failures() {
    let dir = TempDir::new().unwrap();
    let manifest = dir.path().join("packages.yaml");
    fs::write(&manifest, "packages:\n  - name: app\n    ver: \"1.0\"\n").unwrap();

    let output = run_pm(
        &[
            "update",
            manifest.to_str().unwrap(),
            "--workdir",
            dir.path().to_str().unwrap(),
        ],
        &credentials(&dir),
    );

    // Per-package failures are logged; the batch itself completes
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("0 extracted, 1 failed"), "stderr: {}", stderr);
}
