//! Integration tests for the command line interface
//!
//! Every invocation pins the memory backend so nothing touches a real secret
//! store. Memory entries do not outlive the process, which is why a `get`
//! after a `set` in a separate invocation reports a missing password.

use std::io::Write;
use std::process::{Command, Output, Stdio};

fn binary() -> String {
    std::env::var("CARGO_BIN_EXE_keyring-bridge")
        .unwrap_or_else(|_| "target/debug/keyring-bridge".to_string())
}

fn run(args: &[&str]) -> Output {
    Command::new(binary())
        .args(args)
        .env_remove("KEYRING_BRIDGE_BACKEND")
        .env_remove("KEYRING_BRIDGE_KEYSTORE")
        .output()
        .expect("Failed to execute command")
}

#[test]
fn test_cli_lists_backends_in_probe_order() {
    let output = run(&["backends"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let names: Vec<&str> = stdout.lines().map(|l| l[2..].trim()).collect();
    assert_eq!(
        names,
        [
            "keychain",
            "windows-dpapi",
            "secret-service",
            "kwallet",
            "gnome-keyring",
            "memory"
        ]
    );
    assert_eq!(
        stdout.lines().filter(|l| l.starts_with('*')).count(),
        1,
        "Exactly one backend should be marked: {stdout}"
    );
}

#[test]
fn test_cli_unregistered_backend_fails() {
    let output = run(&["--backend", "does-not-exist", "get", "acme.api", "alice"]);
    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Unregistered keyring backend: 'does-not-exist'"),
        "Unexpected stderr: {stderr}"
    );
}

#[test]
fn test_cli_missing_password_fails() {
    let output = run(&["--backend", "memory", "get", "acme.api", "alice"]);
    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("acme.api"), "Unexpected stderr: {stderr}");
    assert!(output.stdout.is_empty());
}

#[test]
fn test_cli_set_reads_stdin() {
    let mut child = Command::new(binary())
        .args(["--backend", "memory", "set", "acme.api", "alice"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn command");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"p4ssw0rd!\n")
        .unwrap();

    let output = child.wait_with_output().unwrap();
    assert!(
        output.status.success(),
        "Set command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(!String::from_utf8_lossy(&output.stderr).contains("p4ssw0rd!"));
}

#[test]
fn test_cli_backend_from_environment() {
    let output = Command::new(binary())
        .args(["delete", "acme.api", "alice"])
        .env("KEYRING_BRIDGE_BACKEND", "memory")
        .output()
        .expect("Failed to execute command");

    // Bound to memory, so the entry is simply missing.
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No password stored"), "Unexpected stderr: {stderr}");
}

#[test]
fn test_cli_generates_completions() {
    let output = run(&["completions", "bash"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("keyring-bridge"));
}
