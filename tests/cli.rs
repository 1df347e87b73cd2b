//! Exit codes of the installed binary

use std::process::{Command, Output};

fn oauth_cli(dir: &tempfile::TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_oauth-cli"))
        .arg("--store")
        .arg(dir.path().join("tokens.json"))
        .arg("--config")
        .arg(dir.path().join("config.json"))
        .arg("--env-file")
        .arg(dir.path().join(".env"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

#[test]
fn test_no_provider_prints_usage_and_exits_1() {
    let dir = tempfile::tempdir().unwrap();
    let output = oauth_cli(&dir, &[]);

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage"));
    assert!(stdout.contains("openai"));
    assert!(stdout.contains("openrouter"));
}

#[test]
fn test_unknown_provider_reports_on_stderr_and_exits_1() {
    let dir = tempfile::tempdir().unwrap();
    let output = oauth_cli(&dir, &["nope"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown provider: nope"));
    assert!(!String::from_utf8_lossy(&output.stdout).contains("Unknown provider"));
}

#[test]
fn test_list_exits_0() {
    let dir = tempfile::tempdir().unwrap();
    let output = oauth_cli(&dir, &["--list"]);

    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("copilot"));
}

#[test]
fn test_malformed_config_exits_1() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.json"), "{oops").unwrap();
    let output = oauth_cli(&dir, &["--list"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Configuration error"));
}
