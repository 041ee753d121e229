//! Integration tests for the runway binary.
//!
//! Every command runs inside a fresh temporary directory so a stray
//! `runway.toml` or `.env` in the checkout cannot change the outcome.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn runway(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("runway");
    cmd.current_dir(dir.path())
        .env_remove("RUNWAY_CONFIG")
        .env_remove("RUNWAY_DB_PATH")
        .env_remove("RUNWAY_PROJECTS_ROOT")
        .env_remove("RUNWAY_PORT")
        .env_remove("RUNWAY_IMAGE")
        .env_remove("RUNWAY_LOG");
    cmd
}

fn workspace() -> TempDir {
    TempDir::new().unwrap()
}

// =============================================================================
// Help and version
// =============================================================================

#[test]
fn test_help_lists_commands() {
    let dir = workspace();
    runway(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("reconcile"))
        .stdout(predicate::str::contains("policy"));
}

#[test]
fn test_version() {
    let dir = workspace();
    runway(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_serve_help_shows_overrides() {
    let dir = workspace();
    runway(&dir)
        .args(["serve", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--port"))
        .stdout(predicate::str::contains("--projects-root"))
        .stdout(predicate::str::contains("--dev"));
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_config_prints_defaults() {
    let dir = workspace();
    runway(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("python:3.11-slim"))
        .stdout(predicate::str::contains("[server]"))
        .stdout(predicate::str::contains("[policy"));
}

#[test]
fn test_config_reads_runway_toml() {
    let dir = workspace();
    fs::write(
        dir.path().join("runway.toml"),
        "[container]\nimage = \"node:20-slim\"\n",
    )
    .unwrap();

    runway(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("node:20-slim"));
}

#[test]
fn test_config_env_overrides_file() {
    let dir = workspace();
    fs::write(
        dir.path().join("runway.toml"),
        "[container]\nimage = \"node:20-slim\"\n",
    )
    .unwrap();

    runway(&dir)
        .env("RUNWAY_IMAGE", "rust:1-slim")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("rust:1-slim"))
        .stdout(predicate::str::contains("node:20-slim").not());
}

#[test]
fn test_config_validate_rejects_bad_timeouts() {
    let dir = workspace();
    fs::write(
        dir.path().join("runway.toml"),
        "[exec]\ndefault_timeout_secs = 600\nmax_timeout_secs = 60\n",
    )
    .unwrap();

    runway(&dir)
        .args(["config", "--validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_timeout_secs"));
}

#[test]
fn test_missing_explicit_config_fails() {
    let dir = workspace();
    runway(&dir)
        .args(["--config", "nope.toml", "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_invalid_port_env_fails() {
    let dir = workspace();
    runway(&dir)
        .env("RUNWAY_PORT", "eighty")
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("RUNWAY_PORT"));
}

// =============================================================================
// Policy
// =============================================================================

#[test]
fn test_policy_allows_requirements_install() {
    let dir = workspace();
    runway(&dir)
        .args(["policy", "check", "pip", "install", "-r", "requirements.txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("allowed"));
}

#[test]
fn test_policy_allows_python_script() {
    let dir = workspace();
    runway(&dir)
        .args(["policy", "check", "python", "app.py"])
        .assert()
        .success();
}

#[test]
fn test_policy_rejects_parent_traversal() {
    let dir = workspace();
    runway(&dir)
        .args(["policy", "check", "pip", "install", "-r", "../secrets.txt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("rejected"));
}

#[test]
fn test_policy_rejects_unlisted_command() {
    let dir = workspace();
    runway(&dir)
        .args(["policy", "check", "bash"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("bash"));
}

#[test]
fn test_policy_rejects_absolute_cwd() {
    let dir = workspace();
    runway(&dir)
        .args(["policy", "check", "--cwd", "/etc", "python", "app.py"])
        .assert()
        .failure();
}

#[test]
fn test_policy_uses_configured_commands() {
    let dir = workspace();
    fs::write(
        dir.path().join("runway.toml"),
        "[policy.commands.npm]\nany_args = true\n",
    )
    .unwrap();

    runway(&dir)
        .args(["policy", "check", "npm", "run", "build"])
        .assert()
        .success();
    runway(&dir)
        .args(["policy", "check", "python", "app.py"])
        .assert()
        .failure();
}
