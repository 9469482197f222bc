//! CLI acceptance tests
//!
//! Drive the real binary against a temp-dir database via an explicit config
//! file, keeping the tests independent of the user's XDG directories.

use assert_cmd::Command;
use std::path::PathBuf;
use tempfile::TempDir;

fn write_config(dir: &TempDir) -> PathBuf {
    let db_path = dir.path().join("data.db");
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        format!("[database]\npath = \"{}\"\n", db_path.display()),
    )
    .unwrap();
    config_path
}

fn streamwatch(config: &PathBuf) -> Command {
    let mut cmd = Command::cargo_bin("streamwatch").unwrap();
    cmd.args(["--config", config.to_str().unwrap()]);
    cmd
}

#[test]
fn test_help() {
    Command::cargo_bin("streamwatch")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("activity monitor"));
}

#[test]
fn test_servers_add_list_verify_remove() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    streamwatch(&config)
        .args([
            "servers",
            "add",
            "den",
            "http://plex.local:32400",
            "--server-type",
            "plex",
            "--api-key",
            "token",
        ])
        .assert()
        .success()
        .stdout(predicates::str::contains("Registered den"));

    streamwatch(&config)
        .args(["servers", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("den"))
        .stdout(predicates::str::contains("no"));

    streamwatch(&config)
        .args(["servers", "verify", "1"])
        .assert()
        .success();

    streamwatch(&config)
        .args(["servers", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("yes"));

    streamwatch(&config)
        .args(["servers", "remove", "1"])
        .assert()
        .success();

    streamwatch(&config)
        .args(["servers", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No servers registered"));
}

#[test]
fn test_history_and_status_on_empty_database() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    streamwatch(&config)
        .args(["history"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No sessions found"));

    streamwatch(&config)
        .args(["status"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No servers registered"));

    streamwatch(&config)
        .args(["cleanup"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Nothing to clean up"));
}
