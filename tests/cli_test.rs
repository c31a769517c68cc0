//! CLI contract tests
//!
//! Every command runs against a throwaway state directory.

use assert_cmd::Command;
use claimlink::config::Config;
use claimlink::config_session::Credentials;
use claimlink::store::{DeviceRecord, DeviceStore};
use claimlink::transport::ChatId;
use predicates::prelude::*;
use tempfile::TempDir;

#[allow(deprecated)]
fn claimlink(state_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("claimlink").expect("claimlink binary should be built");
    cmd.env("CLAIMLINK_HARDWARE_ID", "a1b2c3d4e5f6")
        .env_remove("CLAIMLINK_BOT_TOKEN")
        .env_remove("CLAIMLINK_RESUME")
        .env_remove("CLAIMLINK_STATE_DIR")
        .arg("--state-dir")
        .arg(state_dir.path());
    cmd
}

#[test]
fn test_help_lists_commands() {
    let temp_dir = TempDir::new().unwrap();
    claimlink(&temp_dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("inject"))
        .stdout(predicate::str::contains("outbox"));
}

#[test]
fn test_status_unconfigured() {
    let temp_dir = TempDir::new().unwrap();
    claimlink(&temp_dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Device: D4E5F6"))
        .stdout(predicate::str::contains("Not configured"));
}

#[test]
fn test_status_redacts_password() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::for_test(temp_dir.path());
    let mut record = DeviceRecord::new(Credentials {
        ssid: "home".to_string(),
        password: "hunter2".to_string(),
        owner_identity: "@alice".to_string(),
    });
    record.configured = true;
    record.binding.bind_personal(ChatId(7));
    DeviceStore::new(&config).save(&record).unwrap();

    claimlink(&temp_dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("@alice"))
        .stdout(predicate::str::contains("<redacted>"))
        .stdout(predicate::str::contains("hunter2").not());
}

#[test]
fn test_reset() {
    let temp_dir = TempDir::new().unwrap();
    claimlink(&temp_dir)
        .arg("reset")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to reset"));

    let config = Config::for_test(temp_dir.path());
    DeviceStore::new(&config)
        .save(&DeviceRecord::new(Credentials {
            ssid: "home".to_string(),
            password: "hunter2".to_string(),
            owner_identity: "@alice".to_string(),
        }))
        .unwrap();

    claimlink(&temp_dir)
        .arg("reset")
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed"));
    assert!(!config.record_file.exists());
}

#[test]
fn test_inject_then_outbox() {
    let temp_dir = TempDir::new().unwrap();
    claimlink(&temp_dir)
        .args(["inject", "-100", "alice added claimlink_bot", "--sender", "alice", "--kind", "group"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Injected message 1 into group chat -100"));

    claimlink(&temp_dir)
        .args(["outbox", "-n", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Outbox is empty"));
}

#[test]
fn test_inject_unknown_kind_fails() {
    let temp_dir = TempDir::new().unwrap();
    claimlink(&temp_dir)
        .args(["inject", "7", "hi", "--sender", "alice", "--kind", "forum"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown chat kind"));
}

#[test]
fn test_bad_resume_policy_fails() {
    let temp_dir = TempDir::new().unwrap();
    claimlink(&temp_dir)
        .env("CLAIMLINK_RESUME", "sometimes")
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("CLAIMLINK_"));
}

#[test]
fn test_telegram_requires_bot_token() {
    let temp_dir = TempDir::new().unwrap();
    claimlink(&temp_dir)
        .args(["run", "--transport", "telegram"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("CLAIMLINK_BOT_TOKEN"));
}

#[test]
fn test_unknown_subcommand_fails() {
    let temp_dir = TempDir::new().unwrap();
    claimlink(&temp_dir).arg("pair-now").assert().failure();
}
