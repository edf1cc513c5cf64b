use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn archiver(home: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("chat-archive");
    cmd.current_dir(home)
        .env("HOME", home)
        .env("CHAT_ARCHIVE_CONFIG_PATH", home.join("config.toml"))
        .env("CHAT_ARCHIVE_LOG", "warn");
    cmd
}

const RECORD: &str = r#"{"id":"m1","chat_id":"alice@c.us","sender":"alice@c.us","timestamp":1700000000,"time":"2023-11-14 22:13:20","body":"hi","media":false,"from_me":false}"#;

#[test]
fn status_on_empty_archive_reports_idle() {
    let tmp = tempdir().expect("tempdir");
    let backup = tmp.path().join("backup");

    archiver(tmp.path())
        .arg("status")
        .arg("--backup-dir")
        .arg(&backup)
        .assert()
        .success()
        .stdout(predicate::str::contains("archiver=idle"))
        .stdout(predicate::str::contains("chat_logs=0 messages=0"))
        .stdout(predicate::str::contains("sweep_completed=false"));
}

#[test]
fn status_json_reports_message_counts() {
    let tmp = tempdir().expect("tempdir");
    let backup = tmp.path().join("backup");
    fs::create_dir_all(backup.join("chats/Alice")).expect("mkdir");
    fs::write(backup.join("chats/Alice/history.log"), format!("{RECORD}\n")).expect("write log");

    archiver(tmp.path())
        .env("CHAT_ARCHIVE_BACKUP_DIR", &backup)
        .arg("status")
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"command\": \"status\""))
        .stdout(predicate::str::contains("chat Alice: messages=1 last=2023-11-14 22:13:20"));
}

#[test]
fn invalid_config_is_reported_with_code() {
    let tmp = tempdir().expect("tempdir");
    fs::write(tmp.path().join("config.toml"), "page_size = 0\n").expect("write config");

    archiver(tmp.path())
        .arg("status")
        .arg("--backup-dir")
        .arg(tmp.path().join("backup"))
        .assert()
        .code(2)
        .stdout(predicate::str::contains("E004_CONFIG_INVALID"));
}

#[test]
fn verify_detects_and_repairs_torn_tail() {
    let tmp = tempdir().expect("tempdir");
    let backup = tmp.path().join("backup");
    let log = backup.join("chats/Alice/history.log");
    fs::create_dir_all(log.parent().expect("parent")).expect("mkdir");
    fs::write(&log, format!("{RECORD}\n{{\"id\":\"m2\",\"chat")).expect("write log");

    archiver(tmp.path())
        .arg("verify")
        .arg("--backup-dir")
        .arg(&backup)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("torn trailing record"));

    archiver(tmp.path())
        .arg("verify")
        .arg("--repair")
        .arg("--backup-dir")
        .arg(&backup)
        .assert()
        .success()
        .stdout(predicate::str::contains("repaired torn tail"));

    assert_eq!(fs::read_to_string(&log).expect("read log"), format!("{RECORD}\n"));
}

#[test]
fn verify_flags_unknown_environment_keys() {
    let tmp = tempdir().expect("tempdir");

    archiver(tmp.path())
        .env("CHAT_ARCHIVE_NOT_A_SETTING", "1")
        .arg("verify")
        .arg("--backup-dir")
        .arg(tmp.path().join("backup"))
        .assert()
        .code(2)
        .stdout(predicate::str::contains(
            "unknown environment variable CHAT_ARCHIVE_NOT_A_SETTING",
        ));
}

#[test]
fn resync_reopens_backfill() {
    let tmp = tempdir().expect("tempdir");
    let backup = tmp.path().join("backup");
    let cursor = backup.join("state/backfill-cursor.json");
    fs::create_dir_all(cursor.parent().expect("parent")).expect("mkdir");
    fs::write(
        &cursor,
        r#"{
  "schema_version": 1,
  "sweep_completed": true,
  "completed_at_epoch_secs": 1700000000,
  "chats": {
    "alice@c.us": { "completed": true, "messages_written": 3 },
    "bob@c.us": { "completed": false, "last_error": "timeout" }
  }
}"#,
    )
    .expect("write cursor");

    archiver(tmp.path())
        .arg("resync")
        .arg("--failed-only")
        .arg("--backup-dir")
        .arg(&backup)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 unfinished chat(s)"));

    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&cursor).expect("read")).expect("json");
    assert_eq!(state["sweep_completed"], false);
    assert_eq!(state["chats"]["alice@c.us"]["completed"], true);

    archiver(tmp.path())
        .arg("resync")
        .arg("--backup-dir")
        .arg(&backup)
        .assert()
        .success();

    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&cursor).expect("read")).expect("json");
    assert!(state["chats"].as_object().expect("chats").is_empty());
}

#[test]
fn corrupt_cursor_is_reported_as_state_error() {
    let tmp = tempdir().expect("tempdir");
    let backup = tmp.path().join("backup");
    fs::create_dir_all(backup.join("state")).expect("mkdir");
    fs::write(backup.join("state/backfill-cursor.json"), "{not json").expect("write");

    archiver(tmp.path())
        .arg("verify")
        .arg("--backup-dir")
        .arg(&backup)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("E005_STATE_CORRUPT"));
}

#[test]
fn run_against_unreachable_bridge_reports_source_unavailable() {
    let tmp = tempdir().expect("tempdir");
    let backup = tmp.path().join("backup");

    archiver(tmp.path())
        .env("CHAT_ARCHIVE_BRIDGE_URL", "http://127.0.0.1:1")
        .env("CHAT_ARCHIVE_RETRY_MAX_ATTEMPTS", "1")
        .arg("run")
        .arg("--backup-dir")
        .arg(&backup)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("E002_SOURCE_UNAVAILABLE"))
        .stdout(predicate::str::contains("source unavailable"));

    let audit = fs::read_to_string(backup.join("logs/audit.log")).expect("audit log");
    assert!(audit.contains("\"phase\":\"session\""));
    assert!(audit.contains("\"status\":\"failed\""));
}
