//! Basic CLI E2E tests.
//!
//! Tests invoke the built binary against a throwaway database and home
//! directory, and verify outputs.

use std::path::Path;
use std::process::Command;

use chrono::{Duration, SecondsFormat, Utc};

/// Run a CLI command and return (code, stdout, stderr).
fn run_cli(home: &Path, args: &[&str]) -> (i32, String, String) {
    let db = home.join("studytrack.db");
    let output = Command::new(env!("CARGO_BIN_EXE_studytrack"))
        .env("HOME", home)
        .env("RUST_LOG", "warn")
        .arg("--db")
        .arg(&db)
        .args(args)
        .output()
        .expect("Failed to execute CLI command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    (code, stdout, stderr)
}

fn run_json(home: &Path, args: &[&str]) -> serde_json::Value {
    let (code, stdout, stderr) = run_cli(home, args);
    assert_eq!(code, 0, "command {args:?} failed: {stderr}");
    serde_json::from_str(&stdout).expect("Failed to parse JSON output")
}

fn ts(offset_minutes: i64) -> String {
    (Utc::now() + Duration::minutes(offset_minutes)).to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[test]
fn test_roster_and_block_lifecycle() {
    let home = tempfile::tempdir().unwrap();
    let home = home.path();

    let activity = run_json(home, &["roster", "add-activity", "Algebra"]);
    let student = run_json(home, &["roster", "add-student", "Sam", "--external-id", "voice-sam"]);
    let activity_id = activity["id"].as_str().unwrap();
    let student_id = student["id"].as_str().unwrap();

    let (start, end) = (ts(60), ts(120));
    let block = run_json(
        home,
        &[
            "block", "assign", "--student", student_id, "--activity", activity_id, "--title",
            "Homework", "--start", &start, "--end", &end,
        ],
    );
    assert_eq!(block["title"], "Homework");

    let listed = run_json(home, &["block", "list", "--student", student_id]);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (overlap_start, overlap_end) = (ts(90), ts(150));
    let (code, _, stderr) = run_cli(
        home,
        &[
            "block", "assign", "--student", student_id, "--activity", activity_id, "--title",
            "Clash", "--start", &overlap_start, "--end", &overlap_end,
        ],
    );
    assert_eq!(code, 1);
    assert!(stderr.contains("conflicts"), "unexpected stderr: {stderr}");

    let block_id = block["id"].as_str().unwrap();
    let (code, stdout, _) = run_cli(home, &["block", "delete", block_id]);
    assert_eq!(code, 0);
    assert!(stdout.contains("block deleted"));
}

#[test]
fn test_presence_and_status() {
    let home = tempfile::tempdir().unwrap();
    let home = home.path();
    run_json(home, &["roster", "add-student", "Ada", "--external-id", "voice-ada"]);

    let joined = run_json(home, &["presence", "join", "voice-ada", "--channel", "lobby"]);
    assert_eq!(joined["action"]["action"], "joined");
    assert_eq!(joined["action"]["classification"]["classification"], "UNSCHEDULED");

    let dropped = run_json(home, &["presence", "join", "nobody"]);
    assert_eq!(dropped["action"]["action"], "dropped");

    let status = run_json(home, &["status"]);
    let rows = status["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "NO_ASSIGNED_TIME");
    assert_eq!(rows[0]["unlinked"].as_array().unwrap().len(), 1);

    let left = run_json(home, &["presence", "leave", "voice-ada"]);
    assert_eq!(left["action"]["closed"].as_array().unwrap().len(), 1);
}

#[test]
fn test_tick_and_sweep_on_empty_schedule() {
    let home = tempfile::tempdir().unwrap();
    let home = home.path();

    let tick = run_json(home, &["tick", "--since-minutes", "5"]);
    assert!(tick["windows"].as_array().unwrap().is_empty());

    let sweep = run_json(home, &["sweep"]);
    assert_eq!(sweep["no_shows"], 0);
    assert_eq!(sweep["reminders"], 0);
}

#[test]
fn test_config_get_set() {
    let home = tempfile::tempdir().unwrap();
    let home = home.path();

    let (code, stdout, _) = run_cli(home, &["config", "get", "compliance.no_show_delay_minutes"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "15");

    let (code, _, _) = run_cli(home, &["config", "set", "compliance.no_show_delay_minutes", "20"]);
    assert_eq!(code, 0);
    let (_, stdout, _) = run_cli(home, &["config", "get", "compliance.no_show_delay_minutes"]);
    assert_eq!(stdout.trim(), "20");

    let (code, _, stderr) = run_cli(home, &["config", "set", "monitor.chunk_size", "0"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("chunk_size"));

    let (code, _, _) = run_cli(home, &["config", "get", "no.such.key"]);
    assert_eq!(code, 1);
}

#[test]
fn test_malformed_config_is_reported() {
    let home = tempfile::tempdir().unwrap();
    let home = home.path();
    let config_dir = home.join(".config").join("studytrack");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.toml"),
        "[compliance]\non_time_grace_minutes = \"five\"\n",
    )
    .unwrap();

    let commands: [&[&str]; 3] = [&["sweep"], &["status"], &["roster", "list"]];
    for args in commands {
        let (code, _, stderr) = run_cli(home, args);
        assert_eq!(code, 1, "command {args:?} should fail on a bad config");
        assert!(stderr.contains("config.toml"), "unexpected stderr: {stderr}");
    }
}
