//! End-to-end tests that exercise the compiled `yank` binary, isolated to a
//! scratch `$YANK_HOME` per test so nothing touches the developer's real
//! pairing record or config.

use std::process::Command;

fn yank_cmd(home: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_yank"));
    cmd.env("YANK_HOME", home);
    cmd.env("HOME", home);
    cmd
}

#[test]
fn status_on_a_fresh_install_reports_unpaired() {
    let dir = tempfile::tempdir().unwrap();
    let output = yank_cmd(dir.path()).arg("status").output().unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("paired: false"), "stdout: {stdout}");
    assert!(stdout.contains("not running in this process"), "stdout: {stdout}");
}

#[test]
fn unpair_on_a_fresh_install_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let output = yank_cmd(dir.path()).arg("unpair").arg("--yes").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("not paired"));
}

#[test]
fn config_prints_defaults_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let output = yank_cmd(dir.path()).arg("config").output().unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["chunk_size"], 1024 * 1024);
    assert_eq!(parsed["sync_text"], true);
}

#[test]
fn config_set_persists_across_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let set = yank_cmd(dir.path()).args(["config", "--set", "chunk_size", "4096"]).output().unwrap();
    assert!(set.status.success(), "stderr: {}", String::from_utf8_lossy(&set.stderr));

    let read_back = yank_cmd(dir.path()).arg("config").output().unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&read_back.stdout).unwrap();
    assert_eq!(parsed["chunk_size"], 4096);
}

#[test]
fn config_rejects_unknown_key_with_usage_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let output = yank_cmd(dir.path()).args(["config", "--set", "not_a_real_key", "1"]).output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn join_with_nothing_listening_fails_with_connection_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let output = yank_cmd(dir.path()).args(["join", "127.0.0.1:1", "000000"]).output().unwrap();
    assert!(!output.status.success());
}
