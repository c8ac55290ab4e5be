//! Binary-level tests for the taskly command line surface.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn taskly() -> Command {
    Command::cargo_bin("taskly").expect("binary should build")
}

#[test]
fn help_exits_zero() {
    taskly()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("concurrently"));
}

#[test]
fn version_flag_is_lowercase_v() {
    taskly()
        .arg("-v")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn single_echo_succeeds() {
    taskly()
        .arg("echo hello-from-taskly")
        .assert()
        .success()
        .stdout(predicate::str::contains("hello-from-taskly"));
}

#[test]
fn failing_task_exits_one() {
    taskly().arg("exit 3").assert().code(1);
}

#[test]
fn no_commands_and_no_config_exits_one() {
    let temp = TempDir::new().unwrap();
    taskly()
        .current_dir(temp.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no commands"));
}

#[test]
fn names_count_mismatch_is_a_validation_error() {
    taskly()
        .args(["-n", "only-one", "echo a", "echo b"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("names"));
}

#[test]
fn named_tasks_use_bracket_prefixes_when_colors_are_forced() {
    taskly()
        .args(["-n", "web", "echo ready"])
        .env("FORCE_COLOR", "1")
        .env_remove("NO_COLOR")
        .assert()
        .success()
        .stdout(predicate::str::contains("[web]"))
        .stdout(predicate::str::contains("ready"));
}

#[test]
fn no_color_passes_output_through_unprefixed() {
    taskly()
        .args(["-n", "web", "echo plain-line"])
        .env("NO_COLOR", "1")
        .assert()
        .success()
        .stdout(predicate::str::contains("plain-line"))
        .stdout(predicate::str::contains("[web]").not());
}

#[test]
fn kill_others_flag_fails_fast() {
    let start = std::time::Instant::now();
    taskly()
        .args(["-k", "exit 1", "sleep 5"])
        .assert()
        .code(1);
    assert!(
        start.elapsed() < std::time::Duration::from_secs(4),
        "kill-others run should not wait out the sleep"
    );
}

#[test]
fn config_file_tasks_run_without_positional_commands() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("taskly.config.json"),
        r#"{"tasks": {"greet": {"command": "echo from-config"}}}"#,
    )
    .unwrap();
    taskly()
        .current_dir(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("from-config"));
}

#[test]
fn explicit_config_flag_is_honored() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("custom.json");
    std::fs::write(&path, r#"{"tasks": {"one": {"command": "echo custom-file"}}}"#).unwrap();
    taskly()
        .current_dir(temp.path())
        .arg("--config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("custom-file"));
}

#[test]
fn environment_names_apply_with_lowest_precedence() {
    taskly()
        .args(["-n", "cli-name", "echo hi"])
        .env("TASKLY_NAMES", "env-name")
        .env("FORCE_COLOR", "1")
        .env_remove("NO_COLOR")
        .assert()
        .success()
        .stdout(predicate::str::contains("[cli-name]"))
        .stdout(predicate::str::contains("[env-name]").not());
}

#[test]
fn unknown_config_keys_are_rejected() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("taskly.config.json"),
        r#"{"maxConcurrent": 4}"#,
    )
    .unwrap();
    taskly()
        .current_dir(temp.path())
        .arg("echo hi")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn verbose_prints_statistics_to_stderr() {
    taskly()
        .args(["-V", "echo stats"])
        .assert()
        .success()
        .stderr(predicate::str::contains("completed"));
}
