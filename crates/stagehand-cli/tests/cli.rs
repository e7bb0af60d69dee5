use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

fn stagehand() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("stagehand"))
}

#[test]
fn help_lists_commands_and_flags() {
    let output = stagehand().arg("--help").output().expect("run help");
    assert!(output.status.success(), "--help should succeed");
    let text = String::from_utf8_lossy(&output.stdout);
    for needle in ["--control", "--pretty", "kernels", "reserve", "eval", "catalog"] {
        assert!(text.contains(needle), "help output should contain '{needle}'");
    }
}

#[test]
fn stop_without_daemon_fails() {
    let tmp = TempDir::new().expect("tmpdir");
    stagehand()
        .args(["--control", tmp.path().join("none.sock").to_str().unwrap(), "stop"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No daemon running"));
}

#[test]
fn reserve_set_requires_a_change() {
    let tmp = TempDir::new().expect("tmpdir");
    stagehand()
        .args(["--control", tmp.path().join("none.sock").to_str().unwrap(), "reserve", "set"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nothing to change"));
}

fn wait_for(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("socket {} never appeared", path.display());
}

#[test]
fn daemon_serves_markup_evaluation_until_stopped() {
    let tmp = TempDir::new().expect("tmpdir");
    let socket = tmp.path().join("control.sock");
    let socket_arg = socket.to_str().unwrap();

    let mut daemon = stagehand()
        .args(["--control", socket_arg, "run", "--deployment", "local-process"])
        .env("RUST_LOG", "warn")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("start daemon");
    wait_for(&socket);

    let assert = stagehand()
        .args([
            "--control", socket_arg, "--json", "eval", "--session", "s1", "--kernel", "Markdown",
            "**bold**",
        ])
        .assert()
        .success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&output).expect("json");
    let html = json["data"]["output"][0]["data"]["text/html"].as_str().unwrap_or_default();
    assert!(html.contains("<strong>bold</strong>"), "unexpected output {output}");

    stagehand()
        .args(["--control", socket_arg, "sessions"])
        .assert()
        .success()
        .stdout(predicate::str::contains("s1"));

    stagehand()
        .args(["--control", socket_arg, "stop"])
        .assert()
        .success();
    let status = daemon.wait().expect("daemon exit");
    assert!(status.success());
    assert!(!socket.exists());
}

#[test]
fn run_reads_dotenv_from_the_working_directory() {
    let tmp = TempDir::new().expect("tmpdir");
    std::fs::write(tmp.path().join(".env"), "STAGEHAND_DEPLOYMENT=mainframe\n").unwrap();
    stagehand()
        .current_dir(tmp.path())
        .env_remove("STAGEHAND_DEPLOYMENT")
        .args(["--control", tmp.path().join("d.sock").to_str().unwrap(), "run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("read configuration"));
    assert!(!tmp.path().join("d.sock").exists());
}
