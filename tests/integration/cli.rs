#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use common::{
    HomeEnvGuard, count_processes_with_arg, is_process_alive, state_entry,
    trading_config_yaml, wait_for_process_exit, wait_for_state, write_config,
    write_looping_worker,
};
use predicates::str::contains;
use tempfile::tempdir;
use tradesup::state::ServiceState;

fn tradesup() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("tradesup"))
}

#[test]
fn install_status_and_uninstall_round_trip() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let script = write_looping_worker(temp.path());
    let config_path = write_config(temp.path(), &trading_config_yaml(&script));
    let config = config_path.to_str().unwrap();

    tradesup()
        .args(["install", "--config", config])
        .assert()
        .success()
        .stdout(contains("Installed 'TradingSystem' (Multi-Asset Trading System)"));

    tradesup()
        .args(["install", "--config", config])
        .assert()
        .failure()
        .stderr(contains("already registered"));

    tradesup()
        .args(["status", "--config", config, "--json"])
        .assert()
        .success()
        .stdout(contains("\"state\": \"stopped\""));

    tradesup()
        .args(["stop", "--config", config])
        .assert()
        .success()
        .stdout(contains("is not running"));

    tradesup()
        .args(["uninstall", "--config", config])
        .assert()
        .success()
        .stdout(contains("Uninstalled 'TradingSystem'"));

    tradesup()
        .args(["uninstall", "--config", config])
        .assert()
        .failure()
        .stderr(contains("is not installed"));

    tradesup()
        .args(["start", "--config", config])
        .assert()
        .failure()
        .stderr(contains("is not installed"));
}

#[test]
fn detached_start_and_stop_manage_one_worker() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let script = write_looping_worker(temp.path());
    let marker = script.to_string_lossy().into_owned();
    let config_path = write_config(temp.path(), &trading_config_yaml(&script));
    let config = config_path.to_str().unwrap();

    tradesup()
        .args(["install", "--config", config])
        .assert()
        .success();

    tradesup()
        .args(["start", "--config", config])
        .assert()
        .success()
        .stdout(contains("Started 'TradingSystem'"));

    let entry = wait_for_state("TradingSystem", ServiceState::Running);
    let worker_pid = entry.worker_pid.expect("worker pid recorded");
    let supervisor_pid = entry.supervisor_pid.expect("supervisor pid recorded");
    assert!(is_process_alive(worker_pid));
    assert!(is_process_alive(supervisor_pid));
    assert_eq!(count_processes_with_arg(&marker), 1);

    tradesup()
        .args(["start", "--config", config])
        .assert()
        .failure()
        .stderr(contains("already running"));
    assert_eq!(count_processes_with_arg(&marker), 1);

    tradesup()
        .args(["status", "--config", config])
        .assert()
        .success()
        .stdout(contains("Running"))
        .stdout(contains(format!("Main PID: {worker_pid}")));

    tradesup()
        .args(["stop", "--config", config])
        .assert()
        .success()
        .stdout(contains("Stopped 'TradingSystem'"));

    wait_for_process_exit(worker_pid);
    wait_for_process_exit(supervisor_pid);
    assert_eq!(count_processes_with_arg(&marker), 0);
    assert_eq!(
        state_entry("TradingSystem").map(|entry| entry.state),
        Some(ServiceState::Stopped)
    );

    tradesup()
        .args(["logs", "--config", config, "--lines", "5"])
        .assert()
        .success()
        .stdout(contains("trading loop started --mode=continuous"));

    tradesup()
        .args(["logs", "--config", config, "--kind", "supervisor"])
        .assert()
        .success()
        .stdout(contains("Supervisor for 'TradingSystem' stopped"));

    tradesup()
        .args(["uninstall", "--config", config])
        .assert()
        .success();
}

#[test]
fn start_reports_failed_pre_start_step() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let config_path = write_config(
        temp.path(),
        r#"service:
  id: "gated"
worker:
  command: "sh"
  args: ["-c", "touch worker-ran; sleep 30"]
pre_start:
  - "test -f ready.flag"
"#,
    );
    let config = config_path.to_str().unwrap();

    tradesup()
        .args(["install", "--config", config])
        .assert()
        .success();

    tradesup()
        .args(["start", "--config", config])
        .assert()
        .failure()
        .stderr(contains("failed to start"))
        .stderr(contains("test -f ready.flag"));
    assert!(!temp.path().join("worker-ran").exists());

    fs::write(temp.path().join("ready.flag"), "").unwrap();
    tradesup()
        .args(["start", "--config", config])
        .assert()
        .success();
    let worker_pid = wait_for_state("gated", ServiceState::Running)
        .worker_pid
        .expect("worker pid recorded");

    tradesup()
        .args(["uninstall", "--config", config])
        .assert()
        .success();
    wait_for_process_exit(worker_pid);
}

#[test]
fn system_mode_refuses_unprivileged_install() {
    if nix::unistd::geteuid().is_root() {
        eprintln!("Skipping system_mode_refuses_unprivileged_install: running as root");
        return;
    }

    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let script = write_looping_worker(temp.path());
    let config_path = write_config(temp.path(), &trading_config_yaml(&script));

    tradesup()
        .args(["--sys", "install", "--config", config_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("requires administrative privilege"));
}

#[test]
fn invalid_log_level_is_rejected() {
    tradesup()
        .args(["--log-level", "loud", "status"])
        .assert()
        .failure()
        .stderr(contains("invalid log level"));
}
