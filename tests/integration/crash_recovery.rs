#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    path::Path,
    time::{Duration, Instant},
};

use common::{
    HomeEnvGuard, is_process_alive, spawn_supervisor, state_entry, wait_for_lines,
    wait_for_process_exit, wait_for_state, wait_for_supervisor_pid, wait_for_worker_pid,
    write_config,
};
use tempfile::tempdir;
use tradesup::{
    config::{Config, load_config},
    controller::{self, StopOutcome},
    error::SupervisorError,
    registry::Backend,
    state::ServiceState,
    status,
};

fn install(dir: &Path, yaml: &str) -> Config {
    let config_path = write_config(dir, yaml);
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    controller::install(&config, Backend::File).unwrap();
    config
}

#[test]
fn crashing_worker_gives_up_after_restart_budget() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let config = install(
        temp.path(),
        r#"service:
  id: "crasher"
worker:
  command: "sh"
  args: ["-c", "echo run >> runs.log; exit 3"]
restart:
  policy: "on-failure"
  max_restarts: 2
  backoff: "50ms"
  max_backoff: "100ms"
"#,
    );

    let (_stop, handle) = spawn_supervisor(config.clone());
    match handle.join().unwrap() {
        Err(SupervisorError::RestartLimitExceeded { service, attempts }) => {
            assert_eq!(service, "crasher");
            assert_eq!(attempts, 2);
        }
        other => panic!("expected restart limit, got {other:?}"),
    }

    let runs = fs::read_to_string(temp.path().join("runs.log")).unwrap();
    assert_eq!(runs.lines().count(), 3, "initial run plus two restarts");

    let entry = wait_for_state("crasher", ServiceState::Stopped);
    assert_eq!(entry.last_exit_code, Some(3));
    assert_eq!(entry.restarts, 2);
    assert!(
        entry
            .last_error
            .as_deref()
            .is_some_and(|error| error.contains("restart attempts")),
        "{entry:?}"
    );

    let report = status::collect_status(&config).unwrap();
    assert_eq!(report.state, ServiceState::Stopped);
    assert!(report.last_error.is_some());
}

#[test]
fn crashed_worker_is_replaced() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let config = install(
        temp.path(),
        r#"service:
  id: "flaky"
worker:
  command: "sh"
  args: ["-c", "if [ -f crashed ]; then while true; do sleep 1; done; else touch crashed; sleep 1; exit 1; fi"]
restart:
  backoff: "100ms"
"#,
    );

    let (_stop, handle) = spawn_supervisor(config.clone());
    let first = wait_for_worker_pid("flaky", None);
    let second = wait_for_worker_pid("flaky", Some(first));
    assert!(is_process_alive(second));
    assert!(!is_process_alive(first));

    let entry = state_entry("flaky").unwrap();
    assert_eq!(entry.restarts, 1);
    assert_eq!(entry.last_exit_code, Some(1));

    controller::stop(&config).unwrap();
    handle.join().unwrap().unwrap();
    assert!(!is_process_alive(second));
}

#[test]
fn stop_interrupts_restart_backoff() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let config = install(
        temp.path(),
        r#"service:
  id: "slow-backoff"
worker:
  command: "sh"
  args: ["-c", "echo run >> runs.log; exit 1"]
restart:
  backoff: "30s"
  max_backoff: "30s"
"#,
    );

    let (_stop, handle) = spawn_supervisor(config.clone());
    wait_for_lines(&temp.path().join("runs.log"), 1);
    let deadline = Instant::now() + Duration::from_secs(10);
    while state_entry("slow-backoff").and_then(|entry| entry.last_exit_code) != Some(1) {
        assert!(Instant::now() < deadline, "worker exit was never recorded");
        std::thread::sleep(Duration::from_millis(50));
    }

    let started = Instant::now();
    controller::stop(&config).unwrap();
    handle.join().unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let runs = fs::read_to_string(temp.path().join("runs.log")).unwrap();
    assert_eq!(runs.lines().count(), 1, "no restart after stop");
    wait_for_state("slow-backoff", ServiceState::Stopped);
}

#[test]
fn never_policy_leaves_service_stopped() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let config = install(
        temp.path(),
        r#"service:
  id: "one-shot"
worker:
  command: "sh"
  args: ["-c", "exit 4"]
restart:
  policy: "never"
"#,
    );

    let (_stop, handle) = spawn_supervisor(config);
    handle.join().unwrap().unwrap();

    let entry = wait_for_state("one-shot", ServiceState::Stopped);
    assert_eq!(entry.last_exit_code, Some(4));
    assert_eq!(entry.restarts, 0);
}

#[test]
fn failed_pre_start_step_aborts_before_worker_spawns() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let config = install(
        temp.path(),
        r#"service:
  id: "guarded"
worker:
  command: "sh"
  args: ["-c", "touch worker-ran; sleep 30"]
pre_start:
  - "echo checked > first-step"
  - command: "exit 7"
    timeout: "5s"
  - "touch never-runs"
"#,
    );

    let (_stop, handle) = spawn_supervisor(config);
    match handle.join().unwrap() {
        Err(SupervisorError::PreStartFailed { step, reason }) => {
            assert_eq!(step, "exit 7");
            assert!(reason.contains("exit code 7"), "{reason}");
        }
        other => panic!("expected pre-start failure, got {other:?}"),
    }

    assert!(temp.path().join("first-step").exists());
    assert!(!temp.path().join("never-runs").exists());
    assert!(!temp.path().join("worker-ran").exists());

    let entry = wait_for_state("guarded", ServiceState::Stopped);
    assert!(entry.worker_pid.is_none());
    assert!(
        entry
            .last_error
            .as_deref()
            .is_some_and(|error| error.contains("Pre-start step")),
        "{entry:?}"
    );
}

#[test]
fn helpers_of_a_crashed_worker_do_not_survive_restarts() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let config = install(
        temp.path(),
        r#"service:
  id: "forking"
worker:
  command: "sh"
  args: ["-c", "sleep 300 >/dev/null 2>&1 & echo $! >> helpers.log; sleep 0.2; exit 1"]
restart:
  policy: "on-failure"
  max_restarts: 1
  backoff: "50ms"
"#,
    );

    let (_stop, handle) = spawn_supervisor(config);
    assert!(matches!(
        handle.join().unwrap(),
        Err(SupervisorError::RestartLimitExceeded { .. })
    ));

    let helpers = wait_for_lines(&temp.path().join("helpers.log"), 2);
    assert_eq!(helpers.len(), 2, "initial run plus one restart");
    for helper in helpers {
        wait_for_process_exit(helper.trim().parse().unwrap());
    }
}

#[test]
fn stop_during_pre_start_is_bounded() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let config = install(
        temp.path(),
        r#"service:
  id: "slow-pre-start"
worker:
  command: "sh"
  args: ["-c", "touch worker-ran; sleep 30"]
pre_start:
  - "sleep 20"
stop_timeout: "1s"
"#,
    );

    let (_stop, handle) = spawn_supervisor(config.clone());
    let supervisor_pid = wait_for_supervisor_pid("slow-pre-start");
    assert_eq!(supervisor_pid, std::process::id());
    std::thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    assert_eq!(controller::stop(&config).unwrap(), StopOutcome::Stopped);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "stop took {:?}",
        started.elapsed()
    );
    handle.join().unwrap().unwrap();

    assert!(!temp.path().join("worker-ran").exists());
    let entry = wait_for_state("slow-pre-start", ServiceState::Stopped);
    assert!(entry.worker_pid.is_none());
    assert!(entry.last_error.is_none());
}
