#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    time::{Duration, Instant},
};

use common::{
    HomeEnvGuard, count_processes_with_arg, is_process_alive, spawn_supervisor, state_entry,
    trading_config_yaml, wait_for_lines, wait_for_process_exit, wait_for_state,
    wait_for_worker_pid, write_config, write_looping_worker,
};
use tempfile::tempdir;
use tradesup::{
    config::{Config, load_config},
    controller::{self, StopOutcome},
    error::SupervisorError,
    logs::{self, LogKind},
    registry::{self, Backend},
    state::ServiceState,
    status,
};

const ID: &str = "TradingSystem";

fn installed_trading_service(dir: &std::path::Path) -> (Config, String) {
    let script = write_looping_worker(dir);
    let config_path = write_config(dir, &trading_config_yaml(&script));
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    controller::install(&config, Backend::File).unwrap();
    (config, script.to_string_lossy().into_owned())
}

#[test]
fn trading_service_runs_one_worker_and_stop_terminates_it() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let (config, marker) = installed_trading_service(temp.path());

    assert_eq!(config.worker.args.last().map(String::as_str), Some("--mode=continuous"));

    let (_stop, handle) = spawn_supervisor(config.clone());
    let worker_pid = wait_for_worker_pid(ID, None);
    assert!(is_process_alive(worker_pid));
    assert_eq!(count_processes_with_arg(&marker), 1);

    let log = logs::resolve_log_path(ID, LogKind::Stdout);
    let lines = wait_for_lines(&log, 1);
    assert_eq!(lines[0], "trading loop started --mode=continuous");

    let report = status::collect_status(&config).unwrap();
    assert_eq!(report.state, ServiceState::Running);
    assert_eq!(report.display_name, "Multi-Asset Trading System");
    assert_eq!(report.worker.as_ref().map(|worker| worker.pid), Some(worker_pid));
    assert!(!report.config_drift);

    let started = Instant::now();
    assert_eq!(controller::stop(&config).unwrap(), StopOutcome::Stopped);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "stop took {:?}",
        started.elapsed()
    );

    handle.join().unwrap().unwrap();
    wait_for_process_exit(worker_pid);
    assert_eq!(count_processes_with_arg(&marker), 0);

    let entry = wait_for_state(ID, ServiceState::Stopped);
    assert!(entry.worker_pid.is_none());
    assert!(entry.supervisor_pid.is_none());
    assert_eq!(entry.last_signal, Some(libc::SIGTERM));
}

#[test]
fn stopping_a_stopped_service_is_a_no_op() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let (config, _) = installed_trading_service(temp.path());

    assert_eq!(
        controller::stop(&config).unwrap(),
        StopOutcome::AlreadyStopped
    );
    wait_for_state(ID, ServiceState::Stopped);
}

#[test]
fn repeated_start_stop_cycles_leave_exactly_one_worker() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let (config, marker) = installed_trading_service(temp.path());

    let mut previous = None;
    for cycle in 1..=3 {
        let (_stop, handle) = spawn_supervisor(config.clone());
        let worker_pid = wait_for_worker_pid(ID, previous);
        assert_eq!(
            count_processes_with_arg(&marker),
            1,
            "cycle {cycle} should run exactly one worker"
        );

        controller::stop(&config).unwrap();
        handle.join().unwrap().unwrap();
        wait_for_process_exit(worker_pid);
        previous = Some(worker_pid);
    }

    let (_stop, handle) = spawn_supervisor(config.clone());
    wait_for_worker_pid(ID, previous);
    assert_eq!(count_processes_with_arg(&marker), 1);

    controller::stop(&config).unwrap();
    handle.join().unwrap().unwrap();
    assert_eq!(count_processes_with_arg(&marker), 0);
}

#[test]
fn starting_a_running_service_is_rejected() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let (config, marker) = installed_trading_service(temp.path());

    let (_stop, handle) = spawn_supervisor(config.clone());
    wait_for_worker_pid(ID, None);

    assert!(matches!(
        controller::prepare_start(&config),
        Err(SupervisorError::AlreadyRunning { .. })
    ));

    let (_second_stop, second) = spawn_supervisor(config.clone());
    assert!(matches!(
        second.join().unwrap(),
        Err(SupervisorError::AlreadyRunning { .. })
    ));
    assert_eq!(count_processes_with_arg(&marker), 1);

    controller::stop(&config).unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn stop_signal_terminates_worker_that_ignores_sigterm() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));

    let script = temp.path().join("stubborn.sh");
    fs::write(&script, "trap '' TERM\nwhile true; do sleep 1; done\n").unwrap();
    let config_path = write_config(
        temp.path(),
        &format!(
            r#"service:
  id: "stubborn"
worker:
  command: "sh"
  args: ["{}"]
stop_timeout: "500ms"
"#,
            script.display()
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    controller::install(&config, Backend::File).unwrap();

    let (stop, handle) = spawn_supervisor(config);
    let worker_pid = wait_for_worker_pid("stubborn", None);

    stop.trigger();
    handle.join().unwrap().unwrap();
    wait_for_process_exit(worker_pid);

    let entry = wait_for_state("stubborn", ServiceState::Stopped);
    assert_eq!(entry.last_signal, Some(libc::SIGKILL));
}

#[test]
fn uninstall_stops_a_running_service_first() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let (config, marker) = installed_trading_service(temp.path());

    let (_stop, handle) = spawn_supervisor(config.clone());
    let worker_pid = wait_for_worker_pid(ID, None);

    controller::uninstall(&config).unwrap();
    handle.join().unwrap().unwrap();
    wait_for_process_exit(worker_pid);

    assert_eq!(count_processes_with_arg(&marker), 0);
    assert!(registry::find_registration(ID).unwrap().is_none());
    let report = status::collect_status(&config).unwrap();
    assert_eq!(report.state, ServiceState::Uninstalled);
}

#[test]
fn concurrent_supervisors_spawn_a_single_worker() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));

    let script = temp.path().join("race.sh");
    fs::write(&script, "echo spawned >> spawns.log\nwhile true; do sleep 1; done\n").unwrap();
    let config_path = write_config(
        temp.path(),
        &format!(
            r#"service:
  id: "race"
worker:
  command: "sh"
  args: ["{}"]
pre_start:
  - "sleep 0.5"
"#,
            script.display()
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    controller::install(&config, Backend::File).unwrap();
    let marker = script.to_string_lossy().into_owned();

    let (_first_stop, first) = spawn_supervisor(config.clone());
    let (_second_stop, second) = spawn_supervisor(config.clone());

    let deadline = Instant::now() + Duration::from_secs(10);
    while !first.is_finished() && !second.is_finished() {
        assert!(Instant::now() < deadline, "neither supervisor gave way");
        std::thread::sleep(Duration::from_millis(20));
    }
    let (loser, winner) = if first.is_finished() {
        (first, second)
    } else {
        (second, first)
    };
    assert!(matches!(
        loser.join().unwrap(),
        Err(SupervisorError::AlreadyRunning { .. })
    ));

    let worker_pid = wait_for_worker_pid("race", None);
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(count_processes_with_arg(&marker), 1);
    let spawns = fs::read_to_string(temp.path().join("spawns.log")).unwrap();
    assert_eq!(spawns.lines().count(), 1);

    controller::stop(&config).unwrap();
    winner.join().unwrap().unwrap();
    wait_for_process_exit(worker_pid);
    assert_eq!(count_processes_with_arg(&marker), 0);
}

#[test]
fn stop_passes_through_stop_pending() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));

    let script = temp.path().join("graceful.sh");
    fs::write(
        &script,
        "trap 'sleep 1; exit 0' TERM\nwhile true; do sleep 1; done\n",
    )
    .unwrap();
    let config_path = write_config(
        temp.path(),
        &format!(
            r#"service:
  id: "graceful"
worker:
  command: "sh"
  args: ["{}"]
stop_timeout: "5s"
"#,
            script.display()
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    controller::install(&config, Backend::File).unwrap();

    let (stop, handle) = spawn_supervisor(config);
    let worker_pid = wait_for_worker_pid("graceful", None);

    stop.trigger();
    let pending = wait_for_state("graceful", ServiceState::StopPending);
    assert_eq!(pending.worker_pid, Some(worker_pid));

    handle.join().unwrap().unwrap();
    let entry = wait_for_state("graceful", ServiceState::Stopped);
    assert_eq!(entry.last_exit_code, Some(0));
    wait_for_process_exit(worker_pid);
}

#[test]
fn worker_survives_invalid_utf8_output() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));

    let script = temp.path().join("noisy.sh");
    fs::write(
        &script,
        "echo before\nprintf '\\377\\n'\nprintf '\\376\\n' >&2\nsleep 0.3\necho after\necho alive > alive.txt\nwhile true; do sleep 1; done\n",
    )
    .unwrap();
    let config_path = write_config(
        temp.path(),
        &format!(
            r#"service:
  id: "noisy"
worker:
  command: "sh"
  args: ["{}"]
"#,
            script.display()
        ),
    );
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    controller::install(&config, Backend::File).unwrap();

    let (_stop, handle) = spawn_supervisor(config.clone());
    let worker_pid = wait_for_worker_pid("noisy", None);

    let lines = wait_for_lines(&logs::resolve_log_path("noisy", LogKind::Stdout), 3);
    assert_eq!(lines, vec!["before", "\u{FFFD}", "after"]);
    wait_for_lines(&temp.path().join("alive.txt"), 1);
    assert!(is_process_alive(worker_pid));
    assert_eq!(
        logs::tail_log("noisy", LogKind::Stdout, 5).unwrap(),
        vec!["before", "\u{FFFD}", "after"]
    );

    let entry = state_entry("noisy").unwrap();
    assert_eq!(entry.restarts, 0);
    assert_eq!(entry.worker_pid, Some(worker_pid));

    controller::stop(&config).unwrap();
    handle.join().unwrap().unwrap();
}
