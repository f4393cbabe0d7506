//! Install, start, stop and uninstall: the service-control operations behind the CLI.
use chrono::Utc;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    env, io,
    os::unix::process::CommandExt,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{StateError, SupervisorError},
    ipc::{self, ControlCommand, ControlError},
    registry::{self, Backend, Launch, ServiceRegistration},
    runtime::{self, RuntimeMode},
    state::{ServiceState, ServiceStateEntry, StateFile},
    worker::{self, WorkerExit},
};

/// How long `start` waits for the detached supervisor to report `Running`.
pub const START_WAIT: Duration = Duration::from_secs(30);
/// Extra time `stop` allows on top of the worker grace period.
pub const STOP_MARGIN: Duration = Duration::from_secs(5);
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of a successful `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Supervisor is up and its worker has been spawned.
    Running { supervisor_pid: u32 },
    /// Supervisor is alive but has not spawned the worker yet (long pre-start steps).
    Starting,
}

/// Result of a successful `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// Nothing was running.
    AlreadyStopped,
}

/// Builds the registration the host uses to launch the supervisor for `config`.
pub fn registration_for(
    config: &Config,
    backend: Backend,
) -> Result<ServiceRegistration, SupervisorError> {
    let exe = env::current_exe()?;
    let mut command_line = vec![exe.to_string_lossy().into_owned()];
    if runtime::mode() == RuntimeMode::System {
        command_line.push("--sys".into());
    }
    command_line.push("run".into());
    match &config.source {
        Some(path) => {
            command_line.push("--config".into());
            command_line.push(path.to_string_lossy().into_owned());
        }
        None => {
            command_line.push("--project-dir".into());
            command_line.push(config.project_root().to_string_lossy().into_owned());
        }
    }

    Ok(ServiceRegistration {
        id: config.service.id.clone(),
        display_name: config.service.display_name.clone(),
        description: config.service.description.clone(),
        command_line,
        config_path: config.source.clone(),
        config_hash: config.compute_hash(),
        stop_timeout_secs: config.stop_timeout()?.as_secs(),
        backend,
        installed_at: Utc::now(),
    })
}

/// Registers the service and records it as `Stopped`.
pub fn install(config: &Config, backend: Backend) -> Result<ServiceRegistration, SupervisorError> {
    config.validate()?;
    let id = config.service.id.as_str();
    let registration = registration_for(config, backend)?;
    registry::manager_for(backend).install(&registration)?;

    let mut states = StateFile::load()?;
    let previous = states.state_of(id);
    if previous != ServiceState::Uninstalled {
        warn!("Discarding leftover {previous} state for '{id}'");
    }
    states.set(id, ServiceStateEntry::stopped())?;

    info!(
        "Installed '{}' ({}) using the {backend} backend",
        registration.id, registration.display_name
    );
    Ok(registration)
}

/// PID of the live supervisor for `id`, clearing stale runtime files along the way.
pub fn running_supervisor(id: &str) -> Result<Option<u32>, SupervisorError> {
    if let Some(pid) = ipc::read_supervisor_pid(id)? {
        if worker::process_alive(pid) {
            return Ok(Some(pid));
        }
        warn!("Removing stale supervisor PID file for '{id}' (PID {pid})");
        ipc::cleanup_runtime(id)?;
    }

    let states = StateFile::load()?;
    let pid = states
        .get(id)
        .filter(|entry| matches!(entry.state, ServiceState::Running | ServiceState::StopPending))
        .and_then(|entry| entry.supervisor_pid)
        .filter(|pid| worker::process_alive(*pid));
    Ok(pid)
}

/// Checks preconditions shared by detached and foreground starts.
pub fn prepare_start(config: &Config) -> Result<ServiceRegistration, SupervisorError> {
    let id = config.service.id.as_str();
    let registration = registry::find_registration(id)?
        .ok_or_else(|| SupervisorError::NotInstalled { id: id.to_string() })?;

    if let Some(pid) = running_supervisor(id)? {
        return Err(SupervisorError::AlreadyRunning {
            id: id.to_string(),
            pid,
        });
    }
    repair_stale_state(id)?;

    if registration.config_hash != config.compute_hash() {
        warn!(
            "Configuration for '{id}' changed since it was installed; the registered command line still applies. Reinstall to update it."
        );
    }

    Ok(registration)
}

/// Launches the supervisor through the registration's backend and waits until it is running.
pub fn start(config: &Config) -> Result<StartOutcome, SupervisorError> {
    let registration = prepare_start(config)?;
    let id = registration.id.as_str();

    let mut states = StateFile::load()?;
    if states.get(id).is_some() {
        states.update(id, |entry| entry.last_error = None)?;
    } else {
        states.set(id, ServiceStateEntry::stopped())?;
    }

    let manager = registry::manager_for(registration.backend);
    let mut child = match manager.launch(&registration)? {
        Launch::Direct => Some(spawn_detached(&registration)?),
        Launch::Delegated => None,
    };

    wait_until_running(id, child.as_mut(), START_WAIT)
}

/// Runs the registered command line in its own session, detached from the terminal.
fn spawn_detached(registration: &ServiceRegistration) -> Result<Child, SupervisorError> {
    let (program, args) = registration.command_line.split_first().ok_or_else(|| {
        SupervisorError::InvalidConfig(format!(
            "registration for '{}' has an empty command line",
            registration.id
        ))
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    debug!("Launching supervisor: {cmd:?}");
    let child = cmd.spawn()?;
    info!(
        "Started supervisor for '{}' with PID {}",
        registration.id,
        child.id()
    );
    Ok(child)
}

fn wait_until_running(
    id: &str,
    mut child: Option<&mut Child>,
    timeout: Duration,
) -> Result<StartOutcome, SupervisorError> {
    let deadline = Instant::now() + timeout;

    loop {
        let states = StateFile::load()?;
        if let Some(entry) = states.get(id)
            && entry.state == ServiceState::Running
            && entry.worker_pid.is_some()
            && let Some(supervisor_pid) = entry.supervisor_pid
        {
            return Ok(StartOutcome::Running { supervisor_pid });
        }

        if let Some(child) = child.as_deref_mut()
            && let Some(status) = child.try_wait()?
        {
            let reason = StateFile::load()?
                .get(id)
                .and_then(|entry| entry.last_error.clone())
                .unwrap_or_else(|| {
                    format!(
                        "supervisor exited with {}; see the supervisor log",
                        WorkerExit::from(status)
                    )
                });
            return Err(SupervisorError::StartFailed {
                id: id.to_string(),
                reason,
            });
        }

        if Instant::now() >= deadline {
            warn!("'{id}' has not reported Running after {timeout:?}; it may still be starting");
            return Ok(StartOutcome::Starting);
        }
        thread::sleep(STATE_POLL_INTERVAL);
    }
}

/// Asks the running supervisor to stop and waits until the service reads `Stopped`.
pub fn stop(config: &Config) -> Result<StopOutcome, SupervisorError> {
    let id = config.service.id.as_str();
    let registration = registry::find_registration(id)?
        .ok_or_else(|| SupervisorError::NotInstalled { id: id.to_string() })?;

    let Some(pid) = running_supervisor(id)? else {
        repair_stale_state(id)?;
        info!("'{id}' is not running");
        return Ok(StopOutcome::AlreadyStopped);
    };

    match ipc::send_command(id, &ControlCommand::Stop) {
        Ok(response) => debug!("Supervisor for '{id}' answered stop: {response:?}"),
        Err(ControlError::NotAvailable) => {
            warn!("Control socket for '{id}' unavailable; sending SIGTERM to supervisor PID {pid}");
            signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
        }
        Err(err) => return Err(err.into()),
    }

    let grace = Duration::from_secs(registration.stop_timeout_secs).max(config.stop_timeout()?);
    wait_until_stopped(id, grace + STOP_MARGIN)?;
    info!("'{id}' stopped");
    Ok(StopOutcome::Stopped)
}

fn wait_until_stopped(id: &str, timeout: Duration) -> Result<(), SupervisorError> {
    let deadline = Instant::now() + timeout;
    loop {
        let stopped = StateFile::load()?.state_of(id) == ServiceState::Stopped;
        if stopped && ipc::read_supervisor_pid(id)?.is_none() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(SupervisorError::StopTimeout {
                id: id.to_string(),
                seconds: timeout.as_secs(),
            });
        }
        thread::sleep(STATE_POLL_INTERVAL);
    }
}

/// Resets a `Running`/`StopPending` entry whose supervisor is gone.
fn repair_stale_state(id: &str) -> Result<(), SupervisorError> {
    let mut states = StateFile::load()?;
    let Some(entry) = states.get(id) else {
        return Ok(());
    };
    if !matches!(entry.state, ServiceState::Running | ServiceState::StopPending) {
        return Ok(());
    }

    if let Some(worker_pid) = entry.worker_pid
        && worker::process_alive(worker_pid)
    {
        warn!("Worker PID {worker_pid} of '{id}' outlived its supervisor");
    }
    warn!("Supervisor for '{id}' is gone; marking the service stopped");
    states.update(id, |entry| {
        entry.state = ServiceState::Stopped;
        entry.supervisor_pid = None;
        entry.worker_pid = None;
        entry.last_error.get_or_insert_with(|| "supervisor exited unexpectedly".into());
    })?;
    Ok(())
}

/// Stops the service if needed, then removes its registration and state.
pub fn uninstall(config: &Config) -> Result<ServiceRegistration, SupervisorError> {
    let id = config.service.id.as_str();
    let manager = registry::manager_for_id(id)?;
    registry::ensure_privileged("uninstall")?;

    if running_supervisor(id)?.is_some() {
        info!("Stopping '{id}' before uninstalling");
        stop(config)?;
    }

    let removed = manager.uninstall(id)?;
    let mut states = StateFile::load()?;
    match states.remove(id) {
        Ok(()) | Err(StateError::ServiceNotFound) => {}
        Err(err) => return Err(err.into()),
    }
    ipc::cleanup_runtime(id)?;

    info!("Uninstalled '{id}'");
    Ok(removed)
}
