//! Spawning, watching, and terminating the supervised worker process.
use std::{
    collections::HashMap,
    fmt, fs, io,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, EnvConfig, PreStartStep},
    error::SupervisorError,
    logs::{LogKind, read_lines_lossy, spawn_log_writer},
    supervisor::StopSignal,
};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Build the environment map for the worker, giving inline `env.vars` precedence over
/// entries loaded from `env.file`.
pub fn collect_worker_env(
    env: Option<&EnvConfig>,
    project_root: &Path,
    service: &str,
) -> HashMap<String, String> {
    let mut resolved = HashMap::new();

    let Some(env_config) = env else {
        return resolved;
    };

    if let Some(file_path) = env_config.path(project_root) {
        match fs::read_to_string(&file_path) {
            Ok(content) => {
                for raw_line in content.lines() {
                    let line = raw_line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }

                    if let Some((key, value)) = line.split_once('=') {
                        let key = key.trim().to_string();
                        let mut value = value.trim();
                        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                            value = &value[1..value.len() - 1];
                        }
                        resolved.insert(key, value.to_string());
                    } else {
                        warn!("Ignoring malformed line in env file for '{service}': {line}");
                    }
                }
            }
            Err(err) => {
                error!("Failed to read env file for '{service}': {err}");
            }
        }
    }

    if let Some(vars) = &env_config.vars {
        for (key, value) in vars {
            resolved.insert(key.clone(), value.clone());
        }
    }

    resolved
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal when the process was killed.
    pub signal: Option<i32>,
}

impl WorkerExit {
    /// Exit code zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => match Signal::try_from(signal) {
                Ok(sig) => write!(f, "signal {sig}"),
                Err(_) => write!(f, "signal {signal}"),
            },
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Where the worker's group leader is in its exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leader {
    Running,
    /// Exited but still a zombie.
    Exited,
    Reaped,
}

/// A running worker child owned by the supervisor.
#[derive(Debug)]
pub struct Worker {
    service: String,
    child: Child,
    started_at: Instant,
}

impl Worker {
    /// Spawns the worker in its own process group with stdout/stderr captured to log files.
    ///
    /// On Linux the worker also receives `SIGTERM` if the supervisor dies without stopping it.
    pub fn spawn(config: &Config) -> Result<Self, SupervisorError> {
        let service = config.service.id.clone();
        let working_dir = config.worker_dir();

        let mut cmd = Command::new(&config.worker.command);
        cmd.args(&config.worker.args)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let env = collect_worker_env(
            config.worker.env.as_ref(),
            &config.project_root(),
            &service,
        );
        if !env.is_empty() {
            let keys: Vec<_> = env.keys().cloned().collect();
            debug!("Setting worker environment variables: {keys:?}");
            cmd.envs(env);
        }

        unsafe {
            cmd.pre_exec(|| {
                // Own process group so stop can signal the whole worker tree.
                if libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }

                #[cfg(target_os = "linux")]
                {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM, 0, 0, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }

        debug!("Launching worker for '{service}' in {working_dir:?}: {cmd:?}");

        let mut child = cmd.spawn().map_err(|source| {
            error!("Failed to start worker for '{service}': {source}");
            SupervisorError::WorkerSpawnError {
                service: service.clone(),
                source,
            }
        })?;

        if let Some(out) = child.stdout.take() {
            spawn_log_writer(&service, out, LogKind::Stdout);
        }
        if let Some(err) = child.stderr.take() {
            spawn_log_writer(&service, err, LogKind::Stderr);
        }

        info!("Worker for '{service}' started with PID {}", child.id());
        Ok(Self {
            service,
            child,
            started_at: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Time since the worker was spawned.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Non-blocking liveness check.
    ///
    /// Once the worker has exited, whatever is left of its process group is killed before
    /// the leader is reaped, so no helper it forked outlives it.
    pub fn try_wait(&mut self) -> Result<Option<WorkerExit>, SupervisorError> {
        match self.leader_status()? {
            Leader::Running => Ok(None),
            Leader::Exited => {
                // The unreaped leader still pins the group id.
                self.kill_group(Signal::SIGKILL);
                Ok(self.child.try_wait()?.map(WorkerExit::from))
            }
            Leader::Reaped => Ok(self.child.try_wait()?.map(WorkerExit::from)),
        }
    }

    /// Peeks at the leader without reaping it.
    #[cfg(target_os = "linux")]
    fn leader_status(&mut self) -> Result<Leader, SupervisorError> {
        use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};

        let pid = Pid::from_raw(self.pid() as i32);
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        match waitid(Id::Pid(pid), flags) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => Ok(Leader::Running),
            Ok(_) => Ok(Leader::Exited),
            Err(Errno::ECHILD) => Ok(Leader::Reaped),
            Err(err) => Err(err.into()),
        }
    }

    /// Without `WNOWAIT` the leader is reaped first and the group is cleaned up afterwards.
    #[cfg(not(target_os = "linux"))]
    fn leader_status(&mut self) -> Result<Leader, SupervisorError> {
        if self.child.try_wait()?.is_some() {
            self.kill_group(Signal::SIGKILL);
            Ok(Leader::Reaped)
        } else {
            Ok(Leader::Running)
        }
    }

    /// Stops the worker: `SIGTERM` to its process group, then `SIGKILL` once `grace` elapses.
    ///
    /// Always reaps the child before returning.
    pub fn terminate(&mut self, grace: Duration) -> Result<WorkerExit, SupervisorError> {
        if let Some(exit) = self.try_wait()? {
            debug!("Worker for '{}' already exited with {exit}", self.service);
            return Ok(exit);
        }

        let pid = Pid::from_raw(self.pid() as i32);
        debug!("Stopping worker for '{}' (PID {pid})", self.service);

        self.signal_group(Signal::SIGTERM)?;
        if let Err(err) = signal::kill(pid, Signal::SIGTERM)
            && err != Errno::ESRCH
        {
            return Err(self.stop_error(err));
        }

        let deadline = Instant::now() + grace;
        loop {
            if let Some(exit) = self.try_wait()? {
                info!("Worker for '{}' exited with {exit}", self.service);
                return Ok(exit);
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        warn!(
            "Worker for '{}' did not exit within {grace:?} after SIGTERM; sending SIGKILL",
            self.service
        );
        // Leader is not reaped yet, so the group id cannot have been reused.
        self.kill_group(Signal::SIGKILL);
        if let Err(err) = self.child.kill()
            && err.kind() != io::ErrorKind::InvalidInput
        {
            return Err(SupervisorError::WorkerStopError {
                service: self.service.clone(),
                source: err,
            });
        }

        let status = self.child.wait()?;
        Ok(WorkerExit::from(status))
    }

    fn signal_group(&self, sig: Signal) -> Result<(), SupervisorError> {
        let pgid = Pid::from_raw(self.pid() as i32);
        match signal::killpg(pgid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(Errno::EPERM) => {
                warn!(
                    "Insufficient permissions to signal process group {pgid} for '{}'. Falling back to direct signal",
                    self.service
                );
                Ok(())
            }
            Err(err) => Err(self.stop_error(err)),
        }
    }

    /// Best-effort cleanup of anything left in the worker's process group.
    fn kill_group(&self, sig: Signal) {
        let pgid = Pid::from_raw(self.pid() as i32);
        if let Err(err) = signal::killpg(pgid, sig)
            && err != Errno::ESRCH
        {
            debug!(
                "Could not signal leftover group {pgid} for '{}': {err}",
                self.service
            );
        }
    }

    fn stop_error(&self, err: Errno) -> SupervisorError {
        SupervisorError::WorkerStopError {
            service: self.service.clone(),
            source: io::Error::from_raw_os_error(err as i32),
        }
    }
}

/// Probes `pid` with signal 0.
pub fn process_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// How a pre-start step finished waiting.
enum StepWait {
    Exited(ExitStatus),
    TimedOut(Duration),
    Stopped,
}

/// Waits for a step, giving up at its timeout or as soon as a stop is requested.
fn wait_for_step(
    child: &mut Child,
    timeout: Option<Duration>,
    stop: &StopSignal,
) -> io::Result<StepWait> {
    let deadline = timeout.map(|timeout| (Instant::now() + timeout, timeout));

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(StepWait::Exited(status));
        }
        if let Some((deadline, timeout)) = deadline
            && Instant::now() >= deadline
        {
            return Ok(StepWait::TimedOut(timeout));
        }
        if stop.wait_timeout(EXIT_POLL_INTERVAL) {
            return Ok(StepWait::Stopped);
        }
    }
}

/// Kills an unreaped step and everything it started, then reaps it.
fn kill_step(child: &mut Child) {
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(err) = signal::killpg(pgid, Signal::SIGKILL)
        && err != Errno::ESRCH
    {
        debug!("Could not signal pre-start group {pgid}: {err}");
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Runs every pre-start step in order, stopping at the first failure.
///
/// A stop request abandons the current step and skips the rest; this still returns `Ok`,
/// so callers check `stop` before going on.
pub fn run_pre_start_steps(config: &Config, stop: &StopSignal) -> Result<(), SupervisorError> {
    for step in &config.pre_start {
        if stop.is_triggered() {
            info!(
                "Stop requested; skipping remaining pre-start steps for '{}'",
                config.service.id
            );
            return Ok(());
        }
        run_pre_start_step(config, step, stop)?;
    }
    Ok(())
}

fn run_pre_start_step(
    config: &Config,
    step: &PreStartStep,
    stop: &StopSignal,
) -> Result<(), SupervisorError> {
    let service = config.service.id.as_str();
    let command = step.command();
    let failed = |reason: String| SupervisorError::PreStartFailed {
        step: command.to_string(),
        reason,
    };
    let timeout = step.timeout()?;

    info!("Running pre-start step for '{service}': `{command}`");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(config.project_root())
        .envs(collect_worker_env(
            config.worker.env.as_ref(),
            &config.project_root(),
            service,
        ))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| failed(format!("could not spawn: {err}")))?;

    let stdout_handle = child.stdout.take().map(|stdout| {
        let service = service.to_string();
        thread::spawn(move || {
            let _ = read_lines_lossy(stdout, |line| info!("[{service} pre-start] {line}"));
        })
    });
    let stderr_handle = child.stderr.take().map(|stderr| {
        let service = service.to_string();
        thread::spawn(move || {
            let _ = read_lines_lossy(stderr, |line| warn!("[{service} pre-start] {line}"));
        })
    });

    let waited = wait_for_step(&mut child, timeout, stop);
    if !matches!(waited, Ok(StepWait::Exited(_))) {
        kill_step(&mut child);
    }

    if let Some(handle) = stdout_handle {
        let _ = handle.join();
    }
    if let Some(handle) = stderr_handle {
        let _ = handle.join();
    }

    let status = match waited? {
        StepWait::Exited(status) => status,
        StepWait::TimedOut(timeout) => {
            return Err(failed(format!("timed out after {timeout:?}")));
        }
        StepWait::Stopped => {
            info!("Pre-start step `{command}` for '{service}' abandoned: stop requested");
            return Ok(());
        }
    };

    if !status.success() {
        return Err(failed(format!("exited with {}", WorkerExit::from(status))));
    }

    debug!("Pre-start step `{command}` for '{service}' succeeded");
    Ok(())
}
