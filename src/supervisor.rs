use std::{
    fs, io,
    os::unix::net::UnixListener,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    backoff::{RestartDecision, RestartPolicy, RestartTracker},
    config::Config,
    error::SupervisorError,
    ipc::{self, ControlCommand, ControlResponse, SupervisorLock, SupervisorSnapshot},
    registry,
    state::{ServiceState, ServiceStateEntry, StateFile},
    worker::{self, Worker, WorkerExit},
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const LISTENER_IDLE: Duration = Duration::from_millis(50);

/// The wait handle the supervisor blocks on. Triggering it is the only way to request a stop.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop and wakes every waiter.
    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        let mut requested = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *requested = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks for at most `timeout`; returns `true` as soon as a stop has been requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |requested| !*requested)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

/// Runs one worker for one registered service until asked to stop.
#[derive(Debug)]
pub struct Supervisor {
    config: Config,
    policy: RestartPolicy,
    stop: StopSignal,
    snapshot: Arc<Mutex<SupervisorSnapshot>>,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(config: Config) -> Result<Self, SupervisorError> {
        config.validate()?;
        let policy = RestartPolicy::from_config(&config.restart)?;
        let snapshot = SupervisorSnapshot {
            state: ServiceState::Stopped,
            supervisor_pid: std::process::id(),
            worker_pid: None,
            worker_uptime_secs: None,
            restarts: 0,
        };

        Ok(Self {
            config,
            policy,
            stop: StopSignal::new(),
            snapshot: Arc::new(Mutex::new(snapshot)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Overrides how often worker liveness is checked.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Handle that stops this supervisor when triggered (signal handlers, tests).
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    fn id(&self) -> &str {
        &self.config.service.id
    }

    /// Supervises the worker until a stop is requested or the restart policy gives up.
    ///
    /// Whatever the outcome, the worker is not left running and the service ends `Stopped`.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        let id = self.id().to_string();
        // Held until this function returns; nothing below runs without it.
        let _ownership = self.acquire_ownership()?;
        self.claim_service()?;

        ipc::cleanup_runtime(&id)?;
        let socket_path = ipc::socket_path(&id)?;
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        ipc::write_supervisor_pid(&id, std::process::id())?;
        info!("Supervisor for '{id}' listening on {socket_path:?}");

        let listening = Arc::new(AtomicBool::new(true));
        let control = spawn_control_listener(
            listener,
            self.stop.clone(),
            Arc::clone(&self.snapshot),
            Arc::clone(&listening),
        )?;

        let result = self.supervise();

        let last_error = result.as_ref().err().map(ToString::to_string);
        if let Err(err) = self.record(|entry| {
            entry.state = ServiceState::Stopped;
            entry.supervisor_pid = None;
            entry.worker_pid = None;
            entry.last_error = last_error;
        }) {
            warn!("Failed to persist stopped state for '{id}': {err}");
        }
        self.update_snapshot(|snap| {
            snap.state = ServiceState::Stopped;
            snap.worker_pid = None;
            snap.worker_uptime_secs = None;
        });

        listening.store(false, Ordering::SeqCst);
        let _ = control.join();
        ipc::cleanup_runtime(&id)?;

        match &result {
            Ok(()) => info!("Supervisor for '{id}' stopped"),
            Err(err) => error!("Supervisor for '{id}' exited with error: {err}"),
        }
        result
    }

    /// Takes the per-service supervisor lock, failing with `AlreadyRunning` if it is held.
    fn acquire_ownership(&self) -> Result<SupervisorLock, SupervisorError> {
        let id = self.id();
        if let Some(lock) = SupervisorLock::try_acquire(id)? {
            return Ok(lock);
        }

        let pid = ipc::read_supervisor_pid(id)
            .ok()
            .flatten()
            .or_else(|| {
                StateFile::load()
                    .ok()
                    .and_then(|states| states.get(id).and_then(|entry| entry.supervisor_pid))
            })
            .unwrap_or(0);
        Err(SupervisorError::AlreadyRunning {
            id: id.to_string(),
            pid,
        })
    }

    /// Verifies the service is installed and resets state left behind by a dead supervisor.
    ///
    /// Called with the supervisor lock held, so any `Running`/`StopPending` record is stale.
    fn claim_service(&self) -> Result<(), SupervisorError> {
        let id = self.id();
        if registry::manager_for_id(id)?.query(id)?.is_none() {
            return Err(SupervisorError::NotInstalled { id: id.to_string() });
        }

        let mut states = StateFile::load()?;
        match states.state_of(id) {
            ServiceState::Stopped => Ok(()),
            ServiceState::Uninstalled => {
                // Registered but the state entry went missing; recreate it.
                states.set(id, ServiceStateEntry::stopped())?;
                Ok(())
            }
            current @ (ServiceState::Running | ServiceState::StopPending) => {
                warn!("Recovering stale {current} state for '{id}'");
                states.update(id, |entry| {
                    entry.state = ServiceState::Stopped;
                    entry.supervisor_pid = None;
                    entry.worker_pid = None;
                })?;
                Ok(())
            }
        }
    }

    fn supervise(&mut self) -> Result<(), SupervisorError> {
        let id = self.id().to_string();
        let stop_timeout = self.config.stop_timeout()?;

        worker::run_pre_start_steps(&self.config, &self.stop)?;
        if self.stop.is_triggered() {
            info!("Stop requested before '{id}' worker was spawned");
            return Ok(());
        }

        let mut current = Worker::spawn(&self.config)?;
        self.mark_running(&current, 0)?;
        let mut tracker = RestartTracker::new(self.policy.clone());

        loop {
            if self.stop.wait_timeout(self.poll_interval) {
                return self.stop_worker(&mut current, stop_timeout);
            }

            let uptime = current.uptime();
            self.update_snapshot(|snap| snap.worker_uptime_secs = Some(uptime.as_secs()));

            let Some(exit) = current.try_wait()? else {
                continue;
            };

            warn!("Worker for '{id}' exited unexpectedly with {exit}");
            let mut exit = exit;
            let mut uptime = uptime;

            loop {
                self.record_exit(&exit);
                match tracker.record_exit(&exit, uptime) {
                    RestartDecision::Restart { attempt, delay } => {
                        warn!(
                            "Restarting worker for '{id}' in {delay:?} (attempt {attempt}/{})",
                            self.policy.max_restarts
                        );
                        if self.stop.wait_timeout(delay) {
                            info!("Stop requested during restart backoff for '{id}'");
                            return Ok(());
                        }

                        match Worker::spawn(&self.config) {
                            Ok(worker) => {
                                current = worker;
                                self.mark_running(&current, attempt)?;
                                break;
                            }
                            Err(err) => {
                                error!("Restart attempt {attempt} for '{id}' failed: {err}");
                                exit = WorkerExit {
                                    code: None,
                                    signal: None,
                                };
                                uptime = Duration::ZERO;
                            }
                        }
                    }
                    RestartDecision::Stop => {
                        info!(
                            "Worker for '{id}' exited with {exit}; restart policy '{}' does not restart it",
                            self.policy.mode
                        );
                        return Ok(());
                    }
                    RestartDecision::GiveUp { attempts } => {
                        error!(
                            "Worker for '{id}' has reached maximum restart attempts ({attempts}). Giving up."
                        );
                        return Err(SupervisorError::RestartLimitExceeded {
                            service: id,
                            attempts,
                        });
                    }
                }
            }
        }
    }

    fn stop_worker(
        &self,
        worker: &mut Worker,
        stop_timeout: Duration,
    ) -> Result<(), SupervisorError> {
        let id = self.id();
        info!("Stop requested for '{id}'; terminating worker PID {}", worker.pid());
        self.transition(ServiceState::StopPending)?;

        let exit = worker.terminate(stop_timeout)?;
        self.record_exit(&exit);
        info!("Worker for '{id}' terminated with {exit}");
        Ok(())
    }

    fn mark_running(&self, worker: &Worker, restarts: u32) -> Result<(), SupervisorError> {
        let pid = worker.pid();
        let supervisor_pid = std::process::id();
        self.transition(ServiceState::Running)?;
        self.record(|entry| {
            entry.supervisor_pid = Some(supervisor_pid);
            entry.worker_pid = Some(pid);
            entry.restarts = restarts;
            entry.last_error = None;
        })?;
        self.update_snapshot(|snap| {
            snap.worker_pid = Some(pid);
            snap.worker_uptime_secs = Some(0);
            snap.restarts = restarts;
        });
        Ok(())
    }

    fn record_exit(&self, exit: &WorkerExit) {
        let exit = *exit;
        if let Err(err) = self.record(|entry| {
            entry.worker_pid = None;
            entry.last_exit_code = exit.code;
            entry.last_signal = exit.signal;
        }) {
            warn!("Failed to persist worker exit for '{}': {err}", self.id());
        }
        self.update_snapshot(|snap| {
            snap.worker_pid = None;
            snap.worker_uptime_secs = None;
        });
    }

    /// Moves the persisted state, rejecting moves the lifecycle does not allow.
    fn transition(&self, next: ServiceState) -> Result<(), SupervisorError> {
        let mut states = StateFile::load()?;
        let current = states.state_of(self.id());
        if !current.can_transition_to(next) {
            return Err(SupervisorError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        debug!("'{}' {current} -> {next}", self.id());
        states.update(self.id(), |entry| entry.state = next)?;
        self.update_snapshot(|snap| snap.state = next);
        Ok(())
    }

    fn record<F>(&self, update: F) -> Result<(), SupervisorError>
    where
        F: FnOnce(&mut ServiceStateEntry),
    {
        let mut states = StateFile::load()?;
        states.update(self.id(), update)?;
        Ok(())
    }

    fn update_snapshot<F>(&self, update: F)
    where
        F: FnOnce(&mut SupervisorSnapshot),
    {
        let mut snapshot = self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut snapshot);
    }
}

/// Answers control commands until `listening` is cleared.
fn spawn_control_listener(
    listener: UnixListener,
    stop: StopSignal,
    snapshot: Arc<Mutex<SupervisorSnapshot>>,
    listening: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, SupervisorError> {
    listener.set_nonblocking(true)?;

    let handle = thread::spawn(move || {
        while listening.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((mut stream, _addr)) => {
                    if let Err(err) = stream.set_nonblocking(false) {
                        warn!("Cannot switch control connection to blocking mode: {err}");
                        continue;
                    }

                    let response = match ipc::read_command(&mut stream) {
                        Ok(command) => {
                            debug!("Supervisor received command: {command:?}");
                            match command {
                                ControlCommand::Stop => {
                                    stop.trigger();
                                    ControlResponse::Message("Stopping service".into())
                                }
                                ControlCommand::Status => {
                                    let snap = snapshot
                                        .lock()
                                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                                        .clone();
                                    ControlResponse::Status(snap)
                                }
                            }
                        }
                        Err(err) => {
                            warn!("Invalid supervisor command: {err}");
                            ControlResponse::Error(err.to_string())
                        }
                    };

                    if let Err(err) = ipc::write_response(&mut stream, &response) {
                        debug!("Failed to answer control client: {err}");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(LISTENER_IDLE);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("Supervisor listener error: {err}");
                    break;
                }
            }
        }
        debug!("Control listener terminating.");
    });

    Ok(handle)
}
