//! Error handling for tradesup.
use thiserror::Error;

use crate::state::ServiceState;

/// Defines all possible errors surfaced by the service supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[source] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// Configuration parsed but holds an unusable value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration references an environment variable that is not set.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A registration with the same identifier already exists.
    #[error("Service '{id}' is already registered")]
    DuplicateRegistration {
        /// The conflicting service identifier.
        id: String,
    },

    /// The service identifier is not registered.
    #[error("Service '{id}' is not installed")]
    NotInstalled {
        /// The unknown service identifier.
        id: String,
    },

    /// The operation needs administrative privilege.
    #[error("Operation '{operation}' requires administrative privilege")]
    InsufficientPrivilege {
        /// The operation that was refused.
        operation: String,
    },

    /// The service is already running and cannot be started again.
    #[error("Service '{id}' is already running (supervisor PID {pid})")]
    AlreadyRunning {
        /// The service identifier.
        id: String,
        /// PID of the supervisor that owns the running worker.
        pid: u32,
    },

    /// A lifecycle transition was requested from an incompatible state.
    #[error("Cannot move service from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: ServiceState,
        /// Requested state.
        to: ServiceState,
    },

    /// Error spawning the worker process.
    #[error("Failed to start worker for '{service}': {source}")]
    WorkerSpawnError {
        /// The service whose worker failed to spawn.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error stopping the worker process.
    #[error("Failed to stop worker for '{service}': {source}")]
    WorkerStopError {
        /// The service whose worker could not be stopped.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The worker kept crashing and the restart budget ran out.
    #[error("Worker for '{service}' exceeded {attempts} restart attempts")]
    RestartLimitExceeded {
        /// The service identifier.
        service: String,
        /// Number of restarts attempted before giving up.
        attempts: u32,
    },

    /// A pre-start step exited unsuccessfully.
    #[error("Pre-start step `{step}` failed: {reason}")]
    PreStartFailed {
        /// The command that failed.
        step: String,
        /// Human readable failure description.
        reason: String,
    },

    /// The detached supervisor exited before the service reached `Running`.
    #[error("Service '{id}' failed to start: {reason}")]
    StartFailed {
        /// The service identifier.
        id: String,
        /// Last error recorded by the supervisor.
        reason: String,
    },

    /// The supervisor did not reach the stopped state in time.
    #[error("Service '{id}' did not stop within {seconds}s")]
    StopTimeout {
        /// The service identifier.
        id: String,
        /// How long the caller waited.
        seconds: u64,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),

    /// Error for the registration store.
    #[error("Registry error: {0}")]
    RegistryError(#[from] RegistryError),

    /// Error for the service state file.
    #[error("Service state error: {0}")]
    StateError(#[from] StateError),

    /// Error talking to a running supervisor.
    #[error(transparent)]
    Control(#[from] crate::ipc::ControlError),

    /// Raw errno from a system call.
    #[error("System call failed: {0}")]
    ErrNo(#[from] nix::errno::Errno),

    /// Generic I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `SupervisorError`.
impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::MutexPoisonError(err.to_string())
    }
}

/// Error type for the persisted registration store.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Error reading or writing the registry file.
    #[error("Failed to access registry: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing the registry JSON.
    #[error("Failed to parse registry: {0}")]
    ParseError(#[from] serde_json::Error),

    /// An external service-manager command exited unsuccessfully.
    #[error("`{command}` exited with status {code:?}")]
    CommandFailed {
        /// The command that was run.
        command: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },
}

/// Error type for persistent service state file operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// Error reading the state file from disk.
    #[error("Failed to read service state file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing JSON contents of the state file.
    #[error("Failed to parse service state file: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Attempted to update or remove a non-existent service entry.
    #[error("Service not found in state file")]
    ServiceNotFound,
}

/// Error type for log viewing.
#[derive(Debug, Error)]
pub enum LogsError {
    /// No log file exists yet for the service.
    #[error("No {kind} log found for service '{service}'")]
    LogUnavailable {
        /// The service identifier.
        service: String,
        /// The log stream that was requested.
        kind: String,
    },

    /// Error reading the log file.
    #[error("Failed to read log: {0}")]
    Io(#[from] std::io::Error),
}
