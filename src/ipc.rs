//! Control channel between CLI invocations and a running supervisor.
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::PathBuf,
    time::Duration,
};
use thiserror::Error;

use crate::{runtime, state::ServiceState};

const CONTROL_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Directory where runtime artifacts (PID/socket files) are stored.
fn runtime_dir() -> Result<PathBuf, ControlError> {
    let path = runtime::state_dir();
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// Returns the unix socket path used to reach the supervisor of `service`.
pub fn socket_path(service: &str) -> Result<PathBuf, ControlError> {
    Ok(runtime_dir()?.join(format!("{service}.sock")))
}

/// Returns the path where the supervisor PID of `service` is recorded.
pub fn supervisor_pid_path(service: &str) -> Result<PathBuf, ControlError> {
    Ok(runtime_dir()?.join(format!("{service}.pid")))
}

/// Returns the path of the lock file a live supervisor of `service` holds.
pub fn supervisor_lock_path(service: &str) -> Result<PathBuf, ControlError> {
    Ok(runtime_dir()?.join(format!("{service}.lock")))
}

/// Exclusive ownership of a service by one supervisor, released on drop.
///
/// The lock file itself is never removed, only unlocked.
#[derive(Debug)]
pub struct SupervisorLock {
    file: File,
}

impl SupervisorLock {
    /// Takes the lock without blocking. `Ok(None)` means another supervisor owns the service.
    pub fn try_acquire(service: &str) -> Result<Option<Self>, ControlError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(supervisor_lock_path(service)?)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for SupervisorLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Message sent from CLI invocations to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Stop the worker and exit the supervisor.
    Stop,
    /// Report live worker details.
    Status,
}

/// Live view of the supervisor, answered to `ControlCommand::Status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorSnapshot {
    pub state: ServiceState,
    pub supervisor_pid: u32,
    pub worker_pid: Option<u32>,
    pub worker_uptime_secs: Option<u64>,
    pub restarts: u32,
}

/// Response sent by the supervisor.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Message(String),
    Status(SupervisorSnapshot),
    Error(String),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialise control message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("supervisor reported error: {0}")]
    Server(String),
    #[error("control socket not available")]
    NotAvailable,
}

/// Sends a command to the supervisor of `service` and waits for a response.
pub fn send_command(
    service: &str,
    command: &ControlCommand,
) -> Result<ControlResponse, ControlError> {
    let path = socket_path(service)?;
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = match UnixStream::connect(&path) {
        Ok(stream) => stream,
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) =>
        {
            return Err(ControlError::NotAvailable);
        }
        Err(err) => return Err(err.into()),
    };
    stream.set_read_timeout(Some(CONTROL_IO_TIMEOUT))?;
    stream.set_write_timeout(Some(CONTROL_IO_TIMEOUT))?;

    let payload = serde_json::to_vec(command)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    if response_line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    let response: ControlResponse = serde_json::from_str(response_line.trim())?;
    if let ControlResponse::Error(message) = &response {
        return Err(ControlError::Server(message.clone()));
    }

    Ok(response)
}

/// Utility to read a command from a `UnixStream`. Used by the supervisor listener.
pub fn read_command(stream: &mut UnixStream) -> Result<ControlCommand, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty control command",
        )));
    }

    Ok(serde_json::from_str(line.trim())?)
}

/// Writes a response to the connected CLI client.
pub fn write_response(
    stream: &mut UnixStream,
    response: &ControlResponse,
) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(response)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// Persists the supervisor PID for later CLI detection.
pub fn write_supervisor_pid(service: &str, pid: u32) -> Result<(), ControlError> {
    let path = supervisor_pid_path(service)?;
    fs::write(path, pid.to_string())?;
    Ok(())
}

/// Reads the supervisor PID if present.
pub fn read_supervisor_pid(service: &str) -> Result<Option<u32>, ControlError> {
    let path = supervisor_pid_path(service)?;
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    contents
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|e| ControlError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Clears the supervisor PID and removes the socket file.
pub fn cleanup_runtime(service: &str) -> Result<(), ControlError> {
    if let Ok(path) = socket_path(service)
        && path.exists()
    {
        let _ = fs::remove_file(path);
    }

    if let Ok(pid_path) = supervisor_pid_path(service)
        && pid_path.exists()
    {
        let _ = fs::remove_file(pid_path);
    }

    Ok(())
}
