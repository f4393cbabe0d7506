//! Lifecycle states of a registered service and their on-disk record.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use fs2::FileExt;
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    path::PathBuf,
};
use strum::{AsRefStr, Display};

use crate::{error::StateError, runtime};

/// State file name inside the runtime state directory.
pub const STATE_FILE_NAME: &str = "state.json";
const STATE_LOCK_SUFFIX: &str = ".lock";

/// Lifecycle of a service as seen by the supervisor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceState {
    /// No registration exists.
    Uninstalled,
    /// Registered but no supervisor is running.
    Stopped,
    /// Supervisor is running and owns a worker.
    Running,
    /// A stop was requested and the worker is being terminated.
    StopPending,
}

impl ServiceState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Same-state moves are accepted so that repeated writes are harmless.
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        self == next
            || matches!(
                (self, next),
                (Uninstalled, Stopped)
                    | (Stopped, Running)
                    | (Stopped, Uninstalled)
                    | (Running, StopPending)
                    | (Running, Stopped)
                    | (StopPending, Stopped)
            )
    }
}

/// Persisted runtime metadata for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStateEntry {
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<u32>,
    #[serde(default)]
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceStateEntry {
    /// Fresh entry for a service that has just been installed.
    pub fn stopped() -> Self {
        Self {
            state: ServiceState::Stopped,
            supervisor_pid: None,
            worker_pid: None,
            restarts: 0,
            last_exit_code: None,
            last_signal: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Persistent record of the last-known state for every registered service.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct StateFile {
    services: HashMap<String, ServiceStateEntry>,
}

impl StateFile {
    fn path() -> PathBuf {
        runtime::state_dir().join(STATE_FILE_NAME)
    }

    /// Loads the state file, returning an empty record when none exists yet.
    pub fn load() -> Result<Self, StateError> {
        let path = Self::path();
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let state = serde_json::from_str::<Self>(&contents)?;
        Ok(state)
    }

    /// Writes the state file atomically through a sibling temp file.
    fn save(&self) -> Result<(), StateError> {
        let path = Self::path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(tmp, &path)?;
        Ok(())
    }

    pub fn services(&self) -> &HashMap<String, ServiceStateEntry> {
        &self.services
    }

    pub fn get(&self, service: &str) -> Option<&ServiceStateEntry> {
        self.services.get(service)
    }

    /// Current state, `Uninstalled` when the service has no entry.
    pub fn state_of(&self, service: &str) -> ServiceState {
        self.get(service)
            .map(|entry| entry.state)
            .unwrap_or(ServiceState::Uninstalled)
    }

    /// Applies `update` to the entry for `service` and saves.
    ///
    /// The entry is re-read under the state lock first, so concurrent writers never
    /// overwrite each other's fields.
    pub fn update<F>(&mut self, service: &str, update: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut ServiceStateEntry),
    {
        self.modify(|states| {
            let entry = states
                .services
                .get_mut(service)
                .ok_or(StateError::ServiceNotFound)?;
            update(entry);
            entry.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Inserts or replaces the entry for `service` and saves.
    pub fn set(&mut self, service: &str, entry: ServiceStateEntry) -> Result<(), StateError> {
        self.modify(|states| {
            states.services.insert(service.to_string(), entry);
            Ok(())
        })
    }

    pub fn remove(&mut self, service: &str) -> Result<(), StateError> {
        self.modify(|states| {
            states
                .services
                .remove(service)
                .map(|_| ())
                .ok_or(StateError::ServiceNotFound)
        })
    }

    /// Locked read-modify-write of the whole file. `self` is refreshed with what was saved.
    fn modify<F>(&mut self, change: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut Self) -> Result<(), StateError>,
    {
        let _lock = StateLock::acquire()?;
        let mut current = Self::load()?;
        change(&mut current)?;
        current.save()?;
        *self = current;
        Ok(())
    }
}

/// Exclusive advisory lock on the state file, released on drop.
struct StateLock {
    file: File,
}

impl StateLock {
    fn acquire() -> Result<Self, StateError> {
        let dir = runtime::state_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{STATE_FILE_NAME}{STATE_LOCK_SUFFIX}"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
