//! Runtime paths and privilege modes.
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock, RwLockReadGuard},
};

use nix::unistd::geteuid;

/// Where to store registrations, state and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// User home dir (~/.local/share/tradesup).
    User,
    /// System dirs (/var/lib/tradesup). Mutations require root.
    System,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    mode: RuntimeMode,
    state_dir: PathBuf,
    log_dir: PathBuf,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_mode(RuntimeMode::User)))
}

fn read_context() -> RwLockReadGuard<'static, RuntimeContext> {
    context_lock()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RuntimeContext {
    fn from_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => Self::user_directories(),
            RuntimeMode::System => Self::system_directories(),
        }
    }

    fn user_directories() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        let state_dir = home.join(".local/share/tradesup");
        let log_dir = state_dir.join("logs");

        Self {
            mode: RuntimeMode::User,
            state_dir,
            log_dir,
        }
    }

    fn system_directories() -> Self {
        Self {
            mode: RuntimeMode::System,
            state_dir: PathBuf::from("/var/lib/tradesup"),
            log_dir: PathBuf::from("/var/log/tradesup"),
        }
    }
}

/// Sets runtime mode. Re-reads `HOME` so it can be called again after the environment changes.
pub fn init(mode: RuntimeMode) {
    let mut guard = context_lock()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = RuntimeContext::from_mode(mode);
}

/// Returns the current runtime mode (User or System).
pub fn mode() -> RuntimeMode {
    read_context().mode
}

/// State dir (registry, state file, control sockets).
pub fn state_dir() -> PathBuf {
    read_context().state_dir.clone()
}

/// Log directory.
pub fn log_dir() -> PathBuf {
    read_context().log_dir.clone()
}

/// Whether the current process runs with an effective uid of root.
pub fn is_privileged() -> bool {
    geteuid().is_root()
}

/// Whether registration changes need root in the current mode.
pub fn requires_privilege() -> bool {
    mode() == RuntimeMode::System
}
