//! Service registrations and the host service-manager backends that persist them.
//!
//! Every backend records registrations in `registry.json` under the runtime state
//! directory so that status and uninstall work the same way regardless of how the
//! host launches the supervisor. The systemd backend additionally writes a unit file
//! and hands `start` over to `systemctl`.
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    fs::{self, File, OpenOptions},
    path::PathBuf,
    process::Command,
    time::Duration,
};
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, info, warn};

use crate::{
    error::{RegistryError, SupervisorError},
    runtime::{self, RuntimeMode},
};

/// Registry file name inside the runtime state directory.
pub const REGISTRY_FILE_NAME: &str = "registry.json";
const REGISTRY_LOCK_SUFFIX: &str = ".lock";

/// Which host mechanism owns the registration.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Backend {
    /// Registration lives only in the tradesup registry; `start` daemonises directly.
    #[default]
    File,
    /// Registration is mirrored into a systemd unit; `start` goes through `systemctl`.
    Systemd,
}

/// The OS-side record of an installed service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRegistration {
    /// Unique service identifier.
    pub id: String,
    /// Human-readable display name.
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Command line the host runs to launch the supervisor.
    pub command_line: Vec<String>,
    /// Configuration file the supervisor loads, when one was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    /// Fingerprint of the configuration at install time.
    pub config_hash: String,
    /// Stop grace period, mirrored into unit files.
    #[serde(default)]
    pub stop_timeout_secs: u64,
    pub backend: Backend,
    pub installed_at: DateTime<Utc>,
}

/// Result of asking a backend to launch an installed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// The caller must start the supervisor itself.
    Direct,
    /// The host service manager started the supervisor.
    Delegated,
}

/// Host service-control primitives keyed by service identifier.
pub trait ServiceManager: fmt::Debug {
    /// Which backend this is.
    fn backend(&self) -> Backend;

    /// Persists a new registration. Fails if the identifier is already taken.
    fn install(&self, registration: &ServiceRegistration) -> Result<(), SupervisorError>;

    /// Removes a registration and returns what was removed.
    fn uninstall(&self, id: &str) -> Result<ServiceRegistration, SupervisorError>;

    /// Looks up a registration.
    fn query(&self, id: &str) -> Result<Option<ServiceRegistration>, SupervisorError>;

    /// Asks the host to launch the supervisor for an installed service.
    fn launch(&self, registration: &ServiceRegistration) -> Result<Launch, SupervisorError>;
}

/// Refuses registry mutations in system mode unless running as root.
pub fn ensure_privileged(operation: &str) -> Result<(), SupervisorError> {
    if runtime::requires_privilege() && !runtime::is_privileged() {
        return Err(SupervisorError::InsufficientPrivilege {
            operation: operation.to_string(),
        });
    }
    Ok(())
}

/// On-disk map of registrations.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    services: BTreeMap<String, ServiceRegistration>,
}

impl RegistryFile {
    fn path() -> PathBuf {
        runtime::state_dir().join(REGISTRY_FILE_NAME)
    }

    fn load() -> Result<Self, RegistryError> {
        let path = Self::path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self) -> Result<(), RegistryError> {
        let path = Self::path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

/// Exclusive advisory lock held for the duration of a registry read-modify-write.
struct RegistryLock {
    file: File,
}

impl RegistryLock {
    fn acquire() -> Result<Self, RegistryError> {
        let dir = runtime::state_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{REGISTRY_FILE_NAME}{REGISTRY_LOCK_SUFFIX}"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn insert_registration(registration: &ServiceRegistration) -> Result<(), SupervisorError> {
    let _lock = RegistryLock::acquire()?;
    let mut registry = RegistryFile::load()?;
    if registry.services.contains_key(&registration.id) {
        return Err(SupervisorError::DuplicateRegistration {
            id: registration.id.clone(),
        });
    }
    registry
        .services
        .insert(registration.id.clone(), registration.clone());
    registry.save()?;
    Ok(())
}

fn remove_registration(id: &str) -> Result<ServiceRegistration, SupervisorError> {
    let _lock = RegistryLock::acquire()?;
    let mut registry = RegistryFile::load()?;
    let removed = registry
        .services
        .remove(id)
        .ok_or_else(|| SupervisorError::NotInstalled { id: id.to_string() })?;
    registry.save()?;
    Ok(removed)
}

/// Looks up a registration regardless of which backend owns it.
pub fn find_registration(id: &str) -> Result<Option<ServiceRegistration>, SupervisorError> {
    Ok(RegistryFile::load()?.services.get(id).cloned())
}

/// Lists every registration known to this runtime mode.
pub fn list_registrations() -> Result<Vec<ServiceRegistration>, SupervisorError> {
    Ok(RegistryFile::load()?.services.into_values().collect())
}

/// Registry-only backend.
#[derive(Debug, Default, Clone)]
pub struct FileServiceManager;

impl ServiceManager for FileServiceManager {
    fn backend(&self) -> Backend {
        Backend::File
    }

    fn install(&self, registration: &ServiceRegistration) -> Result<(), SupervisorError> {
        ensure_privileged("install")?;
        insert_registration(registration)?;
        info!(
            "Registered service '{}' ({})",
            registration.id, registration.display_name
        );
        Ok(())
    }

    fn uninstall(&self, id: &str) -> Result<ServiceRegistration, SupervisorError> {
        ensure_privileged("uninstall")?;
        let removed = remove_registration(id)?;
        info!("Removed registration for service '{id}'");
        Ok(removed)
    }

    fn query(&self, id: &str) -> Result<Option<ServiceRegistration>, SupervisorError> {
        find_registration(id)
    }

    fn launch(&self, _registration: &ServiceRegistration) -> Result<Launch, SupervisorError> {
        Ok(Launch::Direct)
    }
}

/// Backend that mirrors registrations into systemd unit files.
#[derive(Debug, Clone)]
pub struct SystemdServiceManager {
    unit_dir: PathBuf,
    systemctl: String,
    user_scope: bool,
}

impl SystemdServiceManager {
    /// Targets the system or user systemd instance depending on the runtime mode.
    pub fn for_runtime() -> Self {
        match runtime::mode() {
            RuntimeMode::System => Self {
                unit_dir: PathBuf::from("/etc/systemd/system"),
                systemctl: "systemctl".into(),
                user_scope: false,
            },
            RuntimeMode::User => {
                let home = std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/"));
                Self {
                    unit_dir: home.join(".config/systemd/user"),
                    systemctl: "systemctl".into(),
                    user_scope: true,
                }
            }
        }
    }

    /// Custom unit directory and `systemctl` program.
    pub fn new(unit_dir: impl Into<PathBuf>, systemctl: impl Into<String>, user_scope: bool) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            systemctl: systemctl.into(),
            user_scope,
        }
    }

    /// Path of the unit file for a service identifier.
    pub fn unit_path(&self, id: &str) -> PathBuf {
        self.unit_dir.join(format!("{id}.service"))
    }

    fn systemctl(&self, args: &[&str]) -> Result<(), SupervisorError> {
        let mut cmd = Command::new(&self.systemctl);
        if self.user_scope {
            cmd.arg("--user");
        }
        cmd.args(args);
        debug!("Running {cmd:?}");

        let status = cmd.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(RegistryError::CommandFailed {
                command: format!("{} {}", self.systemctl, args.join(" ")),
                code: status.code(),
            }
            .into())
        }
    }

    /// Renders the unit file for a registration.
    pub fn render_unit(&self, registration: &ServiceRegistration) -> String {
        let exec_start = registration
            .command_line
            .iter()
            .map(|arg| quote_unit_arg(arg))
            .collect::<Vec<_>>()
            .join(" ");
        let wanted_by = if self.user_scope {
            "default.target"
        } else {
            "multi-user.target"
        };
        let description = registration
            .description
            .as_deref()
            .unwrap_or(&registration.display_name);
        // The supervisor restarts the worker itself; systemd only keeps the supervisor.
        let stop_timeout = Duration::from_secs(registration.stop_timeout_secs + 5);

        format!(
            "[Unit]\n\
             Description={description}\n\
             After=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={exec_start}\n\
             Restart=no\n\
             KillMode=mixed\n\
             TimeoutStopSec={}\n\
             \n\
             [Install]\n\
             WantedBy={wanted_by}\n",
            stop_timeout.as_secs()
        )
    }
}

fn quote_unit_arg(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '"' | '\'' | '\\' | '$' | '%'))
    {
        return arg.to_string();
    }
    let escaped = arg
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "$$")
        .replace('%', "%%");
    format!("\"{escaped}\"")
}

impl ServiceManager for SystemdServiceManager {
    fn backend(&self) -> Backend {
        Backend::Systemd
    }

    fn install(&self, registration: &ServiceRegistration) -> Result<(), SupervisorError> {
        ensure_privileged("install")?;

        let unit_path = self.unit_path(&registration.id);
        if unit_path.exists() {
            return Err(SupervisorError::DuplicateRegistration {
                id: registration.id.clone(),
            });
        }

        insert_registration(registration)?;

        let written = fs::create_dir_all(&self.unit_dir)
            .and_then(|_| fs::write(&unit_path, self.render_unit(registration)));
        let enabled = written.map_err(SupervisorError::from).and_then(|_| {
            self.systemctl(&["daemon-reload"])?;
            self.systemctl(&["enable", &format!("{}.service", registration.id)])
        });

        if let Err(err) = enabled {
            warn!(
                "Rolling back registration of '{}' after systemd failure: {err}",
                registration.id
            );
            let _ = fs::remove_file(&unit_path);
            let _ = remove_registration(&registration.id);
            return Err(err);
        }

        info!(
            "Registered systemd unit {} for '{}'",
            unit_path.display(),
            registration.id
        );
        Ok(())
    }

    fn uninstall(&self, id: &str) -> Result<ServiceRegistration, SupervisorError> {
        ensure_privileged("uninstall")?;

        let unit = format!("{id}.service");
        if let Err(err) = self.systemctl(&["disable", &unit]) {
            warn!("Failed to disable {unit}: {err}");
        }

        let unit_path = self.unit_path(id);
        if unit_path.exists() {
            fs::remove_file(&unit_path)?;
        }
        if let Err(err) = self.systemctl(&["daemon-reload"]) {
            warn!("systemd reload after removing {unit} failed: {err}");
        }

        remove_registration(id)
    }

    fn query(&self, id: &str) -> Result<Option<ServiceRegistration>, SupervisorError> {
        find_registration(id)
    }

    fn launch(&self, registration: &ServiceRegistration) -> Result<Launch, SupervisorError> {
        self.systemctl(&["start", &format!("{}.service", registration.id)])?;
        Ok(Launch::Delegated)
    }
}

/// Builds the manager for a backend in the current runtime mode.
pub fn manager_for(backend: Backend) -> Box<dyn ServiceManager> {
    match backend {
        Backend::File => Box::new(FileServiceManager),
        Backend::Systemd => Box::new(SystemdServiceManager::for_runtime()),
    }
}

/// Builds the manager that owns an existing registration.
pub fn manager_for_id(id: &str) -> Result<Box<dyn ServiceManager>, SupervisorError> {
    let registration =
        find_registration(id)?.ok_or_else(|| SupervisorError::NotInstalled { id: id.to_string() })?;
    Ok(manager_for(registration.backend))
}
