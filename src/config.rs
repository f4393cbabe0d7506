//! Configuration management for tradesup.
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};
use strum::{AsRefStr, Display, EnumString};

use crate::error::SupervisorError;

/// Configuration file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "tradesup.yaml";

/// Service identifier used when the configuration does not name one.
pub const DEFAULT_SERVICE_ID: &str = "TradingSystem";

/// Display name used when the configuration does not name one.
pub const DEFAULT_DISPLAY_NAME: &str = "Multi-Asset Trading System";

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(300);
const DEFAULT_MAX_RESTARTS: u32 = 5;
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Represents the structure of the configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// How the service is registered with the host.
    pub service: ServiceIdentity,
    /// The supervised worker process.
    pub worker: WorkerConfig,
    /// What happens when the worker exits on its own.
    pub restart: RestartConfig,
    /// Grace period between SIGTERM and SIGKILL when stopping the worker.
    pub stop_timeout: Option<String>,
    /// Commands that must succeed, in order, before the worker is spawned.
    pub pre_start: Vec<PreStartStep>,
    /// Root directory from which relative paths are resolved.
    pub project_dir: Option<String>,
    /// Absolute path of the file this configuration was loaded from.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Registration identity of the service.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceIdentity {
    /// Unique identifier the host service manager keys the registration on.
    pub id: String,
    /// Human-readable name shown by service tooling.
    pub display_name: String,
    /// Optional longer description.
    pub description: Option<String>,
}

impl Default for ServiceIdentity {
    fn default() -> Self {
        Self {
            id: DEFAULT_SERVICE_ID.to_string(),
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            description: None,
        }
    }
}

/// The long-running process the supervisor keeps alive.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program to execute. Resolved through `PATH` when not a path.
    pub command: String,
    /// Arguments passed verbatim to the program.
    pub args: Vec<String>,
    /// Working directory, relative to the project directory.
    pub working_dir: Option<String>,
    /// Optional environment variables for the worker.
    pub env: Option<EnvConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "python".to_string(),
            args: vec![
                "trading_system.py".to_string(),
                "--mode=continuous".to_string(),
            ],
            working_dir: None,
            env: None,
        }
    }
}

impl WorkerConfig {
    /// Full argv, program first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Represents environment variables for the worker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvConfig {
    /// Optional path to an environment file.
    pub file: Option<String>,
    /// Key-value pairs of environment variables.
    pub vars: Option<BTreeMap<String, String>>,
}

impl EnvConfig {
    /// Resolves the full path to the env file based on a base directory.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| {
            let path = Path::new(f);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
    }
}

/// When a worker exit should trigger a restart.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    EnumString,
    AsRefStr,
    Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RestartMode {
    /// Restart after any exit that was not requested.
    Always,
    /// Restart only after a non-zero exit code or a signal.
    #[default]
    OnFailure,
    /// Never restart; the service stops with the worker.
    Never,
}

/// Restart policy knobs as written in the configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Which exits trigger a restart.
    pub policy: RestartMode,
    /// Consecutive restarts allowed before the supervisor gives up.
    pub max_restarts: Option<u32>,
    /// Delay before the first restart.
    pub backoff: Option<String>,
    /// Upper bound on the delay between restarts.
    pub max_backoff: Option<String>,
    /// Growth factor applied to the delay after each attempt.
    pub multiplier: Option<f64>,
    /// Uptime after which a worker is considered healthy and the attempt counter resets.
    pub reset_after: Option<String>,
}

/// A command run to completion before the worker starts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PreStartStep {
    /// Bare shell command without a timeout.
    Command(String),
    /// Shell command with an optional timeout.
    Detailed {
        /// Shell command to execute.
        command: String,
        /// Optional timeout (e.g. "30s", "10m").
        timeout: Option<String>,
    },
}

impl PreStartStep {
    /// Shell command of the step.
    pub fn command(&self) -> &str {
        match self {
            PreStartStep::Command(command) => command,
            PreStartStep::Detailed { command, .. } => command,
        }
    }

    /// Parsed timeout, if one was configured.
    pub fn timeout(&self) -> Result<Option<Duration>, SupervisorError> {
        match self {
            PreStartStep::Detailed {
                timeout: Some(raw), ..
            } => parse_duration(raw).map(Some),
            _ => Ok(None),
        }
    }
}

impl Config {
    /// Directory against which relative paths are resolved.
    pub fn project_root(&self) -> PathBuf {
        self.project_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Working directory of the worker.
    pub fn worker_dir(&self) -> PathBuf {
        let root = self.project_root();
        match self.worker.working_dir.as_deref() {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => root.join(dir),
            None => root,
        }
    }

    /// Grace period granted to the worker on stop.
    pub fn stop_timeout(&self) -> Result<Duration, SupervisorError> {
        optional_duration(self.stop_timeout.as_deref(), DEFAULT_STOP_TIMEOUT)
    }

    /// SHA-256 fingerprint of everything that affects how the service runs.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        if let Ok(serialized) = serde_json::to_vec(self) {
            hasher.update(&serialized);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Checks values that serde cannot reject on its own.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let id = self.service.id.trim();
        if id.is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "service.id cannot be empty".into(),
            ));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(SupervisorError::InvalidConfig(format!(
                "service.id '{id}' may only contain letters, digits, '-', '_' and '.'"
            )));
        }
        if self.service.display_name.trim().is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "service.display_name cannot be empty".into(),
            ));
        }
        if self.worker.command.trim().is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "worker.command cannot be empty".into(),
            ));
        }
        if let Some(multiplier) = self.restart.multiplier
            && (!multiplier.is_finite() || multiplier < 1.0)
        {
            return Err(SupervisorError::InvalidConfig(format!(
                "restart.multiplier must be >= 1.0, got {multiplier}"
            )));
        }

        self.stop_timeout()?;
        self.restart.initial_backoff()?;
        self.restart.max_backoff()?;
        self.restart.reset_after()?;
        for step in &self.pre_start {
            step.timeout()?;
        }
        Ok(())
    }
}

impl RestartConfig {
    /// Delay before the first restart.
    pub fn initial_backoff(&self) -> Result<Duration, SupervisorError> {
        optional_duration(self.backoff.as_deref(), DEFAULT_BACKOFF)
    }

    /// Ceiling for the delay between restarts.
    pub fn max_backoff(&self) -> Result<Duration, SupervisorError> {
        optional_duration(self.max_backoff.as_deref(), DEFAULT_MAX_BACKOFF)
    }

    /// Healthy-uptime threshold that resets the attempt counter.
    pub fn reset_after(&self) -> Result<Duration, SupervisorError> {
        optional_duration(self.reset_after.as_deref(), DEFAULT_RESET_AFTER)
    }

    /// Restart budget.
    pub fn max_restarts(&self) -> u32 {
        self.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS)
    }

    /// Backoff growth factor.
    pub fn multiplier(&self) -> f64 {
        self.multiplier.unwrap_or(DEFAULT_MULTIPLIER)
    }
}

fn optional_duration(
    raw: Option<&str>,
    default: Duration,
) -> Result<Duration, SupervisorError> {
    raw.map(parse_duration).unwrap_or(Ok(default))
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, SupervisorError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(SupervisorError::InvalidConfig(
            "Duration value cannot be empty".into(),
        ));
    }

    let invalid = || SupervisorError::InvalidConfig(format!("Invalid duration value: '{raw}'"));

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex is valid")
    })
}

/// Expands `${VAR}` references, failing on the first variable that is not set.
fn expand_env_vars(input: &str) -> Result<String, SupervisorError> {
    let pattern = env_var_pattern();
    if let Some(missing) = pattern
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .find(|name| env::var(name).is_err())
    {
        return Err(SupervisorError::MissingEnvVar(missing));
    }

    let result = pattern.replace_all(input, |caps: &regex::Captures<'_>| {
        env::var(&caps[1]).unwrap_or_default()
    });
    Ok(result.into_owned())
}

/// Loads, expands, and validates the configuration.
///
/// When no path is given and `tradesup.yaml` is absent from the working directory, the
/// built-in defaults are used with the working directory as project root.
pub fn load_config(config_path: Option<&str>) -> Result<Config, SupervisorError> {
    let default_path = Path::new(DEFAULT_CONFIG_FILE);
    let config_path = match config_path {
        Some(path) => Path::new(path),
        None if default_path.exists() => default_path,
        None => {
            let config = Config {
                version: "1".into(),
                project_dir: Some(env::current_dir()?.to_string_lossy().to_string()),
                ..Config::default()
            };
            config.validate()?;
            return Ok(config);
        }
    };

    let content = fs::read_to_string(config_path).map_err(|e| {
        SupervisorError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded_content = expand_env_vars(&content)?;
    let mut config: Config = serde_yaml::from_str(&expanded_content)?;

    let absolute = if config_path.is_absolute() {
        config_path.to_path_buf()
    } else {
        env::current_dir()?.join(config_path)
    };
    let absolute = absolute.canonicalize().unwrap_or(absolute);

    let base_path = absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    config.project_dir = Some(match config.project_dir.as_deref() {
        Some(dir) if Path::new(dir).is_absolute() => dir.to_string(),
        Some(dir) => base_path.join(dir).to_string_lossy().to_string(),
        None => base_path.to_string_lossy().to_string(),
    });
    config.source = Some(absolute);

    config.validate()?;
    Ok(config)
}
