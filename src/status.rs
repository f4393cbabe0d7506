//! Status reporting for a registered service.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

use crate::{
    config::Config,
    error::SupervisorError,
    ipc::{self, ControlCommand, ControlError, ControlResponse, SupervisorSnapshot},
    registry::{self, Backend},
    state::{ServiceState, StateFile},
    worker,
};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const MAGENTA_BOLD: &str = "\x1b[1;35m";
const RESET: &str = "\x1b[0m";

/// Resource usage of the live worker.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerStats {
    pub pid: u32,
    pub uptime_secs: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
}

/// Everything `tradesup status` knows about a service.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub id: String,
    pub display_name: String,
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerStats>,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// The configuration on disk no longer matches the one registered.
    pub config_drift: bool,
}

/// Builds the report from the registry, the state file, and the live supervisor if any.
pub fn collect_status(config: &Config) -> Result<StatusReport, SupervisorError> {
    let id = config.service.id.as_str();
    let mut report = StatusReport {
        id: id.to_string(),
        display_name: config.service.display_name.clone(),
        state: ServiceState::Uninstalled,
        backend: None,
        installed_at: None,
        supervisor_pid: None,
        worker: None,
        restarts: 0,
        last_exit_code: None,
        last_signal: None,
        last_error: None,
        config_drift: false,
    };

    let Some(registration) = registry::find_registration(id)? else {
        return Ok(report);
    };
    report.display_name = registration.display_name.clone();
    report.backend = Some(registration.backend);
    report.installed_at = Some(registration.installed_at);
    report.config_drift = registration.config_hash != config.compute_hash();

    let entry = StateFile::load()?.get(id).cloned();
    report.state = ServiceState::Stopped;
    if let Some(entry) = &entry {
        report.state = entry.state;
        report.restarts = entry.restarts;
        report.last_exit_code = entry.last_exit_code;
        report.last_signal = entry.last_signal;
        report.last_error = entry.last_error.clone();
    }

    match live_snapshot(id) {
        Some(snapshot) => {
            report.state = snapshot.state;
            report.supervisor_pid = Some(snapshot.supervisor_pid);
            report.restarts = snapshot.restarts;
            report.worker = snapshot.worker_pid.map(|pid| {
                let mut stats = sample_worker(pid);
                stats.uptime_secs = snapshot.worker_uptime_secs.or(stats.uptime_secs);
                stats
            });
        }
        None => {
            let supervisor_alive = entry
                .as_ref()
                .and_then(|entry| entry.supervisor_pid)
                .filter(|pid| worker::process_alive(*pid));
            match supervisor_alive {
                Some(pid) => {
                    // Supervisor is up but not answering yet (e.g. during pre-start).
                    report.supervisor_pid = Some(pid);
                    report.worker = entry
                        .as_ref()
                        .and_then(|entry| entry.worker_pid)
                        .filter(|pid| worker::process_alive(*pid))
                        .map(sample_worker);
                }
                None if matches!(
                    report.state,
                    ServiceState::Running | ServiceState::StopPending
                ) =>
                {
                    debug!("State file lists '{id}' as {} but no supervisor is alive", report.state);
                    report.state = ServiceState::Stopped;
                    report.last_error.get_or_insert_with(|| "supervisor exited unexpectedly".into());
                }
                None => {}
            }
        }
    }

    Ok(report)
}

fn live_snapshot(id: &str) -> Option<SupervisorSnapshot> {
    match ipc::send_command(id, &ControlCommand::Status) {
        Ok(ControlResponse::Status(snapshot)) => Some(snapshot),
        Ok(other) => {
            debug!("Unexpected status response from supervisor of '{id}': {other:?}");
            None
        }
        Err(ControlError::NotAvailable) => None,
        Err(err) => {
            debug!("Status query for '{id}' failed: {err}");
            None
        }
    }
}

fn sample_worker(pid: u32) -> WorkerStats {
    let mut system = System::new();
    let pid_sys = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid_sys]),
        true,
        ProcessRefreshKind::everything(),
    );

    match system.process(pid_sys) {
        Some(process) => WorkerStats {
            pid,
            uptime_secs: Some(process.run_time()),
            memory_bytes: Some(process.memory()),
            cpu_percent: Some(process.cpu_usage()),
        },
        None => WorkerStats {
            pid,
            uptime_secs: None,
            memory_bytes: None,
            cpu_percent: None,
        },
    }
}

/// Formats seconds as `1d 2h 3m 4s`, dropping leading zero units.
pub fn format_elapsed(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Human-readable rendering in the style of `systemctl status`.
pub fn render(report: &StatusReport) -> String {
    let mut out = String::new();
    let (color, label) = match report.state {
        ServiceState::Running => (GREEN_BOLD, "Running"),
        ServiceState::StopPending => (YELLOW_BOLD, "Stopping"),
        ServiceState::Stopped if report.last_error.is_some() => (RED_BOLD, "Stopped"),
        ServiceState::Stopped => (RESET, "Stopped"),
        ServiceState::Uninstalled => (RESET, "Not installed"),
    };

    let _ = writeln!(
        out,
        "{color}● {} ({}) - {label}{RESET}",
        report.display_name, report.id
    );

    if let Some(backend) = report.backend {
        let installed = report
            .installed_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".into());
        let _ = writeln!(out, "   Loaded: {backend} registration (installed {installed})");
    }
    if let Some(pid) = report.supervisor_pid {
        let _ = writeln!(out, " Supervisor PID: {pid}");
    }
    if let Some(worker) = &report.worker {
        let _ = writeln!(out, " Main PID: {}", worker.pid);
        if let Some(uptime) = worker.uptime_secs {
            let _ = writeln!(out, "   Uptime: {}", format_elapsed(uptime));
        }
        if let Some(memory) = worker.memory_bytes {
            let _ = writeln!(
                out,
                "   {MAGENTA_BOLD}Memory: {:.1}M{RESET}",
                memory as f64 / (1024.0 * 1024.0)
            );
        }
        if let Some(cpu) = worker.cpu_percent {
            let _ = writeln!(out, "      {MAGENTA_BOLD}CPU: {cpu:.1}%{RESET}");
        }
    }
    if report.backend.is_some() {
        let _ = writeln!(out, " Restarts: {}", report.restarts);
    }
    match (report.last_exit_code, report.last_signal) {
        (Some(code), _) => {
            let _ = writeln!(out, " Last exit: code {code}");
        }
        (None, Some(signal)) => {
            let _ = writeln!(out, " Last exit: signal {signal}");
        }
        _ => {}
    }
    if let Some(error) = &report.last_error {
        let _ = writeln!(out, "    {RED_BOLD}Error: {error}{RESET}");
    }
    if report.config_drift {
        let _ = writeln!(
            out,
            "  {YELLOW_BOLD}Configuration changed since install; reinstall to apply it{RESET}"
        );
    }

    out
}
