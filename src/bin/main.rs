use std::{
    env,
    error::Error,
    io,
    process::ExitCode,
    sync::Mutex,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tradesup::{
    cli::{Cli, Commands, LogLevelArg, parse_args},
    config::{Config, load_config},
    controller::{self, StartOutcome, StopOutcome},
    error::SupervisorError,
    logs::{self, LogKind},
    runtime::{self, RuntimeMode},
    status,
    supervisor::Supervisor,
};

fn main() -> ExitCode {
    let args = parse_args();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<(), Box<dyn Error>> {
    let Cli {
        log_level,
        sys,
        command,
    } = args;
    runtime::init(if sys {
        RuntimeMode::System
    } else {
        RuntimeMode::User
    });

    match command {
        Commands::Install { config, backend } => {
            let config = prepare(config.as_deref(), log_level, false)?;
            let registration = controller::install(&config, backend)?;
            println!(
                "Installed '{}' ({}) with the {} backend",
                registration.id, registration.display_name, registration.backend
            );
        }
        Commands::Uninstall { config } => {
            let config = prepare(config.as_deref(), log_level, false)?;
            let removed = controller::uninstall(&config)?;
            println!("Uninstalled '{}'", removed.id);
        }
        Commands::Start { config, foreground } => {
            let config = prepare(config.as_deref(), log_level, foreground)?;
            let id = config.service.id.clone();
            if foreground {
                controller::prepare_start(&config)?;
                run_supervisor(config)?;
            } else {
                match controller::start(&config)? {
                    StartOutcome::Running { supervisor_pid } => {
                        println!("Started '{id}' (supervisor PID {supervisor_pid})")
                    }
                    StartOutcome::Starting => {
                        println!("'{id}' is still starting; check `tradesup status`")
                    }
                }
            }
        }
        Commands::Stop { config } => {
            let config = prepare(config.as_deref(), log_level, false)?;
            let id = &config.service.id;
            match controller::stop(&config)? {
                StopOutcome::Stopped => println!("Stopped '{id}'"),
                StopOutcome::AlreadyStopped => println!("'{id}' is not running"),
            }
        }
        Commands::Status { config, json } => {
            let config = prepare(config.as_deref(), log_level, false)?;
            let report = status::collect_status(&config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", status::render(&report));
            }
        }
        Commands::Logs {
            config,
            lines,
            kind,
        } => {
            let config = prepare(config.as_deref(), log_level, false)?;
            for line in logs::tail_log(&config.service.id, kind, lines)? {
                println!("{line}");
            }
        }
        Commands::Run {
            config,
            project_dir,
        } => {
            if let Some(dir) = project_dir {
                env::set_current_dir(&dir)?;
            }
            let config = prepare(config.as_deref(), log_level, true)?;
            run_supervisor(config)?;
        }
    }

    Ok(())
}

/// Loads the configuration and sets up logging; supervisor processes also log to a file.
fn prepare(
    path: Option<&str>,
    log_level: Option<LogLevelArg>,
    supervisor_log: bool,
) -> Result<Config, SupervisorError> {
    match load_config(path) {
        Ok(config) => {
            init_logging(
                log_level,
                supervisor_log.then_some(config.service.id.as_str()),
            );
            Ok(config)
        }
        Err(err) => {
            init_logging(log_level, None);
            error!("Failed to load configuration: {err}");
            Err(err)
        }
    }
}

fn init_logging(log_level: Option<LogLevelArg>, supervisor_log: Option<&str>) {
    let filter = if let Some(level) = log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let file_layer = supervisor_log.and_then(|service| {
        match logs::open_log_file(service, LogKind::Supervisor) {
            Ok(file) => Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            Err(err) => {
                eprintln!("Cannot open supervisor log for '{service}': {err}");
                None
            }
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init();
}

fn run_supervisor(config: Config) -> Result<(), Box<dyn Error>> {
    let mut supervisor = Supervisor::new(config)?;
    let stop = supervisor.stop_signal();
    ctrlc::set_handler(move || {
        info!("Termination signal received; stopping service");
        stop.trigger();
    })?;

    supervisor.run()?;
    Ok(())
}
