#[path = "common/mod.rs"]
mod common;

use common::{HomeEnvGuard, trading_config_yaml, write_config, write_looping_worker};
use tempfile::tempdir;
use tradesup::{
    config::load_config,
    controller,
    error::SupervisorError,
    registry::{self, Backend},
    runtime::{self, RuntimeMode},
    state::{ServiceState, StateFile},
};

#[test]
fn install_registers_service_as_stopped() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let script = write_looping_worker(temp.path());
    let config_path = write_config(temp.path(), &trading_config_yaml(&script));
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();

    let registration = controller::install(&config, Backend::File).unwrap();
    assert_eq!(registration.id, "TradingSystem");
    assert_eq!(registration.display_name, "Multi-Asset Trading System");
    assert_eq!(
        registration.config_path.as_deref(),
        Some(config_path.canonicalize().unwrap().as_path())
    );
    assert!(registration.command_line.iter().any(|arg| arg == "run"));

    let stored = registry::find_registration("TradingSystem").unwrap().unwrap();
    assert_eq!(stored, registration);
    assert_eq!(
        StateFile::load().unwrap().state_of("TradingSystem"),
        ServiceState::Stopped
    );
}

#[test]
fn duplicate_install_leaves_existing_registration_untouched() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let script = write_looping_worker(temp.path());
    let config_path = write_config(temp.path(), &trading_config_yaml(&script));
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();

    let original = controller::install(&config, Backend::File).unwrap();

    let mut impostor = config.clone();
    impostor.service.display_name = "Somebody Else".into();
    match controller::install(&impostor, Backend::File) {
        Err(SupervisorError::DuplicateRegistration { id }) => assert_eq!(id, "TradingSystem"),
        other => panic!("expected duplicate registration, got {other:?}"),
    }

    let stored = registry::find_registration("TradingSystem").unwrap().unwrap();
    assert_eq!(stored, original);
    assert_eq!(registry::list_registrations().unwrap().len(), 1);
}

#[test]
fn uninstall_removes_registration_and_state() {
    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let script = write_looping_worker(temp.path());
    let config_path = write_config(temp.path(), &trading_config_yaml(&script));
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();

    controller::install(&config, Backend::File).unwrap();
    let removed = controller::uninstall(&config).unwrap();
    assert_eq!(removed.id, "TradingSystem");

    assert!(registry::find_registration("TradingSystem").unwrap().is_none());
    assert_eq!(
        StateFile::load().unwrap().state_of("TradingSystem"),
        ServiceState::Uninstalled
    );
    assert!(matches!(
        controller::uninstall(&config),
        Err(SupervisorError::NotInstalled { .. })
    ));

    // A fresh install works again after uninstall.
    controller::install(&config, Backend::File).unwrap();
}

#[test]
fn system_mode_requires_root() {
    if nix::unistd::geteuid().is_root() {
        eprintln!("Skipping system_mode_requires_root: running as root");
        return;
    }

    let temp = tempdir().expect("failed to create tempdir");
    let _home = HomeEnvGuard::set(&temp.path().join("home"));
    let script = write_looping_worker(temp.path());
    let config_path = write_config(temp.path(), &trading_config_yaml(&script));
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();

    runtime::init(RuntimeMode::System);
    let result = controller::install(&config, Backend::File);
    runtime::init(RuntimeMode::User);

    match result {
        Err(SupervisorError::InsufficientPrivilege { operation }) => {
            assert_eq!(operation, "install")
        }
        other => panic!("expected privilege error, got {other:?}"),
    }
}
