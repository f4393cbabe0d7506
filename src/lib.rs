//! tradesup runs a long-lived trading worker as a supervised background service. It
//! registers the service with the host, starts a supervisor that keeps exactly one
//! worker alive with bounded, backed-off restarts, and stops it by terminating the
//! worker's whole process group.

/// Restart policy and backoff.
pub mod backoff;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Install, start, stop and uninstall operations.
pub mod controller;

/// Error handling.
pub mod error;

/// Control socket between the CLI and a running supervisor.
pub mod ipc;

/// Logs management.
pub mod logs;

/// Service registrations and host service-manager backends.
pub mod registry;

/// Runtime directories and privilege mode.
pub mod runtime;

/// Persisted lifecycle state.
pub mod state;

/// Status reporting.
pub mod status;

/// The supervisor loop that owns the worker.
pub mod supervisor;

/// Worker process management.
pub mod worker;

#[doc(hidden)]
pub mod test_utils;
