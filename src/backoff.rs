//! Bounded restart policy applied when the worker exits on its own.
use std::time::Duration;

use crate::{
    config::{RestartConfig, RestartMode},
    error::SupervisorError,
    worker::WorkerExit,
};

/// Resolved restart settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub mode: RestartMode,
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub reset_after: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &RestartConfig) -> Result<Self, SupervisorError> {
        Ok(Self {
            mode: config.policy,
            max_restarts: config.max_restarts(),
            initial_backoff: config.initial_backoff()?,
            max_backoff: config.max_backoff()?,
            multiplier: config.multiplier(),
            reset_after: config.reset_after()?,
        })
    }

    /// Whether this kind of exit is eligible for a restart at all.
    pub fn wants_restart(&self, exit: &WorkerExit) -> bool {
        match self.mode {
            RestartMode::Always => true,
            RestartMode::OnFailure => !exit.success(),
            RestartMode::Never => false,
        }
    }

    /// Delay before restart number `attempt` (1-based), capped at `max_backoff`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.powi(exponent);
        let scaled = self.initial_backoff.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// What the supervisor should do after an unrequested worker exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Spawn a new worker after `delay`.
    Restart { attempt: u32, delay: Duration },
    /// The exit is not eligible for a restart; the service stops.
    Stop,
    /// The restart budget is spent.
    GiveUp { attempts: u32 },
}

/// Counts consecutive restarts and turns exits into decisions.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    attempts: u32,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Consecutive restarts performed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records an exit after `uptime` of running and decides what comes next.
    ///
    /// A worker that stayed up for at least `reset_after` earns a fresh budget.
    pub fn record_exit(&mut self, exit: &WorkerExit, uptime: Duration) -> RestartDecision {
        if uptime >= self.policy.reset_after {
            self.attempts = 0;
        }

        if !self.policy.wants_restart(exit) {
            return RestartDecision::Stop;
        }

        if self.attempts >= self.policy.max_restarts {
            return RestartDecision::GiveUp {
                attempts: self.attempts,
            };
        }

        self.attempts += 1;
        RestartDecision::Restart {
            attempt: self.attempts,
            delay: self.policy.delay_for(self.attempts),
        }
    }
}
