//! Escalation after repeated link failures.
//!
//! When the radar cannot be reached a number of times in a row, the radio
//! stack itself is usually wedged. The [`RecoveryEscalator`] decides when that
//! threshold is reached and runs a [`Remediation`] (by default
//! `systemctl restart bluetooth`), then waits for the stack to come back.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::shutdown::Shutdown;

/// Consecutive failures before escalating.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Pause after a remediation attempt.
pub const DEFAULT_RECOVERY_SETTLE: Duration = Duration::from_secs(10);

/// Longest a remediation may run before it is abandoned.
pub const DEFAULT_REMEDIATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors raised by a remediation action.
#[derive(Debug, Error)]
pub enum RemediationError {
    /// No command configured.
    #[error("Remediation command is empty")]
    Empty,

    /// The command could not be started.
    #[error("Failed to run '{command}': {source}")]
    Spawn {
        /// Command line.
        command: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The action did not finish in time.
    #[error("'{command}' did not finish within {secs}s")]
    TimedOut {
        /// Command line.
        command: String,
        /// Limit that was exceeded.
        secs: u64,
    },

    /// The command ran and reported failure.
    #[error("'{command}' exited with {code}: {stderr}")]
    Failed {
        /// Command line.
        command: String,
        /// Exit code, or -1 if killed by a signal.
        code: i32,
        /// Captured standard error.
        stderr: String,
    },
}

/// An external action that resets the radio stack.
#[async_trait]
pub trait Remediation: Send + Sync {
    /// Run the action.
    async fn remediate(&self) -> Result<(), RemediationError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Runs an external command, e.g. `systemctl restart bluetooth`.
#[derive(Debug, Clone)]
pub struct CommandRemediation {
    program: String,
    args: Vec<String>,
}

impl CommandRemediation {
    /// Build from a command line split into program and arguments.
    ///
    /// # Errors
    ///
    /// Returns [`RemediationError::Empty`] if `command` is empty.
    pub fn new(command: &[String]) -> Result<Self, RemediationError> {
        let (program, args) = command.split_first().ok_or(RemediationError::Empty)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Remediation for CommandRemediation {
    async fn remediate(&self) -> Result<(), RemediationError> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RemediationError::Spawn {
                command: self.describe(),
                source,
            })?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            debug!(stdout = %stdout.trim(), "Remediation output");
            Ok(())
        } else {
            Err(RemediationError::Failed {
                command: self.describe(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Decides when to escalate and runs the remediation.
pub struct RecoveryEscalator {
    max_attempts: u32,
    settle: Duration,
    timeout: Duration,
    action: Box<dyn Remediation>,
}

impl RecoveryEscalator {
    /// Create an escalator.
    ///
    /// A `max_attempts` of zero is treated as one.
    #[must_use]
    pub fn new(max_attempts: u32, settle: Duration, action: Box<dyn Remediation>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            settle,
            timeout: DEFAULT_REMEDIATION_TIMEOUT,
            action,
        }
    }

    /// Override how long the remediation may run.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Threshold of consecutive failures.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `true` iff `counter` has reached the threshold.
    #[must_use]
    pub const fn should_recover(&self, counter: u32) -> bool {
        counter >= self.max_attempts
    }

    /// Run the remediation, then wait the settle period whatever the outcome.
    ///
    /// Returns whether the action itself reported success. A stop request
    /// abandons the action and skips the settle wait; an action running past
    /// the timeout counts as failed.
    pub async fn recover(&self, shutdown: &Shutdown) -> bool {
        let action = self.action.describe();
        warn!(action = %action, "Too many consecutive failures, restarting radio stack");

        let outcome = tokio::select! {
            biased;
            outcome = tokio::time::timeout(self.timeout, self.action.remediate()) => outcome,
            () = shutdown.wait() => {
                info!(action = %action, "Radio stack restart abandoned for shutdown");
                return false;
            }
        };

        let succeeded = match outcome.unwrap_or_else(|_| {
            Err(RemediationError::TimedOut {
                command: action.clone(),
                secs: self.timeout.as_secs(),
            })
        }) {
            Ok(()) => {
                info!(action = %action, "Radio stack restart completed");
                true
            }
            Err(e) => {
                error!(error = %e, "Radio stack restart failed");
                false
            }
        };

        debug!(settle_secs = self.settle.as_secs_f32(), "Waiting for radio stack");
        shutdown.sleep(self.settle).await;
        succeeded
    }
}

impl std::fmt::Debug for RecoveryEscalator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryEscalator")
            .field("max_attempts", &self.max_attempts)
            .field("settle", &self.settle)
            .field("timeout", &self.timeout)
            .field("action", &self.action.describe())
            .finish()
    }
}
