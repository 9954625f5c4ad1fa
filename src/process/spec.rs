//! Process invocation specification.
//!
//! A [`ProcessSpec`] is built once per call from validated inputs. The
//! spawned process never sees the server environment verbatim: only the
//! variables in [`ALLOWED_ENV_VARS`] (plus an operator-configured
//! allowlist) are copied, and operation-specific entries are added
//! explicitly.

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Server environment variables inherited by spawned git processes.
///
/// Every other variable is stripped via `env_clear()` before the child is
/// launched, so credentials held by the server never reach git or its hooks.
pub const ALLOWED_ENV_VARS: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TZ", "TMPDIR"];

// ── Specification ────────────────────────────────────────────────────────────

/// Fully specified invocation of an external process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Executable name or path.
    pub program: String,
    /// Ordered argument list, passed directly without a shell.
    pub args: Vec<String>,
    /// Working directory of the process.
    pub current_dir: PathBuf,
    /// Complete environment of the process.
    pub env: Vec<(String, String)>,
    /// Token whose cancellation terminates the process.
    pub cancel: CancellationToken,
    /// Optional deadline after which the token is cancelled.
    pub deadline: Option<Duration>,
}

impl ProcessSpec {
    /// Start a specification with an empty argument list and environment.
    #[must_use]
    pub fn new(
        program: impl Into<String>,
        current_dir: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: current_dir.into(),
            env: Vec::new(),
            cancel,
            deadline: None,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add or replace one environment entry.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.env.retain(|(k, _)| *k != key);
        self.env.push((key, value.into()));
        self
    }

    /// Copy the allowed variables from the server environment.
    ///
    /// `extra` names additional variables configured by the operator.
    #[must_use]
    pub fn inherit_allowed_env(mut self, extra: &[String]) -> Self {
        let keys = ALLOWED_ENV_VARS
            .iter()
            .copied()
            .chain(extra.iter().map(String::as_str));
        for key in keys {
            if let Ok(value) = std::env::var(key) {
                self = self.env(key, value);
            }
        }
        self
    }

    /// Set the deadline after which the process is terminated.
    #[must_use]
    pub fn deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Look up an environment entry.
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Check the specification is expressible as a direct `execve` call.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` when the program or argument list is empty,
    /// or any program, argument, or environment entry contains a NUL byte,
    /// or an environment key is empty or contains `=`.
    pub fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            return Err(AppError::Spawn("invalid process spec: empty program".into()));
        }
        if self.args.is_empty() {
            return Err(AppError::Spawn(
                "invalid process spec: empty argument list".into(),
            ));
        }
        if self.program.contains('\0') {
            return Err(AppError::Spawn(
                "invalid process spec: program contains NUL byte".into(),
            ));
        }
        if let Some(pos) = self.args.iter().position(|a| a.contains('\0')) {
            return Err(AppError::Spawn(format!(
                "invalid process spec: argument {pos} contains NUL byte"
            )));
        }
        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(AppError::Spawn(format!(
                    "invalid process spec: bad environment key {key:?}"
                )));
            }
            if value.contains('\0') {
                return Err(AppError::Spawn(format!(
                    "invalid process spec: environment value of {key} contains NUL byte"
                )));
            }
        }
        Ok(())
    }
}
