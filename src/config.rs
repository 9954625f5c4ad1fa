//! Global configuration parsing and validation.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// A named storage root under which repositories are addressed by relative path.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StorageConfig {
    /// Storage identifier carried in every repository reference.
    pub name: String,
    /// Absolute root directory of the storage.
    pub path: PathBuf,
}

/// Connection settings for the sidecar serving not-yet-native operations.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SidecarConfig {
    /// Named pipe / Unix socket identifier the sidecar listens on.
    #[serde(default = "default_sidecar_ipc_name")]
    pub ipc_name: String,
    /// Upper bound for one request/response exchange.
    #[serde(default = "default_sidecar_timeout")]
    pub timeout_seconds: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            ipc_name: default_sidecar_ipc_name(),
            timeout_seconds: default_sidecar_timeout(),
        }
    }
}

/// Location of the Linguist language table used for color lookups.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LinguistConfig {
    /// Path to Linguist's `languages.json`; colors fall back to hashing when absent.
    #[serde(default)]
    pub languages_json: Option<PathBuf>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8075))
}

fn default_git_bin_path() -> String {
    "git".into()
}

fn default_max_concurrent_processes() -> u32 {
    64
}

fn default_kill_grace_ms() -> u64 {
    5000
}

fn default_sidecar_ipc_name() -> String {
    "git-gateway-sidecar".into()
}

fn default_sidecar_timeout() -> u64 {
    30
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Address the HTTP transport binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Git executable, resolved through `PATH` when not absolute.
    #[serde(default = "default_git_bin_path")]
    pub git_bin_path: String,
    /// Ceiling of simultaneously running git processes.
    #[serde(default = "default_max_concurrent_processes")]
    pub max_concurrent_processes: u32,
    /// Grace period between the termination signal and a forced kill.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Per-call deadline; 0 means no deadline.
    #[serde(default)]
    pub call_timeout_seconds: u64,
    /// Extra server environment variables passed through to git processes.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    /// Configured storages.
    pub storages: Vec<StorageConfig>,
    /// Sidecar connection settings.
    #[serde(default)]
    pub sidecar: SidecarConfig,
    /// Linguist settings.
    #[serde(default)]
    pub linguist: LinguistConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize storage paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Grace period before a terminated process is force-killed.
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Per-call deadline, if one is configured.
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_seconds > 0).then(|| Duration::from_secs(self.call_timeout_seconds))
    }

    /// Look up a storage by name.
    #[must_use]
    pub fn storage(&self, name: &str) -> Option<&StorageConfig> {
        self.storages.iter().find(|s| s.name == name)
    }

    fn validate(&mut self) -> Result<()> {
        if self.max_concurrent_processes == 0 {
            return Err(AppError::Config(
                "max_concurrent_processes must be greater than zero".into(),
            ));
        }

        if self.git_bin_path.trim().is_empty() {
            return Err(AppError::Config("git_bin_path must not be empty".into()));
        }

        if self.storages.is_empty() {
            return Err(AppError::Config("at least one storage is required".into()));
        }

        let mut seen = HashSet::new();
        for storage in &mut self.storages {
            if storage.name.is_empty() {
                return Err(AppError::Config("storage name must not be empty".into()));
            }
            if !seen.insert(storage.name.clone()) {
                return Err(AppError::Config(format!(
                    "duplicate storage name '{}'",
                    storage.name
                )));
            }
            storage.path = storage.path.canonicalize().map_err(|err| {
                AppError::Config(format!("storage '{}' path invalid: {err}", storage.name))
            })?;
        }

        Ok(())
    }
}
