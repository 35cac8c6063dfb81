use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Conventional settings file name, looked up in the working directory.
pub const SETTINGS_FILE: &str = "terrace.yml";

/// Where snapshots and locks live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSettings {
    /// Process-local; everything is lost on exit.
    Memory,
    /// A redb database file.
    Local {
        #[serde(default = "default_local_path")]
        path: PathBuf,
    },
    /// A PostgreSQL database with a locking side-table.
    Postgres { url: String },
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings::Local { path: default_local_path() }
    }
}

fn default_local_path() -> PathBuf {
    PathBuf::from(".terrace/state.redb")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_state_key")]
    pub state_key: String,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        WorkspaceSettings {
            key_prefix: default_key_prefix(),
            state_key: default_state_key(),
        }
    }
}

fn default_key_prefix() -> String {
    "workspaces".into()
}

fn default_state_key() -> String {
    "terrace.state".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSettings {
    /// How long to keep retrying a held lock. 0 fails fast.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        LockSettings {
            timeout_secs: 0,
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_backoff_ms() -> u64 {
    1000
}

impl LockSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Contents of `terrace.yml`. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub workspace: WorkspaceSettings,
    /// Upper bound on concurrently running provider operations.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub lock: LockSettings,
}

fn default_parallelism() -> usize {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            backend: BackendSettings::default(),
            workspace: WorkspaceSettings::default(),
            parallelism: default_parallelism(),
            lock: LockSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Parse settings text. `path` is only used in error messages.
    pub fn parse(content: &str, path: &str) -> Result<Self, ConfigError> {
        // An empty file deserializes to unit, not to an empty mapping.
        let settings: Settings = if content.trim().is_empty() {
            Settings::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| ConfigError::YamlParse {
                path: path.to_string(),
                source: e,
            })?
        };
        settings.validate(path)?;
        Ok(settings)
    }

    fn validate(&self, path: &str) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidSettings {
            path: path.to_string(),
            message: message.to_string(),
        };
        if self.parallelism == 0 {
            return Err(invalid("parallelism must be at least 1"));
        }
        if self.workspace.key_prefix.is_empty() || self.workspace.state_key.is_empty() {
            return Err(invalid("workspace key_prefix and state_key must not be empty"));
        }
        if self.workspace.state_key.contains('/') {
            return Err(invalid("workspace state_key must not contain '/'"));
        }
        Ok(())
    }
}
