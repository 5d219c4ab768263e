//! Settings file plus environment
//!
//! One TOML file holds the fleet sections (`[router]`, `[provision]`,
//! `[grading]`, `[reporting]`, `[policy]`) next to `[fly]`, `[classroom]`,
//! `[server]` and `[storage]`. An optional `.env` file and then the process
//! environment are layered on top.

use labfleet_core::{ConfigError, FleetConfig};
use labfleet_fly::{ClassroomConfig, FlyConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Where files live on the host running labfleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the workspace store
    pub store_root: PathBuf,
    /// Blob cache entries
    pub cache_capacity: u64,
    /// `provision` writes `<access_dir>/<student>/access.json`
    pub access_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("workspace"),
            cache_capacity: 1024,
            access_dir: PathBuf::from(".fly-configs"),
        }
    }
}

/// Everything the binary needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(flatten)]
    pub fleet: FleetConfig,
    pub fly: FlyConfig,
    pub classroom: ClassroomConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

impl Settings {
    /// Parse a settings file
    ///
    /// # Errors
    /// [`ConfigError::Parse`] on malformed TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load `path` (defaults when `None`), then `env_file`, then the process
    /// environment, and validate the fleet sections
    ///
    /// Values from `env_file` take precedence over the process environment.
    ///
    /// # Errors
    /// Any [`ConfigError`] from reading, parsing, overriding or validating.
    pub fn load(path: Option<&Path>, env_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };

        let file_vars = match env_file {
            Some(env_file) => {
                let text = std::fs::read_to_string(env_file).map_err(|source| ConfigError::Io {
                    path: env_file.to_path_buf(),
                    source,
                })?;
                parse_env_file(&text)
            }
            None => BTreeMap::new(),
        };
        settings.apply_env(|key| {
            file_vars
                .get(key)
                .cloned()
                .or_else(|| std::env::var(key).ok())
        })?;
        settings.fleet.validate()?;
        Ok(settings)
    }

    /// Apply overrides from `lookup`
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] when a numeric variable does not parse.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.fly.apply_env(&lookup)?;
        self.classroom.apply_env(&lookup);
        if let Some(prefix) = lookup("FLY_APP_PREFIX") {
            self.fleet.provision.name_prefix = prefix;
        }
        if lookup("IDLE_TIMEOUT").is_some() {
            self.fleet.router.idle_timeout_secs = self.fly.idle_timeout_secs;
        }
        if let Some(root) = lookup("LABFLEET_STORE_ROOT") {
            self.storage.store_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup("LABFLEET_ACCESS_DIR") {
            self.storage.access_dir = PathBuf::from(dir);
        }
        if let Some(bind) = lookup("LABFLEET_BIND") {
            self.server.bind = bind
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("LABFLEET_BIND={bind:?} is not an address")))?;
        }
        Ok(())
    }
}

/// `KEY=VALUE` lines; blank lines and `#` comments are skipped and
/// surrounding quotes on the value are dropped
#[must_use]
pub fn parse_env_file(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}
