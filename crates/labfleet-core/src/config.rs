//! Fleet configuration
//!
//! Loaded from TOML; every section and field has a default so an empty file
//! is a valid configuration. Durations are stored as integer seconds or
//! milliseconds and exposed through `Duration` accessors.

use crate::types::ResourceProfile;
use labfleet_policy::PolicyConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Session routing and idle reaping
    pub router: RouterConfig,
    /// Sandbox creation retries
    pub provision: ProvisionConfig,
    /// Grading worker
    pub grading: GradingConfig,
    /// Score report delivery
    pub reporting: ReportConfig,
    /// Access grants
    pub policy: PolicyConfig,
    /// Exercises kept in the catalog cache
    pub catalog_capacity: u64,
}

impl FleetConfig {
    /// With router settings
    #[inline]
    #[must_use]
    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// With provisioning settings
    #[inline]
    #[must_use]
    pub fn with_provision(mut self, provision: ProvisionConfig) -> Self {
        self.provision = provision;
        self
    }

    /// With grading settings
    #[inline]
    #[must_use]
    pub fn with_grading(mut self, grading: GradingConfig) -> Self {
        self.grading = grading;
        self
    }

    /// With report delivery settings
    #[inline]
    #[must_use]
    pub fn with_reporting(mut self, reporting: ReportConfig) -> Self {
        self.reporting = reporting;
        self
    }

    /// With access policy settings
    #[inline]
    #[must_use]
    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    /// Parse from TOML text and validate
    ///
    /// # Errors
    /// [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file
    ///
    /// # Errors
    /// [`ConfigError::Io`] if the file cannot be read, otherwise see
    /// [`FleetConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.router.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("router.idle_timeout_secs must be > 0".into()));
        }
        if self.provision.max_attempts == 0 {
            return Err(ConfigError::Invalid("provision.max_attempts must be > 0".into()));
        }
        if self.provision.base_backoff_ms > self.provision.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "provision.base_backoff_ms exceeds provision.max_backoff_ms".into(),
            ));
        }
        if self.provision.name_prefix.is_empty() {
            return Err(ConfigError::Invalid("provision.name_prefix must not be empty".into()));
        }
        if self.grading.max_concurrent == 0 || self.grading.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "grading.max_concurrent and grading.queue_capacity must be > 0".into(),
            ));
        }
        if self.grading.max_attempts == 0 {
            return Err(ConfigError::Invalid("grading.max_attempts must be > 0".into()));
        }
        self.policy
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Not valid TOML, or fields of the wrong type
    #[error("invalid configuration file: {0}")]
    Parse(String),

    /// Could not read the file
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Parsed, but breaks a constraint
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            provision: ProvisionConfig::default(),
            grading: GradingConfig::default(),
            reporting: ReportConfig::default(),
            policy: PolicyConfig::default(),
            catalog_capacity: 64,
        }
    }
}

/// Session router settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Inactivity after which a sandbox is torn down
    pub idle_timeout_secs: u64,
    /// How often the reaper scans for idle sandboxes
    pub reap_interval_secs: u64,
    /// Ask the platform whether a bound instance is still alive before reusing it
    pub health_check_on_route: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            reap_interval_secs: 30,
            health_check_on_route: true,
        }
    }
}

impl RouterConfig {
    /// Idle timeout
    #[inline]
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Reaper period
    #[inline]
    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Sandbox provisioning settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Attempts before giving up, including the first
    pub max_attempts: u32,
    /// Per-attempt budget from create to started
    pub attempt_timeout_secs: u64,
    /// Backoff before the second attempt; doubles afterwards
    pub base_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
    /// Interval between status polls while waiting for start
    pub poll_interval_ms: u64,
    /// Machine names are `<prefix><student>`
    pub name_prefix: String,
    /// Size used when the caller does not ask for one
    pub default_resources: ResourceProfile,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_secs: 60,
            base_backoff_ms: 500,
            max_backoff_ms: 5_000,
            poll_interval_ms: 500,
            name_prefix: "jupyter-".to_string(),
            default_resources: ResourceProfile::Standard,
        }
    }
}

impl ProvisionConfig {
    /// Per-attempt timeout
    #[inline]
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Status poll interval
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Sleep before attempt `attempt + 1`, where `attempt` starts at 1
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.base_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Grading bridge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    /// Submissions graded in parallel
    pub max_concurrent: usize,
    /// Submissions buffered before `submit` reports the queue as full
    pub queue_capacity: usize,
    /// Upper bound on any suite deadline, whatever the manifest says
    pub max_suite_timeout_secs: u64,
    /// Times a submission may move to a fresh sandbox after losing its own
    pub resume_attempts: u32,
    /// Tries per queued submission when no sandbox could be reached
    pub max_attempts: u32,
    /// Delay before the second try; doubles afterwards
    pub retry_base_secs: u64,
    /// Retry delay ceiling
    pub retry_max_secs: u64,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            queue_capacity: 256,
            max_suite_timeout_secs: 600,
            resume_attempts: 1,
            max_attempts: 5,
            retry_base_secs: 10,
            retry_max_secs: 120,
        }
    }
}

impl GradingConfig {
    /// Cap applied to manifest deadlines
    #[inline]
    #[must_use]
    pub fn max_suite_timeout(&self) -> Duration {
        Duration::from_secs(self.max_suite_timeout_secs)
    }

    /// Delay after `failures` failed tries of one submission
    #[must_use]
    pub fn retry_backoff(&self, failures: u32) -> Duration {
        let factor = 1u64 << failures.saturating_sub(1).min(16);
        Duration::from_secs(
            self.retry_base_secs
                .saturating_mul(factor)
                .min(self.retry_max_secs),
        )
    }
}

/// Score report delivery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// How often the outbox retries pending reports
    pub flush_interval_secs: u64,
    /// Delay after the first failed delivery; doubles afterwards
    pub base_backoff_secs: u64,
    /// Delay ceiling
    pub max_backoff_secs: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 5,
            base_backoff_secs: 1,
            max_backoff_secs: 300,
        }
    }
}

impl ReportConfig {
    /// Flush period
    #[inline]
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    /// Delay after `failures` consecutive failures
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u64 << failures.saturating_sub(1).min(16);
        Duration::from_secs(
            self.base_backoff_secs
                .saturating_mul(factor)
                .min(self.max_backoff_secs),
        )
    }
}
