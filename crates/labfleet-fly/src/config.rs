//! Fly adapter configuration
//!
//! Read from the `[fly]`, `[classroom]` and `[server]` tables of the fleet
//! TOML file, then overridden by the environment variables the provisioning
//! scripts have always used (`FLY_API_TOKEN`, `APP_NAME`, ...).

use labfleet_core::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Fly Machines API settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlyConfig {
    /// API host, or a full base URL (`http://...`) for local fakes
    pub api_host: String,
    /// Bearer token
    pub api_token: String,
    /// Fly organization slug
    pub organization: String,
    /// App the machines live in
    pub app_name: String,
    /// Domain the app is served under
    pub base_domain: String,
    /// JupyterLab image
    pub image: String,
    /// Region for machines and volumes
    pub region: String,
    /// Size of each student volume
    pub volume_size_gb: u32,
    /// Where the student volume is mounted
    pub mount_path: String,
    /// Port JupyterLab listens on inside the machine
    pub internal_port: u16,
    /// Proxy idle timeout
    pub idle_timeout_secs: u64,
    /// Timeout for each API request
    pub request_timeout_secs: u64,
}

impl Default for FlyConfig {
    fn default() -> Self {
        Self {
            api_host: "api.machines.dev".to_string(),
            api_token: String::new(),
            organization: String::new(),
            app_name: String::new(),
            base_domain: String::new(),
            image: String::new(),
            region: "ams".to_string(),
            volume_size_gb: 1,
            mount_path: "/home/jovyan/student_data".to_string(),
            internal_port: 8888,
            idle_timeout_secs: 300,
            request_timeout_secs: 30,
        }
    }
}

impl FlyConfig {
    /// With API token
    #[inline]
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = token.into();
        self
    }

    /// With app name
    #[inline]
    #[must_use]
    pub fn with_app(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// With API host or base URL
    #[inline]
    #[must_use]
    pub fn with_api_host(mut self, api_host: impl Into<String>) -> Self {
        self.api_host = api_host.into();
        self
    }

    /// Apply overrides from `lookup`, typically `std::env::var`
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] when a numeric variable does not parse.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let strings = [
            ("FLY_API_HOST", &mut self.api_host),
            ("FLY_API_TOKEN", &mut self.api_token),
            ("FLY_ORGANIZATION", &mut self.organization),
            ("APP_NAME", &mut self.app_name),
            ("BASE_DOMAIN", &mut self.base_domain),
            ("JUPYTER_IMAGE", &mut self.image),
            ("FLY_REGION", &mut self.region),
        ];
        for (key, slot) in strings {
            if let Some(value) = lookup(key) {
                *slot = value;
            }
        }
        if let Some(value) = lookup("VOLUME_SIZE") {
            self.volume_size_gb = parse_env("VOLUME_SIZE", &value)?;
        }
        if let Some(value) = lookup("INTERNAL_PORT") {
            self.internal_port = parse_env("INTERNAL_PORT", &value)?;
        }
        if let Some(value) = lookup("IDLE_TIMEOUT") {
            self.idle_timeout_secs = parse_env("IDLE_TIMEOUT", &value)?;
        }
        Ok(())
    }

    /// Check that everything needed to talk to Fly is present
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first missing setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("FLY_API_TOKEN", &self.api_token),
            ("APP_NAME", &self.app_name),
            ("JUPYTER_IMAGE", &self.image),
            ("BASE_DOMAIN", &self.base_domain),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{key} is not set")));
            }
        }
        if self.volume_size_gb == 0 {
            return Err(ConfigError::Invalid("VOLUME_SIZE must be > 0".into()));
        }
        Ok(())
    }

    /// `https://<api_host>`, or the host itself when it already has a scheme
    #[must_use]
    pub fn api_base(&self) -> String {
        let host = self.api_host.trim_end_matches('/');
        if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{host}")
        }
    }

    /// Per-request timeout
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}={value:?} is not a valid number")))
}

/// Where score reports go
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassroomConfig {
    /// Endpoint receiving `POST`ed score reports
    pub report_url: String,
    /// Optional bearer token for the endpoint
    pub token: Option<String>,
    /// Shared secret expected in `X-Labfleet-Token` on inbound webhooks
    pub webhook_token: Option<String>,
}

impl ClassroomConfig {
    /// Apply `CLASSROOM_REPORT_URL`, `CLASSROOM_TOKEN` and `WEBHOOK_TOKEN`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CLASSROOM_REPORT_URL") {
            self.report_url = url;
        }
        if let Some(token) = lookup("CLASSROOM_TOKEN") {
            self.token = Some(token);
        }
        if let Some(token) = lookup("WEBHOOK_TOKEN") {
            self.webhook_token = Some(token);
        }
    }
}

/// HTTP listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind: SocketAddr,
    /// Largest accepted webhook body
    pub max_body_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_body_bytes: 64 * 1024,
        }
    }
}
