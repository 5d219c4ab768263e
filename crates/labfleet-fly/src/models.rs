//! Fly Machines API payloads
//!
//! Only the fields labfleet sends or reads. Unknown response fields are
//! ignored so API additions do not break decoding.

use crate::config::FlyConfig;
use labfleet_core::{MachineRequest, MachineState, ResourceProfile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key holding the owning student id
pub const META_STUDENT: &str = "labfleet_student";

/// `POST /v1/apps/{app}/volumes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolume {
    pub name: String,
    pub region: String,
    pub size_gb: u32,
    pub encrypted: bool,
}

/// A volume as returned by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
}

impl Volume {
    /// Not on its way out
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !matches!(
            self.state.as_str(),
            "destroyed" | "destroying" | "pending_destroy" | "scheduling_destroy"
        )
    }
}

/// `POST /v1/apps/{app}/machines`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMachine {
    pub name: String,
    pub region: String,
    pub config: MachineConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub services: Vec<Service>,
    pub mounts: Vec<Mount>,
    pub auto_destroy: bool,
    pub guest: Guest,
    pub init: Init,
    pub restart: Restart,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub protocol: String,
    pub internal_port: u16,
    pub autostart: bool,
    pub autostop: String,
    pub force_https: bool,
    pub min_machines_running: u32,
    pub ports: Vec<Port>,
    pub concurrency: Concurrency,
    pub http_options: HttpOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub port: u16,
    pub handlers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    #[serde(rename = "type")]
    pub kind: String,
    pub hard_limit: u32,
    pub soft_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpOptions {
    pub idle_timeout: u64,
    pub h2_backend: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub volume: String,
    pub path: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub cpu_kind: String,
    pub cpus: u32,
    pub memory_mb: u32,
}

impl Guest {
    /// Shared-CPU guest sized for `profile`
    #[must_use]
    pub fn for_profile(profile: ResourceProfile) -> Self {
        Self {
            cpu_kind: "shared".into(),
            cpus: profile.cpus(),
            memory_mb: profile.memory_mb(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Init {
    pub swap_size_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restart {
    pub max_retries: u32,
    pub policy: String,
}

impl Service {
    /// JupyterLab behind the Fly proxy on 80/443
    #[must_use]
    pub fn jupyter(config: &FlyConfig) -> Self {
        Self {
            protocol: "tcp".into(),
            internal_port: config.internal_port,
            autostart: true,
            autostop: "off".into(),
            force_https: true,
            min_machines_running: 0,
            ports: vec![
                Port {
                    port: 80,
                    handlers: vec!["http".into()],
                },
                Port {
                    port: 443,
                    handlers: vec!["tls".into(), "http".into()],
                },
            ],
            concurrency: Concurrency {
                kind: "connections".into(),
                hard_limit: 30,
                soft_limit: 20,
            },
            http_options: HttpOptions {
                idle_timeout: config.idle_timeout_secs,
                h2_backend: true,
            },
        }
    }
}

impl CreateMachine {
    /// Payload for `request`, mounting `volume_id`
    #[must_use]
    pub fn from_request(config: &FlyConfig, request: &MachineRequest, volume_id: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(META_STUDENT.to_string(), request.student.to_string());
        Self {
            name: request.name.clone(),
            region: config.region.clone(),
            config: MachineConfig {
                image: config.image.clone(),
                env: request.env.clone(),
                services: vec![Service::jupyter(config)],
                mounts: vec![Mount {
                    volume: volume_id.to_string(),
                    path: config.mount_path.clone(),
                    encrypted: true,
                }],
                auto_destroy: true,
                guest: Guest::for_profile(request.resources),
                init: Init { swap_size_mb: 512 },
                restart: Restart {
                    max_retries: 3,
                    policy: "on-failure".into(),
                },
                metadata,
            },
        }
    }
}

/// A machine as returned by the API
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Machine {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "unknown_state")]
    pub state: MachineState,
    #[serde(default)]
    pub config: Option<MachineMetadata>,
}

/// The slice of a returned machine config labfleet reads back
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MachineMetadata {
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Machine {
    /// Student recorded at creation
    #[must_use]
    pub fn student(&self) -> Option<&str> {
        self.config
            .as_ref()
            .and_then(|c| c.metadata.get(META_STUDENT))
            .map(String::as_str)
    }
}

fn unknown_state() -> MachineState {
    MachineState::Unknown
}

/// `POST /v1/apps/{app}/machines/{id}/exec`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecBody {
    pub command: Vec<String>,
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecResponse {
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// One line printed by the file listing program run inside a machine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FetchedFile {
    /// Path relative to the volume mount
    pub path: String,
    /// Hex-encoded body
    pub hex: String,
}

/// Error body the API sends with 4xx/5xx
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub error: String,
}

/// Volume names allow lowercase letters, digits and underscores, 30 at most
#[must_use]
pub fn volume_name(student: &str) -> String {
    let mut name: String = format!("vol_{student}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    name.truncate(30);
    name
}
