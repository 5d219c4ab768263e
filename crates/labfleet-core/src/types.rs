//! Core types for labfleet
//!
//! Defines the fundamental types shared by the router, provisioner and
//! grading bridge:
//! - Sandbox and submission identifiers
//! - Resource profiles
//! - Mounts derived from a grant set
//! - Live sandbox instances and per-student session views

use chrono::{DateTime, Utc};
use labfleet_policy::{AccessMode, GrantSet};
use labfleet_workspace::{StudentId, WorkspacePath};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Unique sandbox identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SandboxId(pub Ulid);

impl SandboxId {
    /// Generate new sandbox ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique submission identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub Ulid);

impl SubmissionId {
    /// Generate new submission ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Machine size requested for a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceProfile {
    /// 1 shared CPU, 512 MB
    #[default]
    Standard,
    /// 2 shared CPUs, 2 GB
    High,
}

impl ResourceProfile {
    /// Virtual CPUs
    #[inline]
    #[must_use]
    pub fn cpus(self) -> u32 {
        match self {
            Self::Standard => 1,
            Self::High => 2,
        }
    }

    /// Memory in megabytes
    #[inline]
    #[must_use]
    pub fn memory_mb(self) -> u32 {
        match self {
            Self::Standard => 512,
            Self::High => 2048,
        }
    }
}

impl fmt::Display for ResourceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Standard => "standard",
            Self::High => "high",
        })
    }
}

impl FromStr for ResourceProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            other => Err(format!("unknown resource profile: {other}")),
        }
    }
}

/// One subtree exposed inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxMount {
    /// Workspace subtree
    pub path: WorkspacePath,
    /// How it is mounted
    pub mode: AccessMode,
}

impl SandboxMount {
    /// Mounts for every grant, most specific first
    #[must_use]
    pub fn from_grants(grants: &GrantSet) -> Vec<Self> {
        grants
            .grants()
            .iter()
            .map(|g| Self {
                path: g.pattern.clone(),
                mode: g.mode,
            })
            .collect()
    }

    /// `path:ro` / `path:rw`
    #[must_use]
    pub fn spec(&self) -> String {
        format!("{}:{}", self.path, self.mode.mount_flag())
    }
}

/// A live, isolated sandbox bound to one student
///
/// Carries no state the student cares about; destroying it loses nothing
/// that isn't already in the workspace store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInstance {
    /// Orchestrator-side identifier
    pub id: SandboxId,
    /// Owner; never changes for the life of the instance
    pub student: StudentId,
    /// Platform machine id
    pub machine_id: String,
    /// Deterministic platform machine name
    pub name: String,
    /// Where the student's browser connects
    pub url: String,
    /// Mounts applied at creation
    pub mounts: Vec<SandboxMount>,
    /// Machine size
    pub resources: ResourceProfile,
    /// When the platform reported the machine started
    pub created_at: DateTime<Utc>,
}

/// A student's routing entry as seen from outside the router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentSession {
    /// Student
    pub student: StudentId,
    /// Bound instance, if any
    pub instance: Option<SandboxInstance>,
    /// Last request routed for this student
    pub last_active: DateTime<Utc>,
}
