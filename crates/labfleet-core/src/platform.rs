//! Sandbox platform capability
//!
//! Everything the orchestrator needs from whatever hosts the sandboxes:
//! machine lifecycle, status for health checks, command execution for
//! grading, and file transfer for moving workspace subtrees in and out.
//! Adapters (Fly Machines, test fakes) implement [`Platform`];
//! nothing in core knows which one is in use.

use crate::error::PlatformError;
use crate::types::{ResourceProfile, SandboxMount};
use async_trait::async_trait;
use labfleet_workspace::{StudentId, WorkspacePath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use ulid::Ulid;

/// Lifecycle state reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Accepted, not yet booting
    Created,
    /// Booting
    Starting,
    /// Running and reachable
    Started,
    /// Shutting down
    Stopping,
    /// Stopped, can be started again
    Stopped,
    /// Being destroyed
    Destroying,
    /// Gone
    Destroyed,
    /// Crashed or failed to boot
    Failed,
    /// Anything the adapter does not recognise
    #[serde(other)]
    Unknown,
}

impl MachineState {
    /// Running and able to serve the student
    #[inline]
    #[must_use]
    pub fn is_running(self) -> bool {
        self == Self::Started
    }

    /// Still on its way up
    #[inline]
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Created | Self::Starting)
    }

    /// Will never run again without a new machine
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroying | Self::Destroyed | Self::Failed)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        })
    }
}

/// What to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRequest {
    /// Deterministic name; at most one machine per name
    pub name: String,
    /// Owning student
    pub student: StudentId,
    /// Subtrees exposed to the sandbox
    pub mounts: Vec<SandboxMount>,
    /// Machine size
    pub resources: ResourceProfile,
    /// Extra environment
    pub env: BTreeMap<String, String>,
}

/// A machine as the platform sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Platform id
    pub id: String,
    /// Name given at creation
    pub name: String,
    /// Current state
    pub state: MachineState,
    /// Student-facing URL
    pub url: String,
}

/// Handle for one command run, used to kill it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecId(pub Ulid);

impl ExecId {
    /// Generate new exec ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ExecId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command to run inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Used by [`Platform::kill_exec`]
    pub exec_id: ExecId,
    /// argv
    pub command: Vec<String>,
    /// Working directory, as a workspace path
    pub workdir: WorkspacePath,
    /// Hint for the platform; the caller enforces the real deadline
    pub timeout: Duration,
}

impl ExecRequest {
    /// New request with a fresh exec id
    #[must_use]
    pub fn new(command: Vec<String>, workdir: WorkspacePath, timeout: Duration) -> Self {
        Self {
            exec_id: ExecId::new(),
            command,
            workdir,
            timeout,
        }
    }
}

/// Result of a finished command
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Process exit code
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl ExecOutput {
    /// Exit code zero
    #[inline]
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A file inside a sandbox
///
/// `path` is a workspace path; adapters place it under their mount root, the
/// same root [`ExecRequest::workdir`] is resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFile {
    /// Where the file lives
    pub path: WorkspacePath,
    /// Contents
    pub body: Vec<u8>,
}

/// Sandbox hosting capability
#[async_trait]
pub trait Platform: Send + Sync {
    /// Machine with this name, if one exists
    async fn find_by_name(&self, name: &str) -> Result<Option<MachineInfo>, PlatformError>;

    /// Create a machine; fails if the name is taken
    async fn create(&self, request: &MachineRequest) -> Result<MachineInfo, PlatformError>;

    /// Current state of a machine
    async fn status(&self, machine_id: &str) -> Result<MachineState, PlatformError>;

    /// Start a stopped machine
    async fn start(&self, machine_id: &str) -> Result<(), PlatformError>;

    /// Stop a running machine without destroying it
    async fn stop(&self, machine_id: &str) -> Result<(), PlatformError>;

    /// Destroy a machine; destroying a missing machine is not an error
    async fn destroy(&self, machine_id: &str) -> Result<(), PlatformError>;

    /// Every machine this orchestrator owns
    async fn list(&self) -> Result<Vec<MachineInfo>, PlatformError>;

    /// Run a command to completion
    async fn exec(&self, machine_id: &str, request: &ExecRequest)
        -> Result<ExecOutput, PlatformError>;

    /// Kill a command started by [`Platform::exec`]
    async fn kill_exec(&self, machine_id: &str, exec_id: ExecId) -> Result<(), PlatformError>;

    /// Create or replace files in the sandbox, making parent directories
    async fn put_files(&self, machine_id: &str, files: &[SandboxFile]) -> Result<(), PlatformError>;

    /// Every regular file under `dir`; a missing directory yields nothing
    async fn fetch_files(
        &self,
        machine_id: &str,
        dir: &WorkspacePath,
    ) -> Result<Vec<SandboxFile>, PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_classification() {
        assert!(MachineState::Started.is_running());
        assert!(MachineState::Starting.is_pending());
        assert!(MachineState::Failed.is_terminal());
        assert!(!MachineState::Stopped.is_terminal());
    }

    #[test]
    fn unknown_states_deserialize() {
        let state: MachineState = serde_json::from_str("\"replacing\"").unwrap();
        assert_eq!(state, MachineState::Unknown);
        let state: MachineState = serde_json::from_str("\"started\"").unwrap();
        assert_eq!(state, MachineState::Started);
    }
}
