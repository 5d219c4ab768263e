//! labfleet Core - per-student sandbox orchestration
//!
//! The part that:
//! - Routes each student to exactly one live sandbox, creating it on demand
//! - Provisions sandboxes with retries, backoff and no half-created leftovers
//! - Reaps sandboxes that have been idle too long
//! - Copies granted workspace subtrees into each sandbox and pulls edits back
//! - Grades submissions inside the student's sandbox under a suite deadline
//! - Delivers scores to the classroom with redelivery until accepted
//!
//! The sandbox host is abstracted behind [`Platform`] and the classroom
//! behind [`ClassroomClient`].
//!
//! # Example
//!
//! ```rust,ignore
//! use labfleet_core::{Fleet, FleetConfig, SubmissionEvent};
//!
//! # async fn example(
//! #     store: std::sync::Arc<dyn labfleet_workspace::WorkspaceStore>,
//! #     platform: std::sync::Arc<dyn labfleet_core::Platform>,
//! #     classroom: std::sync::Arc<dyn labfleet_core::ClassroomClient>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let fleet = Fleet::new(FleetConfig::default(), store, platform, classroom)?;
//! let handle = fleet.start()?;
//!
//! let alice = "alice".parse()?;
//! let sandbox = fleet.open_session(&alice, None).await?;
//! println!("alice -> {}", sandbox.url);
//!
//! fleet.submit(SubmissionEvent::new(alice, "ex1".parse()?))?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod fleet;
pub mod grading;
pub mod platform;
pub mod provisioner;
pub mod reporter;
pub mod router;
pub mod scoped;
pub mod submission;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use config::{ConfigError, FleetConfig, GradingConfig, ProvisionConfig, ReportConfig, RouterConfig};
pub use error::{FleetError, IntegrationError, PlatformError, ProvisionError};
pub use fleet::{Fleet, FleetHandle};
pub use grading::{spawn_grading_worker, GradingBridge, GradingQueue, SubmissionEvent};
pub use platform::{
    ExecId, ExecOutput, ExecRequest, MachineInfo, MachineRequest, MachineState, Platform,
    SandboxFile,
};
pub use provisioner::{SandboxProvisioner, ENV_GRANTS, ENV_STUDENT_ID};
pub use reporter::{ClassroomClient, FlushStats, ReportOutbox, ScoreReport};
pub use router::SessionRouter;
pub use scoped::ScopedWorkspace;
pub use submission::{score, CheckOutcome, CheckResult, GradingStatus, Submission};
pub use sync::WorkspaceSync;
pub use types::{
    ResourceProfile, SandboxId, SandboxInstance, SandboxMount, StudentSession, SubmissionId,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with labfleet core
    pub use crate::{
        ClassroomClient, Fleet, FleetConfig, FleetError, Platform, ResourceProfile,
        SandboxInstance, SubmissionEvent,
    };
    pub use labfleet_workspace::{ExerciseId, StudentId, WorkspacePath, WorkspaceStore};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
