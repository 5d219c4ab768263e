//! labfleet Access Policy Engine
//!
//! Decides, per student, which workspace subtrees a sandbox may see and
//! whether it may write to them.
//!
//! # Overview
//!
//! - **AccessGrant**: `(student, subtree, mode)`
//! - **GrantSet**: a student's grants with most-specific-wins resolution
//! - **PolicyEngine**: pure `student -> GrantSet` computation
//!
//! Anything not covered by a grant is denied.
//!
//! # Example
//!
//! ```rust
//! use labfleet_policy::{AccessMode, Operation, PolicyEngine};
//! use labfleet_workspace::{StudentId, WorkspacePath};
//!
//! let engine = PolicyEngine::default();
//! let alice = StudentId::new("alice").unwrap();
//! let grants = engine.grants_for(&alice);
//!
//! let own: WorkspacePath = "answers/alice/ex1/main.py".parse().unwrap();
//! assert_eq!(grants.resolve(&own), Some(AccessMode::ReadWrite));
//!
//! let corpus: WorkspacePath = "exercises/ex1/README.md".parse().unwrap();
//! assert!(grants.check(&corpus, Operation::Write).is_err());
//! ```

#![warn(missing_docs)]

pub mod engine;
pub mod error;
pub mod grant;
pub mod set;

pub use engine::{PolicyConfig, PolicyEngine};
pub use error::PolicyError;
pub use grant::{AccessGrant, AccessMode, Operation};
pub use set::GrantSet;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
