//! labfleet Workspace Store
//!
//! Durable, content-addressed storage for the two kinds of data a classroom
//! fleet keeps:
//! - the shared exercise corpus under `exercises/<id>/`
//! - per-student answer directories under `answers/<student>/`
//!
//! # Example
//!
//! ```rust
//! use labfleet_workspace::{MemoryStore, StudentId, WorkspacePath, WorkspaceStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! let alice = StudentId::new("alice")?;
//! let path = WorkspacePath::answer_dir(&alice).child("notes.md")?;
//! store.write(&path, b"# notes").await?;
//! let snapshot = store.snapshot(&WorkspacePath::answer_dir(&alice)).await?;
//! assert_eq!(snapshot.len(), 1);
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]

pub mod exercise;
pub mod fs;
pub mod hash;
pub mod ids;
pub mod memory;
pub mod path;
pub mod store;

pub use exercise::{CheckSpec, Exercise, ExerciseCatalog, TestSuite, MANIFEST_FILE};
pub use fs::FsStore;
pub use hash::{ContentHash, HashError};
pub use ids::{ExerciseId, IdError, StudentId};
pub use memory::MemoryStore;
pub use path::{PathError, WorkspacePath, ANSWERS_DIR, EXERCISES_DIR};
pub use store::{FileEntry, Snapshot, StoreError, WorkspaceStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
