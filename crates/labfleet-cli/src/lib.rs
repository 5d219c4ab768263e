//! labfleet operator tooling
//!
//! Settings loading, roster parsing and the commands behind the `labfleet`
//! binary. The commands take any [`labfleet_core::Platform`], so the same
//! code drives Fly in production and the in-memory platform in tests.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod access;
pub mod commands;
pub mod roster;
pub mod settings;

pub use access::{remove_access_file, write_access_file, AccessInfo};
pub use commands::{fly_platform, serve, Admin, AdminError, BatchReport};
pub use roster::{parse_roster, RosterEntry, RosterError};
pub use settings::{parse_env_file, Settings, StorageConfig};
