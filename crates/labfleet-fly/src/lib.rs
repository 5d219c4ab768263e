//! labfleet Fly - the outside world
//!
//! - [`FlyMachines`]: sandboxes as Fly Machines, one encrypted volume each
//! - [`HttpClassroom`]: score reports `POST`ed to the classroom
//! - [`server`]: the HTTP surface students' browsers and the classroom call

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod classroom;
pub mod config;
pub mod machines;
pub mod models;
pub mod server;

pub use classroom::HttpClassroom;
pub use config::{ClassroomConfig, FlyConfig, ServerConfig};
pub use machines::{FlyMachines, USER_AGENT};
