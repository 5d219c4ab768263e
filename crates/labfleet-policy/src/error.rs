//! Policy errors

use crate::grant::Operation;
use labfleet_workspace::{StudentId, WorkspacePath};

/// Access policy errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// No grant covers the path, or the grant is too weak for the operation
    #[error("access denied: {student} may not {operation} {path}")]
    AccessDenied {
        student: StudentId,
        path: WorkspacePath,
        operation: Operation,
    },

    /// Policy layout would break grant invariants
    #[error("invalid policy configuration: {0}")]
    InvalidConfig(String),
}
