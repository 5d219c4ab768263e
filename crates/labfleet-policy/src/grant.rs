//! Access grants

use labfleet_workspace::{StudentId, WorkspacePath};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

/// What a grant allows
///
/// Ordered so that `ReadOnly < ReadWrite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    /// Read and list
    ReadOnly,
    /// Read, list, create, modify, delete
    ReadWrite,
}

impl AccessMode {
    /// Whether this mode permits `op`
    #[inline]
    #[must_use]
    pub fn permits(self, op: Operation) -> bool {
        match op {
            Operation::Read | Operation::List => true,
            Operation::Write => self == AccessMode::ReadWrite,
        }
    }

    /// Mount flag string (`ro` / `rw`)
    #[inline]
    #[must_use]
    pub fn mount_flag(self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "ro",
            AccessMode::ReadWrite => "rw",
        }
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessMode::ReadOnly => "read-only",
            AccessMode::ReadWrite => "read-write",
        })
    }
}

/// Operation checked against a grant set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Read a file body
    Read,
    /// Enumerate a directory
    List,
    /// Create, modify or delete
    Write,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Read => "read",
            Operation::List => "list",
            Operation::Write => "write",
        })
    }
}

/// `(student, pattern, mode)`
///
/// A pattern names a subtree: it matches itself and every path below it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessGrant {
    /// Student the grant belongs to
    pub student: StudentId,
    /// Subtree the grant covers
    pub pattern: WorkspacePath,
    /// Allowed access
    pub mode: AccessMode,
}

impl AccessGrant {
    /// Build a grant
    #[inline]
    #[must_use]
    pub fn new(student: StudentId, pattern: WorkspacePath, mode: AccessMode) -> Self {
        Self {
            student,
            pattern,
            mode,
        }
    }

    /// Pattern specificity; deeper patterns win
    #[inline]
    #[must_use]
    pub fn specificity(&self) -> usize {
        self.pattern.depth()
    }

    /// Whether the pattern covers `path`
    #[inline]
    #[must_use]
    pub fn matches(&self, path: &WorkspacePath) -> bool {
        self.pattern.contains(path)
    }
}

impl PartialOrd for AccessGrant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Most specific first, then by path, then read-only before read-write
impl Ord for AccessGrant {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .specificity()
            .cmp(&self.specificity())
            .then_with(|| self.pattern.cmp(&other.pattern))
            .then_with(|| self.mode.cmp(&other.mode))
            .then_with(|| self.student.cmp(&other.student))
    }
}

impl Display for AccessGrant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.student, self.pattern, self.mode)
    }
}
