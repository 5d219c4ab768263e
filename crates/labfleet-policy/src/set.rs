//! Resolved grant sets
//!
//! A [`GrantSet`] is what a sandbox is provisioned with. Resolution uses a
//! radix trie over segment-terminated keys, so "most specific pattern wins" is
//! a single longest-ancestor lookup.

use crate::error::PolicyError;
use crate::grant::{AccessGrant, AccessMode, Operation};
use labfleet_workspace::{StudentId, WorkspacePath};
use radix_trie::Trie;

/// Ordered, deduplicated grants for one student
pub struct GrantSet {
    student: StudentId,
    grants: Vec<AccessGrant>,
    index: Trie<String, AccessMode>,
}

impl GrantSet {
    /// Build from arbitrary grants
    ///
    /// Grants are sorted most-specific first. When two grants name the same
    /// pattern the read-only one is kept. Grants for other students are
    /// ignored.
    #[must_use]
    pub fn new(student: StudentId, grants: impl IntoIterator<Item = AccessGrant>) -> Self {
        let mut grants: Vec<AccessGrant> = grants
            .into_iter()
            .filter(|g| g.student == student)
            .collect();
        grants.sort();
        grants.dedup_by(|later, kept| later.pattern == kept.pattern);

        let mut index = Trie::new();
        for grant in &grants {
            index.insert(grant.pattern.prefix_key(), grant.mode);
        }

        Self {
            student,
            grants,
            index,
        }
    }

    /// Owner of the set
    #[inline]
    #[must_use]
    pub fn student(&self) -> &StudentId {
        &self.student
    }

    /// Grants, most specific first
    #[inline]
    #[must_use]
    pub fn grants(&self) -> &[AccessGrant] {
        &self.grants
    }

    /// Effective mode for `path`; `None` means no access
    #[must_use]
    pub fn resolve(&self, path: &WorkspacePath) -> Option<AccessMode> {
        self.index.get_ancestor_value(&path.prefix_key()).copied()
    }

    /// Check one operation
    ///
    /// # Errors
    /// [`PolicyError::AccessDenied`] when no grant covers `path` or the
    /// covering grant is read-only and `op` is a write.
    pub fn check(&self, path: &WorkspacePath, op: Operation) -> Result<AccessMode, PolicyError> {
        match self.resolve(path) {
            Some(mode) if mode.permits(op) => Ok(mode),
            resolved => {
                tracing::warn!(
                    student = %self.student,
                    %path,
                    %op,
                    granted = ?resolved,
                    "access denied"
                );
                Err(PolicyError::AccessDenied {
                    student: self.student.clone(),
                    path: path.clone(),
                    operation: op,
                })
            }
        }
    }

    /// Whether `op` on `path` would be allowed
    #[inline]
    #[must_use]
    pub fn allows(&self, path: &WorkspacePath, op: Operation) -> bool {
        self.resolve(path).is_some_and(|m| m.permits(op))
    }
}

impl Clone for GrantSet {
    fn clone(&self) -> Self {
        Self::new(self.student.clone(), self.grants.iter().cloned())
    }
}

impl PartialEq for GrantSet {
    fn eq(&self, other: &Self) -> bool {
        self.student == other.student && self.grants == other.grants
    }
}

impl Eq for GrantSet {}

impl std::fmt::Debug for GrantSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantSet")
            .field("student", &self.student)
            .field("grants", &self.grants)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> StudentId {
        StudentId::new("alice").unwrap()
    }

    fn p(s: &str) -> WorkspacePath {
        s.parse().unwrap()
    }

    fn set(grants: &[(&str, AccessMode)]) -> GrantSet {
        GrantSet::new(
            alice(),
            grants
                .iter()
                .map(|(pat, mode)| AccessGrant::new(alice(), p(pat), *mode)),
        )
    }

    #[test]
    fn specific_pattern_wins() {
        let set = set(&[
            ("answers", AccessMode::ReadOnly),
            ("answers/alice", AccessMode::ReadWrite),
        ]);
        assert_eq!(set.resolve(&p("answers/alice/ex1/a.py")), Some(AccessMode::ReadWrite));
        assert_eq!(set.resolve(&p("answers/bob/ex1/a.py")), Some(AccessMode::ReadOnly));
    }

    #[test]
    fn ungranted_paths_fail_closed() {
        let set = set(&[("exercises", AccessMode::ReadOnly)]);
        assert_eq!(set.resolve(&p("answers/alice")), None);
        assert_eq!(set.resolve(&p("exercisesX/ex1")), None);
        assert!(matches!(
            set.check(&p("secrets/token"), Operation::Read),
            Err(PolicyError::AccessDenied { .. })
        ));
    }

    #[test]
    fn read_only_blocks_writes() {
        let set = set(&[("exercises", AccessMode::ReadOnly)]);
        assert!(set.check(&p("exercises/ex1/a.py"), Operation::Read).is_ok());
        assert!(set.check(&p("exercises/ex1/a.py"), Operation::Write).is_err());
    }

    #[test]
    fn duplicate_patterns_keep_read_only() {
        let set = set(&[
            ("exercises", AccessMode::ReadWrite),
            ("exercises", AccessMode::ReadOnly),
        ]);
        assert_eq!(set.grants().len(), 1);
        assert_eq!(set.resolve(&p("exercises/ex1")), Some(AccessMode::ReadOnly));
    }

    #[test]
    fn foreign_grants_are_dropped() {
        let bob = StudentId::new("bob").unwrap();
        let set = GrantSet::new(
            alice(),
            [AccessGrant::new(bob, p("answers/bob"), AccessMode::ReadWrite)],
        );
        assert!(set.grants().is_empty());
    }

    #[test]
    fn clone_keeps_resolution() {
        let original = set(&[("answers/alice", AccessMode::ReadWrite)]);
        let cloned = original.clone();
        assert_eq!(original, cloned);
        assert!(cloned.allows(&p("answers/alice/x"), Operation::Write));
    }
}
