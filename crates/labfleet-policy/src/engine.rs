//! Access policy engine
//!
//! `grants_for` is a pure function of the configuration and the student id:
//! no clock, no store reads, no randomness. Given the same config it always
//! returns the same set.

use crate::error::PolicyError;
use crate::grant::{AccessGrant, AccessMode};
use crate::set::GrantSet;
use labfleet_workspace::{StudentId, WorkspacePath};
use serde::{Deserialize, Serialize};

/// Policy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Shared exercise corpus, always read-only
    pub corpus_root: WorkspacePath,
    /// Parent of every `answers/<student>` directory
    pub answers_root: WorkspacePath,
    /// Let students read (never write) each other's answers
    pub peer_review: bool,
    /// Extra read-only subtrees (datasets, course notes)
    pub shared_read_only: Vec<WorkspacePath>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            corpus_root: WorkspacePath::corpus(),
            answers_root: WorkspacePath::answers(),
            peer_review: false,
            shared_read_only: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With peer review enabled or disabled
    #[inline]
    #[must_use]
    pub fn with_peer_review(mut self, enabled: bool) -> Self {
        self.peer_review = enabled;
        self
    }

    /// With an extra read-only subtree
    #[inline]
    #[must_use]
    pub fn with_shared(mut self, path: WorkspacePath) -> Self {
        self.shared_read_only.push(path);
        self
    }

    /// Reject layouts that would break the grant invariants
    ///
    /// # Errors
    /// [`PolicyError::InvalidConfig`] if a root is the store root, the corpus
    /// and answers roots overlap, or a shared subtree overlaps the answers root.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.corpus_root.is_root() || self.answers_root.is_root() {
            return Err(PolicyError::InvalidConfig(
                "corpus_root and answers_root must not be the store root".into(),
            ));
        }
        if overlaps(&self.corpus_root, &self.answers_root) {
            return Err(PolicyError::InvalidConfig(format!(
                "corpus_root '{}' overlaps answers_root '{}'",
                self.corpus_root, self.answers_root
            )));
        }
        if let Some(shared) = self
            .shared_read_only
            .iter()
            .find(|s| s.is_root() || overlaps(s, &self.answers_root))
        {
            return Err(PolicyError::InvalidConfig(format!(
                "shared subtree '{shared}' overlaps answers_root '{}'",
                self.answers_root
            )));
        }
        Ok(())
    }
}

fn overlaps(a: &WorkspacePath, b: &WorkspacePath) -> bool {
    a.contains(b) || b.contains(a)
}

/// Computes grant sets for students
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    /// Build an engine from a validated config
    ///
    /// # Errors
    /// See [`PolicyConfig::validate`].
    pub fn new(config: PolicyConfig) -> Result<Self, PolicyError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// The student's own answer directory
    #[must_use]
    pub fn answer_dir(&self, student: &StudentId) -> WorkspacePath {
        self.config.answers_root.for_student(student)
    }

    /// Grants for `student`, most specific first
    ///
    /// - corpus root: read-only
    /// - each shared subtree: read-only
    /// - answers root: read-only when peer review is on, otherwise absent
    /// - own answer directory: read-write
    #[must_use]
    pub fn grants_for(&self, student: &StudentId) -> GrantSet {
        let ro = |pattern: &WorkspacePath| {
            AccessGrant::new(student.clone(), pattern.clone(), AccessMode::ReadOnly)
        };

        let mut grants = vec![ro(&self.config.corpus_root)];
        grants.extend(self.config.shared_read_only.iter().map(ro));
        if self.config.peer_review {
            grants.push(ro(&self.config.answers_root));
        }
        grants.push(AccessGrant::new(
            student.clone(),
            self.answer_dir(student),
            AccessMode::ReadWrite,
        ));

        GrantSet::new(student.clone(), grants)
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self {
            config: PolicyConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::Operation;
    use pretty_assertions::assert_eq;

    fn student(s: &str) -> StudentId {
        StudentId::new(s).unwrap()
    }

    fn p(s: &str) -> WorkspacePath {
        s.parse().unwrap()
    }

    #[test]
    fn default_grants() {
        let engine = PolicyEngine::default();
        let set = engine.grants_for(&student("alice"));
        let rendered: Vec<String> = set.grants().iter().map(|g| format!("{} {}", g.pattern, g.mode)).collect();
        assert_eq!(
            rendered,
            vec!["answers/alice read-write".to_string(), "exercises read-only".to_string()]
        );
    }

    #[test]
    fn others_answers_are_inaccessible_without_peer_review() {
        let set = PolicyEngine::default().grants_for(&student("alice"));
        assert_eq!(set.resolve(&p("answers/bob/ex1/a.py")), None);
        assert!(set.allows(&p("answers/alice/ex1/a.py"), Operation::Write));
    }

    #[test]
    fn peer_review_is_read_only_for_others() {
        let engine = PolicyEngine::new(PolicyConfig::new().with_peer_review(true)).unwrap();
        let set = engine.grants_for(&student("alice"));
        assert_eq!(set.resolve(&p("answers/bob/ex1/a.py")), Some(AccessMode::ReadOnly));
        assert_eq!(set.resolve(&p("answers/alice/ex1/a.py")), Some(AccessMode::ReadWrite));
    }

    #[test]
    fn custom_answers_root() {
        let config = PolicyConfig {
            answers_root: p("course/answers"),
            ..PolicyConfig::default()
        };
        let engine = PolicyEngine::new(config).unwrap();
        assert_eq!(engine.answer_dir(&student("alice")), p("course/answers/alice"));
    }

    #[test]
    fn shared_subtree_over_answers_is_rejected() {
        let config = PolicyConfig::new().with_shared(p("answers/alice/ex1"));
        assert!(matches!(
            PolicyEngine::new(config),
            Err(PolicyError::InvalidConfig(_))
        ));
        let config = PolicyConfig {
            corpus_root: p("answers/corpus"),
            ..PolicyConfig::default()
        };
        assert!(PolicyEngine::new(config).is_err());
    }

    #[test]
    fn config_from_toml() {
        let config: PolicyConfig =
            toml::from_str("peer_review = true\nshared_read_only = [\"datasets\"]\n").unwrap();
        assert!(config.peer_review);
        assert_eq!(config.corpus_root, p("exercises"));
        assert_eq!(config.shared_read_only, vec![p("datasets")]);
    }
}
