//! Normalized paths inside the workspace store
//!
//! [`WorkspacePath`] is a list of validated segments rendered with `/`. There
//! is no `.`/`..` handling on purpose: such segments are rejected at parse
//! time, so a path can never climb out of the subtree it names.

use crate::ids::{ExerciseId, StudentId};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Top-level directory holding the shared exercise corpus
pub const EXERCISES_DIR: &str = "exercises";

/// Top-level directory holding per-student answer directories
pub const ANSWERS_DIR: &str = "answers";

/// Path within the workspace store
///
/// # Examples
/// - `exercises/ex1/README.md`
/// - `answers/alice/ex1/solution.py`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkspacePath(Vec<String>);

impl WorkspacePath {
    /// The store root
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Root of the shared exercise corpus
    #[must_use]
    pub fn corpus() -> Self {
        Self(vec![EXERCISES_DIR.to_string()])
    }

    /// Canonical files of one exercise
    #[must_use]
    pub fn exercise(id: &ExerciseId) -> Self {
        Self::corpus().child_unchecked(id.as_str())
    }

    /// Root of all answer directories
    #[must_use]
    pub fn answers() -> Self {
        Self(vec![ANSWERS_DIR.to_string()])
    }

    /// A student's own answer directory
    #[must_use]
    pub fn answer_dir(student: &StudentId) -> Self {
        Self::answers().for_student(student)
    }

    /// A student's answers for one exercise
    #[must_use]
    pub fn answer_for(student: &StudentId, exercise: &ExerciseId) -> Self {
        Self::answer_dir(student).child_unchecked(exercise.as_str())
    }

    /// `self/<student>`; student ids are always valid segments
    #[must_use]
    pub fn for_student(&self, student: &StudentId) -> Self {
        self.child_unchecked(student.as_str())
    }

    /// Path segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of segments; used as pattern specificity
    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// True for the store root
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Last segment
    #[inline]
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Parent directory, `None` at the root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0
            .split_last()
            .map(|(_, rest)| Self(rest.to_vec()))
    }

    /// Append one validated segment
    ///
    /// # Errors
    /// Returns [`PathError`] if the segment is empty, `.`/`..`, or contains a separator.
    pub fn child(&self, segment: &str) -> Result<Self, PathError> {
        validate_segment(segment)?;
        Ok(self.child_unchecked(segment))
    }

    /// Append every segment of a relative path
    #[must_use]
    pub fn join(&self, relative: &WorkspacePath) -> Self {
        let mut segments = self.0.clone();
        segments.extend(relative.0.iter().cloned());
        Self(segments)
    }

    /// True if `self` is `other` or one of its ancestors
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.0.len() <= other.0.len() && self.0[..] == other.0[..self.0.len()]
    }

    /// Strip an ancestor prefix
    ///
    /// # Errors
    /// Returns [`PathError::NotDescendant`] if `ancestor` does not contain `self`.
    pub fn strip_prefix(&self, ancestor: &Self) -> Result<Self, PathError> {
        if !ancestor.contains(self) {
            return Err(PathError::NotDescendant {
                path: self.to_string(),
                ancestor: ancestor.to_string(),
            });
        }
        Ok(Self(self.0[ancestor.0.len()..].to_vec()))
    }

    /// Key for prefix indexes: every segment followed by `/`
    ///
    /// The trailing separator keeps `answers/al` from being a prefix of
    /// `answers/alice` in a string trie.
    #[must_use]
    pub fn prefix_key(&self) -> String {
        let mut key = String::with_capacity(self.0.iter().map(|s| s.len() + 1).sum());
        for seg in &self.0 {
            key.push_str(seg);
            key.push('/');
        }
        key
    }

    /// Relative filesystem path for on-disk backends
    #[must_use]
    pub fn to_relative_path(&self) -> std::path::PathBuf {
        self.0.iter().collect()
    }

    fn child_unchecked(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }
}

fn validate_segment(segment: &str) -> Result<(), PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment);
    }
    if segment == "." || segment == ".." {
        return Err(PathError::Traversal(segment.to_string()));
    }
    if segment.contains(['/', '\\', '\0']) {
        return Err(PathError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

impl Display for WorkspacePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl FromStr for WorkspacePath {
    type Err = PathError;

    /// Parse `a/b/c`; a single leading or trailing `/` is tolerated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_prefix('/').unwrap_or(s);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let segments = trimmed
            .split('/')
            .map(|seg| validate_segment(seg).map(|()| seg.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(segments))
    }
}

impl TryFrom<String> for WorkspacePath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkspacePath> for String {
    fn from(path: WorkspacePath) -> Self {
        path.to_string()
    }
}

/// Errors related to workspace paths
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// `a//b`
    #[error("path contains empty segment")]
    EmptySegment,

    /// `.` or `..`
    #[error("path segment '{0}' is not allowed")]
    Traversal(String),

    /// Separator or NUL inside a segment
    #[error("invalid path segment: {0:?}")]
    InvalidSegment(String),

    /// Not under the expected ancestor
    #[error("path '{path}' is not under '{ancestor}'")]
    NotDescendant { path: String, ancestor: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> WorkspacePath {
        s.parse().unwrap()
    }

    #[test]
    fn layout_helpers() {
        let alice = StudentId::new("alice").unwrap();
        let ex1 = ExerciseId::new("ex1").unwrap();
        assert_eq!(WorkspacePath::exercise(&ex1).to_string(), "exercises/ex1");
        assert_eq!(
            WorkspacePath::answer_for(&alice, &ex1).to_string(),
            "answers/alice/ex1"
        );
    }

    #[test]
    fn rejects_traversal() {
        assert!(matches!(
            "answers/../exercises".parse::<WorkspacePath>(),
            Err(PathError::Traversal(_))
        ));
        assert!(matches!(
            "answers//x".parse::<WorkspacePath>(),
            Err(PathError::EmptySegment)
        ));
        assert!(WorkspacePath::root().child("a/b").is_err());
    }

    #[test]
    fn leading_slash_is_tolerated() {
        assert_eq!(p("/exercises/ex1/"), p("exercises/ex1"));
        assert!(p("/").is_root());
    }

    #[test]
    fn contains_is_segment_aware() {
        assert!(p("answers/alice").contains(&p("answers/alice/ex1/a.py")));
        assert!(p("answers/alice").contains(&p("answers/alice")));
        assert!(!p("answers/al").contains(&p("answers/alice")));
        assert!(WorkspacePath::root().contains(&p("anything")));
    }

    #[test]
    fn prefix_key_is_segment_aware() {
        assert!(!p("answers/alice")
            .prefix_key()
            .starts_with(&p("answers/alice2").prefix_key()));
        assert_eq!(p("answers/al").prefix_key(), "answers/al/");
        assert_eq!(WorkspacePath::root().prefix_key(), "");
    }

    #[test]
    fn strip_prefix_and_join() {
        let full = p("answers/alice/ex1/main.py");
        let base = p("answers/alice");
        let rel = full.strip_prefix(&base).unwrap();
        assert_eq!(rel.to_string(), "ex1/main.py");
        assert_eq!(base.join(&rel), full);
        assert!(full.strip_prefix(&p("answers/bob")).is_err());
    }

    #[test]
    fn parent_and_file_name() {
        let path = p("exercises/ex1/tests.py");
        assert_eq!(path.file_name(), Some("tests.py"));
        assert_eq!(path.parent().unwrap(), p("exercises/ex1"));
        assert!(WorkspacePath::root().parent().is_none());
    }
}
