//! Workspace store capability
//!
//! The store is the only durable state in the system. Sandboxes are
//! stateless; everything a student keeps lives here under
//! `answers/<student>/`, and the read-only corpus lives under `exercises/`.
//! Access rules are not enforced at this layer (see `labfleet-policy`).

use crate::hash::ContentHash;
use crate::path::{PathError, WorkspacePath};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One file listed from the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Full store path
    pub path: WorkspacePath,
    /// Hash of the current body
    pub hash: ContentHash,
    /// Body length in bytes
    pub size: u64,
}

/// Point-in-time capture of a subtree
///
/// Paths are relative to `prefix`. Bodies stay retrievable by hash through
/// [`WorkspaceStore::blob`] even after the live files change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Captured subtree
    pub prefix: WorkspacePath,
    /// Hash over all `(relative path, hash)` pairs
    pub root: ContentHash,
    /// Relative path -> body hash
    pub files: BTreeMap<WorkspacePath, ContentHash>,
}

impl Snapshot {
    /// Build from listed entries
    ///
    /// # Errors
    /// Returns [`StoreError::Path`] if an entry is outside `prefix`.
    pub fn from_entries(prefix: WorkspacePath, entries: &[FileEntry]) -> Result<Self, StoreError> {
        let files = entries
            .iter()
            .map(|e| Ok((e.path.strip_prefix(&prefix)?, e.hash)))
            .collect::<Result<BTreeMap<_, _>, PathError>>()?;
        let names: Vec<(String, ContentHash)> =
            files.iter().map(|(p, h)| (p.to_string(), *h)).collect();
        let root = ContentHash::of_entries(names.iter().map(|(p, h)| (p.as_str(), h)));
        Ok(Self {
            prefix,
            root,
            files,
        })
    }

    /// Capture of nothing under `prefix`
    #[must_use]
    pub fn empty(prefix: WorkspacePath) -> Self {
        Self {
            prefix,
            root: ContentHash::of_entries(std::iter::empty::<(&str, &ContentHash)>()),
            files: BTreeMap::new(),
        }
    }

    /// Number of captured files
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if nothing was captured
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Durable, content-addressed file storage
#[async_trait]
pub trait WorkspaceStore: Send + Sync + std::fmt::Debug {
    /// Read a file body
    async fn read(&self, path: &WorkspacePath) -> Result<Vec<u8>, StoreError>;

    /// Create or replace a file, returning the body hash
    async fn write(&self, path: &WorkspacePath, body: &[u8]) -> Result<ContentHash, StoreError>;

    /// Delete a file; deleting a missing file is not an error
    async fn remove(&self, path: &WorkspacePath) -> Result<(), StoreError>;

    /// Every file under `prefix`, sorted by path
    async fn list(&self, prefix: &WorkspacePath) -> Result<Vec<FileEntry>, StoreError>;

    /// Fetch a body by hash
    async fn blob(&self, hash: &ContentHash) -> Result<Vec<u8>, StoreError>;

    /// Capture `prefix` as an immutable snapshot
    async fn snapshot(&self, prefix: &WorkspacePath) -> Result<Snapshot, StoreError> {
        let entries = self.list(prefix).await?;
        Snapshot::from_entries(prefix.clone(), &entries)
    }
}

/// Workspace store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No file at path
    #[error("not found: {0}")]
    NotFound(WorkspacePath),

    /// No blob with that hash
    #[error("blob missing: {0}")]
    BlobMissing(ContentHash),

    /// Filesystem failure
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Exercise manifest missing fields or malformed
    #[error("invalid manifest {path}: {message}")]
    Manifest { path: WorkspacePath, message: String },

    /// Bad path
    #[error(transparent)]
    Path(#[from] PathError),
}

impl StoreError {
    /// Wrap an IO error with the path it happened at
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, body: &[u8]) -> FileEntry {
        FileEntry {
            path: path.parse().unwrap(),
            hash: ContentHash::of(body),
            size: body.len() as u64,
        }
    }

    #[test]
    fn snapshot_paths_are_relative() {
        let prefix: WorkspacePath = "answers/alice/ex1".parse().unwrap();
        let snap = Snapshot::from_entries(
            prefix,
            &[entry("answers/alice/ex1/main.py", b"print(1)")],
        )
        .unwrap();
        let rel: WorkspacePath = "main.py".parse().unwrap();
        assert_eq!(snap.files.get(&rel), Some(&ContentHash::of(b"print(1)")));
    }

    #[test]
    fn snapshot_root_tracks_content() {
        let prefix: WorkspacePath = "answers/alice".parse().unwrap();
        let a = Snapshot::from_entries(prefix.clone(), &[entry("answers/alice/a.py", b"1")]).unwrap();
        let b = Snapshot::from_entries(prefix.clone(), &[entry("answers/alice/a.py", b"1")]).unwrap();
        let c = Snapshot::from_entries(prefix, &[entry("answers/alice/a.py", b"2")]).unwrap();
        assert_eq!(a.root, b.root);
        assert_ne!(a.root, c.root);
    }

    #[test]
    fn empty_snapshot_matches_an_empty_listing() {
        let prefix: WorkspacePath = "answers/alice/ex1".parse().unwrap();
        let empty = Snapshot::empty(prefix.clone());
        assert!(empty.is_empty());
        assert_eq!(empty, Snapshot::from_entries(prefix, &[]).unwrap());
    }

    #[test]
    fn snapshot_rejects_foreign_entries() {
        let prefix: WorkspacePath = "answers/alice".parse().unwrap();
        let result = Snapshot::from_entries(prefix, &[entry("answers/bob/a.py", b"1")]);
        assert!(matches!(result, Err(StoreError::Path(PathError::NotDescendant { .. }))));
    }
}
