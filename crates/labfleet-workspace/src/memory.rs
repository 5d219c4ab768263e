//! In-memory workspace store

use crate::hash::ContentHash;
use crate::path::WorkspacePath;
use crate::store::{FileEntry, StoreError, WorkspaceStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Store backed by two maps: path -> hash and hash -> body
///
/// Blobs are never evicted, so snapshots taken from this store stay
/// resolvable for its whole lifetime.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tree: RwLock<BTreeMap<WorkspacePath, ContentHash>>,
    blobs: RwLock<HashMap<ContentHash, Arc<[u8]>>>,
}

impl MemoryStore {
    /// Empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live files
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.tree.read().len()
    }
}

#[async_trait]
impl WorkspaceStore for MemoryStore {
    async fn read(&self, path: &WorkspacePath) -> Result<Vec<u8>, StoreError> {
        let hash = self
            .tree
            .read()
            .get(path)
            .copied()
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        self.blob(&hash).await
    }

    async fn write(&self, path: &WorkspacePath, body: &[u8]) -> Result<ContentHash, StoreError> {
        let hash = ContentHash::of(body);
        self.blobs
            .write()
            .entry(hash)
            .or_insert_with(|| Arc::from(body));
        self.tree.write().insert(path.clone(), hash);
        Ok(hash)
    }

    async fn remove(&self, path: &WorkspacePath) -> Result<(), StoreError> {
        self.tree.write().remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &WorkspacePath) -> Result<Vec<FileEntry>, StoreError> {
        let tree = self.tree.read();
        let blobs = self.blobs.read();
        Ok(tree
            .range(prefix.clone()..)
            .take_while(|(path, _)| prefix.contains(path))
            .map(|(path, hash)| FileEntry {
                path: path.clone(),
                hash: *hash,
                size: blobs.get(hash).map_or(0, |b| b.len() as u64),
            })
            .collect())
    }

    async fn blob(&self, hash: &ContentHash) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .read()
            .get(hash)
            .map(|b| b.to_vec())
            .ok_or(StoreError::BlobMissing(*hash))
    }
}
