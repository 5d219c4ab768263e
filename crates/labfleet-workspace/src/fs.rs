//! Filesystem-backed workspace store
//!
//! Layout under the root directory:
//! - `<path>`: live files, exactly where a sandbox volume mount sees them
//! - `.objects/<2 hex>/<64 hex>`: immutable bodies keyed by hash
//!
//! Files written by sandboxes directly (not through this type) have no object
//! yet; `list` hashes them and fills the object in, which is what lets a
//! snapshot outlive later edits.

use crate::hash::ContentHash;
use crate::path::WorkspacePath;
use crate::store::{FileEntry, StoreError, WorkspaceStore};
use async_trait::async_trait;
use moka::future::Cache;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

const OBJECTS_DIR: &str = ".objects";

/// Store rooted at a local (or mounted) directory
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    cache: Cache<ContentHash, Arc<Vec<u8>>>,
}

impl FsStore {
    /// Open a store at `root`, creating the directory if needed
    ///
    /// `cache_capacity` bounds the number of bodies kept in memory.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] if the root cannot be created.
    pub async fn open(root: impl Into<PathBuf>, cache_capacity: u64) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(OBJECTS_DIR))
            .await
            .map_err(|e| StoreError::io(&root, e))?;
        Ok(Self {
            root,
            cache: Cache::new(cache_capacity),
        })
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, path: &WorkspacePath) -> PathBuf {
        self.root.join(path.to_relative_path())
    }

    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_string();
        self.root.join(OBJECTS_DIR).join(&hex[..2]).join(hex)
    }

    async fn ensure_object(&self, hash: &ContentHash, body: &[u8]) -> Result<(), StoreError> {
        let object = self.object_path(hash);
        if fs::try_exists(&object).await.unwrap_or(false) {
            return Ok(());
        }
        write_atomic(&object, body).await
    }
}

async fn write_atomic(target: &Path, body: &[u8]) -> Result<(), StoreError> {
    if let Some(dir) = target.parent() {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StoreError::io(dir, e))?;
    }
    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".partial");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, target)
        .await
        .map_err(|e| StoreError::io(target, e))
}

#[async_trait]
impl WorkspaceStore for FsStore {
    async fn read(&self, path: &WorkspacePath) -> Result<Vec<u8>, StoreError> {
        let file = self.file_path(path);
        match fs::read(&file).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.clone()))
            }
            Err(e) => Err(StoreError::io(file, e)),
        }
    }

    async fn write(&self, path: &WorkspacePath, body: &[u8]) -> Result<ContentHash, StoreError> {
        let hash = ContentHash::of(body);
        self.ensure_object(&hash, body).await?;
        write_atomic(&self.file_path(path), body).await?;
        tracing::trace!(%path, hash = %hash.short(), "stored file");
        Ok(hash)
    }

    async fn remove(&self, path: &WorkspacePath) -> Result<(), StoreError> {
        let file = self.file_path(path);
        match fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(file, e)),
        }
    }

    async fn list(&self, prefix: &WorkspacePath) -> Result<Vec<FileEntry>, StoreError> {
        let start = self.file_path(prefix);
        let mut pending = vec![(start, prefix.clone())];
        let mut entries = Vec::new();

        while let Some((dir, logical)) = pending.pop() {
            let mut reader = match fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(dir, e)),
            };
            while let Some(item) = reader
                .next_entry()
                .await
                .map_err(|e| StoreError::io(&dir, e))?
            {
                let name = item.file_name().to_string_lossy().into_owned();
                if logical.is_root() && name == OBJECTS_DIR {
                    continue;
                }
                let child = logical.child(&name)?;
                let kind = item
                    .file_type()
                    .await
                    .map_err(|e| StoreError::io(item.path(), e))?;
                if kind.is_dir() {
                    pending.push((item.path(), child));
                } else if kind.is_file() {
                    let body = fs::read(item.path())
                        .await
                        .map_err(|e| StoreError::io(item.path(), e))?;
                    let hash = ContentHash::of(&body);
                    self.ensure_object(&hash, &body).await?;
                    entries.push(FileEntry {
                        path: child,
                        hash,
                        size: body.len() as u64,
                    });
                }
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn blob(&self, hash: &ContentHash) -> Result<Vec<u8>, StoreError> {
        if let Some(cached) = self.cache.get(hash).await {
            return Ok(cached.as_ref().clone());
        }
        let object = self.object_path(hash);
        let body = match fs::read(&object).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::BlobMissing(*hash))
            }
            Err(e) => return Err(StoreError::io(object, e)),
        };
        self.cache.insert(*hash, Arc::new(body.clone())).await;
        Ok(body)
    }
}
