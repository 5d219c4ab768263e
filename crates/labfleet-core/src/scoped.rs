//! Policy-enforcing view of the workspace store
//!
//! Every file operation a sandbox (or anything acting for a student) makes
//! goes through a [`ScopedWorkspace`]. The grant check happens before the
//! store is touched, so a denied write leaves the store unchanged.

use crate::error::FleetError;
use labfleet_policy::{GrantSet, Operation};
use labfleet_workspace::{ContentHash, FileEntry, Snapshot, StudentId, WorkspacePath, WorkspaceStore};
use std::sync::Arc;

/// Store access limited to one student's grants
#[derive(Debug, Clone)]
pub struct ScopedWorkspace {
    store: Arc<dyn WorkspaceStore>,
    grants: GrantSet,
}

impl ScopedWorkspace {
    /// Wrap `store` with `grants`
    #[must_use]
    pub fn new(store: Arc<dyn WorkspaceStore>, grants: GrantSet) -> Self {
        Self { store, grants }
    }

    /// Whose view this is
    #[inline]
    #[must_use]
    pub fn student(&self) -> &StudentId {
        self.grants.student()
    }

    /// Grants in force
    #[inline]
    #[must_use]
    pub fn grants(&self) -> &GrantSet {
        &self.grants
    }

    /// Read a file
    ///
    /// # Errors
    /// [`FleetError::Policy`] if no grant covers `path`, otherwise store errors.
    pub async fn read(&self, path: &WorkspacePath) -> Result<Vec<u8>, FleetError> {
        self.grants.check(path, Operation::Read)?;
        Ok(self.store.read(path).await?)
    }

    /// Write a file
    ///
    /// # Errors
    /// [`FleetError::Policy`] unless `path` resolves to a read-write grant.
    pub async fn write(&self, path: &WorkspacePath, body: &[u8]) -> Result<ContentHash, FleetError> {
        self.grants.check(path, Operation::Write)?;
        Ok(self.store.write(path, body).await?)
    }

    /// Delete a file
    ///
    /// # Errors
    /// Same rules as [`ScopedWorkspace::write`].
    pub async fn remove(&self, path: &WorkspacePath) -> Result<(), FleetError> {
        self.grants.check(path, Operation::Write)?;
        Ok(self.store.remove(path).await?)
    }

    /// List files under `prefix` that the student may read
    ///
    /// # Errors
    /// [`FleetError::Policy`] if `prefix` itself is not covered.
    pub async fn list(&self, prefix: &WorkspacePath) -> Result<Vec<FileEntry>, FleetError> {
        self.grants.check(prefix, Operation::List)?;
        let mut entries = self.store.list(prefix).await?;
        entries.retain(|e| self.grants.allows(&e.path, Operation::Read));
        Ok(entries)
    }

    /// Snapshot of the readable files under `prefix`
    ///
    /// # Errors
    /// See [`ScopedWorkspace::list`].
    pub async fn snapshot(&self, prefix: &WorkspacePath) -> Result<Snapshot, FleetError> {
        let entries = self.list(prefix).await?;
        Ok(Snapshot::from_entries(prefix.clone(), &entries)?)
    }
}
