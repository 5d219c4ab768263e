//! Workspace sync between the store and a sandbox
//!
//! A sandbox starts empty. Right after a machine is bound, every granted
//! subtree is copied into it; while it is bound the sandbox copy of the
//! read-write subtree is the one the student edits, and those edits are
//! pulled back into the store before grading and before the machine goes
//! away.
//!
//! Pulls only create or replace files. A file missing from the sandbox is
//! left alone in the store.

use crate::error::FleetError;
use crate::platform::{Platform, SandboxFile};
use crate::scoped::ScopedWorkspace;
use crate::types::{SandboxInstance, SandboxMount};
use labfleet_policy::{AccessMode, PolicyEngine};
use labfleet_workspace::{ContentHash, StudentId, WorkspacePath, WorkspaceStore};
use std::collections::HashMap;
use std::sync::Arc;

/// Moves granted subtrees in and out of sandboxes
#[derive(Clone)]
pub struct WorkspaceSync {
    store: Arc<dyn WorkspaceStore>,
    policy: PolicyEngine,
    platform: Arc<dyn Platform>,
}

impl WorkspaceSync {
    #[must_use]
    pub fn new(store: Arc<dyn WorkspaceStore>, policy: PolicyEngine, platform: Arc<dyn Platform>) -> Self {
        Self {
            store,
            policy,
            platform,
        }
    }

    fn scoped(&self, student: &StudentId) -> ScopedWorkspace {
        ScopedWorkspace::new(Arc::clone(&self.store), self.policy.grants_for(student))
    }

    /// Copy every readable file under the instance's mounts into the sandbox
    ///
    /// Returns the number of files sent.
    ///
    /// # Errors
    /// Store failures, or the platform refusing the transfer.
    pub async fn push(&self, instance: &SandboxInstance) -> Result<usize, FleetError> {
        let scoped = self.scoped(&instance.student);
        let mut files = Vec::new();
        for root in outermost(&instance.mounts) {
            for entry in scoped.list(root).await? {
                let body = scoped.read(&entry.path).await?;
                files.push(SandboxFile {
                    path: entry.path,
                    body,
                });
            }
        }

        if !files.is_empty() {
            self.platform.put_files(&instance.machine_id, &files).await?;
        }
        metrics::counter!("labfleet_sync_files_total", "direction" => "push")
            .increment(files.len() as u64);
        tracing::debug!(
            student = %instance.student,
            machine = %instance.machine_id,
            files = files.len(),
            "workspace pushed"
        );
        Ok(files.len())
    }

    /// Copy one file into the sandbox
    ///
    /// # Errors
    /// The platform refusing the transfer.
    pub async fn push_file(
        &self,
        instance: &SandboxInstance,
        path: &WorkspacePath,
        body: &[u8],
    ) -> Result<(), FleetError> {
        let file = SandboxFile {
            path: path.clone(),
            body: body.to_vec(),
        };
        self.platform.put_files(&instance.machine_id, &[file]).await?;
        Ok(())
    }

    /// Write sandbox files under `dir` that differ from the store back to it
    ///
    /// Returns the number of files written.
    ///
    /// # Errors
    /// [`FleetError::Policy`] if `dir` is not writable for the instance's
    /// student, otherwise platform or store failures.
    pub async fn pull(&self, instance: &SandboxInstance, dir: &WorkspacePath) -> Result<usize, FleetError> {
        let scoped = self.scoped(&instance.student);
        let fetched = self.platform.fetch_files(&instance.machine_id, dir).await?;
        let known: HashMap<WorkspacePath, ContentHash> = scoped
            .list(dir)
            .await?
            .into_iter()
            .map(|e| (e.path, e.hash))
            .collect();

        let mut written = 0;
        for file in fetched {
            if !dir.contains(&file.path) {
                tracing::warn!(path = %file.path, dir = %dir, "sandbox returned a file outside the pulled directory");
                continue;
            }
            if known.get(&file.path) == Some(&ContentHash::of(&file.body)) {
                continue;
            }
            scoped.write(&file.path, &file.body).await?;
            written += 1;
        }

        metrics::counter!("labfleet_sync_files_total", "direction" => "pull").increment(written as u64);
        tracing::debug!(
            student = %instance.student,
            machine = %instance.machine_id,
            dir = %dir,
            written,
            "workspace pulled"
        );
        Ok(written)
    }

    /// Pull every read-write mount of the instance
    ///
    /// # Errors
    /// See [`WorkspaceSync::pull`].
    pub async fn pull_writable(&self, instance: &SandboxInstance) -> Result<usize, FleetError> {
        let mut written = 0;
        for mount in instance.mounts.iter().filter(|m| m.mode == AccessMode::ReadWrite) {
            written += self.pull(instance, &mount.path).await?;
        }
        Ok(written)
    }
}

impl std::fmt::Debug for WorkspaceSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceSync")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Mount paths not nested under another mount
fn outermost(mounts: &[SandboxMount]) -> impl Iterator<Item = &WorkspacePath> {
    mounts.iter().map(|m| &m.path).filter(move |path| {
        !mounts
            .iter()
            .any(|other| &other.path != *path && other.path.contains(path))
    })
}
