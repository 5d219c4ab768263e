//! Exercise definitions and the catalog that loads them
//!
//! Each exercise lives at `exercises/<id>/` with an `exercise.toml`
//! manifest next to its canonical files:
//!
//! ```toml
//! title = "List comprehensions"
//!
//! [tests]
//! timeout_secs = 60
//!
//! [[tests.check]]
//! name = "squares"
//! command = ["pytest", "-q", "tests/test_squares.py"]
//! weight = 2
//! ```

use crate::hash::ContentHash;
use crate::ids::ExerciseId;
use crate::path::WorkspacePath;
use crate::store::{StoreError, WorkspaceStore};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// File name of the manifest inside an exercise directory
pub const MANIFEST_FILE: &str = "exercise.toml";

const DEFAULT_SUITE_TIMEOUT_SECS: u64 = 120;

/// One test check run inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    /// Name reported back to the classroom
    pub name: String,
    /// argv, run from the student's answer directory
    pub command: Vec<String>,
    /// Share of the score; defaults to 1
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Ordered checks plus a suite-wide deadline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    /// Wall-clock budget for all checks together
    #[serde(default = "default_suite_timeout")]
    pub timeout_secs: u64,
    /// Checks in execution order
    #[serde(default, rename = "check")]
    pub checks: Vec<CheckSpec>,
}

fn default_suite_timeout() -> u64 {
    DEFAULT_SUITE_TIMEOUT_SECS
}

impl TestSuite {
    /// Suite deadline
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Sum of all check weights
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.checks.iter().map(|c| u64::from(c.weight)).sum()
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    title: String,
    tests: TestSuite,
}

/// A loaded exercise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exercise {
    /// Identifier
    pub id: ExerciseId,
    /// Human title
    pub title: String,
    /// Test suite from the manifest
    pub suite: TestSuite,
    /// Canonical files, relative to the exercise directory
    pub files: BTreeMap<WorkspacePath, ContentHash>,
}

impl Exercise {
    /// Load `exercises/<id>/` from the store
    ///
    /// # Errors
    /// - [`StoreError::NotFound`] if the manifest is missing
    /// - [`StoreError::Manifest`] if it does not parse or a check has an empty command
    pub async fn load(store: &dyn WorkspaceStore, id: &ExerciseId) -> Result<Self, StoreError> {
        let dir = WorkspacePath::exercise(id);
        let manifest_path = dir.child(MANIFEST_FILE)?;
        let raw = store.read(&manifest_path).await?;
        let text = String::from_utf8(raw).map_err(|e| StoreError::Manifest {
            path: manifest_path.clone(),
            message: e.to_string(),
        })?;
        let manifest = parse_manifest(&manifest_path, &text)?;

        let snapshot = store.snapshot(&dir).await?;
        Ok(Self {
            id: id.clone(),
            title: manifest.title,
            suite: manifest.tests,
            files: snapshot.files,
        })
    }
}

fn parse_manifest(path: &WorkspacePath, text: &str) -> Result<Manifest, StoreError> {
    let manifest: Manifest = toml::from_str(text).map_err(|e| StoreError::Manifest {
        path: path.clone(),
        message: e.to_string(),
    })?;
    if let Some(check) = manifest.tests.checks.iter().find(|c| c.command.is_empty()) {
        return Err(StoreError::Manifest {
            path: path.clone(),
            message: format!("check '{}' has an empty command", check.name),
        });
    }
    Ok(manifest)
}

/// Caches loaded exercises by id
///
/// The corpus changes only through the administration path, which calls
/// [`ExerciseCatalog::invalidate`] after publishing.
#[derive(Debug, Clone)]
pub struct ExerciseCatalog {
    store: Arc<dyn WorkspaceStore>,
    cache: Cache<ExerciseId, Arc<Exercise>>,
}

impl ExerciseCatalog {
    /// Catalog over `store` holding at most `capacity` exercises
    #[must_use]
    pub fn new(store: Arc<dyn WorkspaceStore>, capacity: u64) -> Self {
        Self {
            store,
            cache: Cache::new(capacity),
        }
    }

    /// Fetch an exercise, loading it on first use
    ///
    /// # Errors
    /// See [`Exercise::load`].
    pub async fn get(&self, id: &ExerciseId) -> Result<Arc<Exercise>, StoreError> {
        if let Some(cached) = self.cache.get(id).await {
            return Ok(cached);
        }
        let exercise = Arc::new(Exercise::load(self.store.as_ref(), id).await?);
        self.cache.insert(id.clone(), Arc::clone(&exercise)).await;
        tracing::debug!(exercise = %id, checks = exercise.suite.checks.len(), "loaded exercise");
        Ok(exercise)
    }

    /// Drop a cached exercise after its files change
    pub async fn invalidate(&self, id: &ExerciseId) {
        self.cache.invalidate(id).await;
    }

    /// Every exercise id that has a manifest
    ///
    /// # Errors
    /// Propagates store listing errors.
    pub async fn ids(&self) -> Result<Vec<ExerciseId>, StoreError> {
        let entries = self.store.list(&WorkspacePath::corpus()).await?;
        let mut ids: Vec<ExerciseId> = entries
            .iter()
            .filter_map(|e| match e.path.segments() {
                [_, id, file] if file == MANIFEST_FILE => ExerciseId::new(id.as_str()).ok(),
                _ => None,
            })
            .collect();
        ids.dedup();
        Ok(ids)
    }

    /// Underlying store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn WorkspaceStore> {
        &self.store
    }
}
