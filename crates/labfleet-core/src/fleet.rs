//! Fleet facade
//!
//! Wires the pieces together:
//! ```text
//! classroom webhook -> GradingQueue -> GradingBridge -> ReportOutbox -> classroom
//!                                          |
//! student browser ----> SessionRouter -> SandboxProvisioner -> Platform
//!                              |                                  ^
//!                              +--------> WorkspaceSync ----------+
//!                                              |
//!                        ScopedWorkspace -> WorkspaceStore
//! ```
//! and owns the background tasks (idle reaper, report flusher, grading
//! worker) through a [`FleetHandle`].

use crate::config::{ConfigError, FleetConfig};
use crate::error::FleetError;
use crate::grading::{spawn_grading_worker, GradingBridge, GradingQueue, SubmissionEvent};
use crate::platform::Platform;
use crate::provisioner::SandboxProvisioner;
use crate::reporter::{ClassroomClient, ReportOutbox};
use crate::router::SessionRouter;
use crate::scoped::ScopedWorkspace;
use crate::submission::Submission;
use crate::sync::WorkspaceSync;
use crate::types::{ResourceProfile, SandboxInstance};
use labfleet_policy::{GrantSet, PolicyEngine};
use labfleet_workspace::{ContentHash, ExerciseCatalog, StudentId, WorkspacePath, WorkspaceStore};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// The orchestrator
pub struct Fleet {
    config: FleetConfig,
    store: Arc<dyn WorkspaceStore>,
    policy: PolicyEngine,
    router: Arc<SessionRouter>,
    bridge: Arc<GradingBridge>,
    outbox: Arc<ReportOutbox>,
    queue: GradingQueue,
    events: Mutex<Option<mpsc::Receiver<SubmissionEvent>>>,
}

impl Fleet {
    /// Build a fleet; nothing runs until [`Fleet::start`]
    ///
    /// # Errors
    /// [`FleetError::Config`] if the configuration is invalid.
    pub fn new(
        config: FleetConfig,
        store: Arc<dyn WorkspaceStore>,
        platform: Arc<dyn Platform>,
        classroom: Arc<dyn ClassroomClient>,
    ) -> Result<Self, FleetError> {
        config.validate()?;
        let policy =
            PolicyEngine::new(config.policy.clone()).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let sync = WorkspaceSync::new(Arc::clone(&store), policy.clone(), Arc::clone(&platform));
        let provisioner = Arc::new(SandboxProvisioner::new(
            platform,
            policy.clone(),
            config.provision.clone(),
        ));
        let router =
            Arc::new(SessionRouter::new(provisioner, config.router.clone()).with_sync(sync));
        let outbox = Arc::new(ReportOutbox::new(classroom, config.reporting.clone()));
        let catalog = ExerciseCatalog::new(Arc::clone(&store), config.catalog_capacity);
        let bridge = Arc::new(GradingBridge::new(
            Arc::clone(&router),
            catalog,
            policy.clone(),
            Arc::clone(&outbox),
            config.grading.clone(),
        ));
        let (queue, events) = GradingQueue::bounded(config.grading.queue_capacity);

        Ok(Self {
            config,
            store,
            policy,
            router,
            bridge,
            outbox,
            queue,
            events: Mutex::new(Some(events)),
        })
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Session router
    #[inline]
    #[must_use]
    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    /// Grading bridge
    #[inline]
    #[must_use]
    pub fn bridge(&self) -> &Arc<GradingBridge> {
        &self.bridge
    }

    /// Score report outbox
    #[inline]
    #[must_use]
    pub fn outbox(&self) -> &Arc<ReportOutbox> {
        &self.outbox
    }

    /// Grants for `student`
    #[must_use]
    pub fn grants_for(&self, student: &StudentId) -> GrantSet {
        self.policy.grants_for(student)
    }

    /// Store view limited to `student`'s grants
    #[must_use]
    pub fn workspace_for(&self, student: &StudentId) -> ScopedWorkspace {
        ScopedWorkspace::new(Arc::clone(&self.store), self.grants_for(student))
    }

    /// The student's sandbox, provisioned on first use
    ///
    /// # Errors
    /// See [`SessionRouter::route`].
    pub async fn open_session(
        &self,
        student: &StudentId,
        resources: Option<ResourceProfile>,
    ) -> Result<SandboxInstance, FleetError> {
        match resources {
            Some(resources) => self.router.route_with(student, resources).await,
            None => self.router.route(student).await,
        }
    }

    /// Save the student's edits and destroy their sandbox; `false` if there
    /// was none
    ///
    /// # Errors
    /// See [`SessionRouter::teardown`].
    pub async fn close_session(&self, student: &StudentId) -> Result<bool, FleetError> {
        self.router.teardown(student).await
    }

    /// Record browser activity; `false` if the student has no sandbox
    pub async fn heartbeat(&self, student: &StudentId) -> bool {
        self.router.touch(student).await
    }

    /// Read a file from the store through the student's grants
    ///
    /// Edits made inside a running sandbox show up here once they are
    /// pulled, at grading or teardown.
    ///
    /// # Errors
    /// See [`ScopedWorkspace::read`].
    pub async fn read_file(&self, student: &StudentId, path: &WorkspacePath) -> Result<Vec<u8>, FleetError> {
        self.workspace_for(student).read(path).await
    }

    /// Write a file through the student's grants, and into their sandbox if
    /// one is running
    ///
    /// # Errors
    /// See [`ScopedWorkspace::write`]; platform failures copying the file
    /// into the sandbox are returned after the store write has happened.
    pub async fn write_file(
        &self,
        student: &StudentId,
        path: &WorkspacePath,
        body: &[u8],
    ) -> Result<ContentHash, FleetError> {
        let hash = self.workspace_for(student).write(path, body).await?;
        if let (Some(sync), Some(instance)) = (self.router.sync(), self.router.instance_for(student).await) {
            sync.push_file(&instance, path, body).await?;
        }
        Ok(hash)
    }

    /// Queue a submission for background grading
    ///
    /// # Errors
    /// See [`GradingQueue::submit`].
    pub fn submit(&self, event: SubmissionEvent) -> Result<(), FleetError> {
        tracing::debug!(student = %event.student_id, exercise = %event.exercise_id, "submission queued");
        self.queue.submit(event)
    }

    /// Grade now, on the caller's task
    ///
    /// # Errors
    /// See [`GradingBridge::grade`].
    pub async fn grade_now(&self, event: &SubmissionEvent) -> Result<Submission, FleetError> {
        self.bridge.grade(event).await
    }

    /// Start the reaper, the report flusher and the grading worker
    ///
    /// # Errors
    /// [`FleetError::Config`] if called twice.
    pub fn start(&self) -> Result<FleetHandle, FleetError> {
        let events = self
            .events
            .lock()
            .take()
            .ok_or_else(|| ConfigError::Invalid("fleet already started".into()))?;
        let (stop_grading, grading_watch) = watch::channel(false);
        let (stop_background, background_watch) = watch::channel(false);

        let grading = spawn_grading_worker(Arc::clone(&self.bridge), events, grading_watch);
        let background = vec![
            self.router.spawn_reaper(background_watch.clone()),
            self.outbox.spawn_flusher(background_watch),
        ];
        tracing::info!(
            idle_timeout_secs = self.config.router.idle_timeout_secs,
            max_concurrent_grading = self.config.grading.max_concurrent,
            "fleet started"
        );
        Ok(FleetHandle {
            router: Arc::clone(&self.router),
            stop_grading,
            grading,
            stop_background,
            background,
        })
    }
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("config", &self.config)
            .field("outbox", &self.outbox)
            .finish_non_exhaustive()
    }
}

/// Running background tasks
#[derive(Debug)]
pub struct FleetHandle {
    router: Arc<SessionRouter>,
    stop_grading: watch::Sender<bool>,
    grading: JoinHandle<()>,
    stop_background: watch::Sender<bool>,
    background: Vec<JoinHandle<()>>,
}

impl FleetHandle {
    /// Stop every task, in dependency order
    ///
    /// The grading worker goes first and finishes every grading it holds,
    /// so their reports are queued before the flusher makes its last
    /// delivery pass. Sandboxes are left running.
    pub async fn shutdown(self) {
        let _ = self.stop_grading.send(true);
        if let Err(e) = self.grading.await {
            tracing::error!(error = %e, "grading worker panicked");
        }
        let _ = self.stop_background.send(true);
        for task in self.background {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "background task panicked");
            }
        }
        tracing::info!("fleet stopped");
    }

    /// [`FleetHandle::shutdown`], then save and destroy every sandbox
    ///
    /// Returns the number of sandboxes destroyed. Gradings have all finished
    /// by the time teardown starts, so none of them can bring a sandbox back.
    pub async fn shutdown_and_teardown(self) -> usize {
        let router = Arc::clone(&self.router);
        self.shutdown().await;
        let destroyed = router.teardown_all().await;
        tracing::info!(destroyed, "sandboxes torn down");
        destroyed
    }
}
