//! Session router
//!
//! Maps each student to at most one live sandbox:
//! - `route` returns the bound instance or provisions one
//! - concurrent routes for the same student serialize on a per-student lock
//!   and observe a single instance; different students never wait on each
//!   other
//! - a cold start runs in its own task holding the student's lock, so a
//!   caller that gives up still leaves the new machine bound and reapable
//! - a reaper tears down instances idle longer than the configured timeout
//!   and binds running machines that carry the fleet prefix but no binding
//! - with a [`WorkspaceSync`] attached, a fresh machine receives the granted
//!   subtrees and a machine being torn down hands its edits back first

use crate::config::RouterConfig;
use crate::error::{FleetError, PlatformError};
use crate::provisioner::SandboxProvisioner;
use crate::sync::WorkspaceSync;
use crate::types::{ResourceProfile, SandboxId, SandboxInstance, StudentSession};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use labfleet_workspace::StudentId;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug)]
struct Slot {
    instance: Option<SandboxInstance>,
    last_active: Instant,
    last_active_at: DateTime<Utc>,
}

impl Slot {
    fn new() -> Self {
        Self {
            instance: None,
            last_active: Instant::now(),
            last_active_at: Utc::now(),
        }
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
        self.last_active_at = Utc::now();
    }
}

/// Student to sandbox routing table
#[derive(Debug)]
pub struct SessionRouter {
    provisioner: Arc<SandboxProvisioner>,
    sync: Option<WorkspaceSync>,
    slots: DashMap<StudentId, Arc<Mutex<Slot>>>,
    config: RouterConfig,
}

impl SessionRouter {
    /// New router
    #[must_use]
    pub fn new(provisioner: Arc<SandboxProvisioner>, config: RouterConfig) -> Self {
        Self {
            provisioner,
            sync: None,
            slots: DashMap::new(),
            config,
        }
    }

    /// Copy workspaces in on bind and out before teardown
    #[must_use]
    pub fn with_sync(mut self, sync: WorkspaceSync) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Workspace sync, if attached
    #[inline]
    #[must_use]
    pub fn sync(&self) -> Option<&WorkspaceSync> {
        self.sync.as_ref()
    }

    /// Settings in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Provisioner used for cold starts
    #[inline]
    #[must_use]
    pub fn provisioner(&self) -> &Arc<SandboxProvisioner> {
        &self.provisioner
    }

    fn slot(&self, student: &StudentId) -> Arc<Mutex<Slot>> {
        Arc::clone(
            self.slots
                .entry(student.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Slot::new())))
                .value(),
        )
    }

    /// Live instance for `student`, provisioning one with the default size
    ///
    /// # Errors
    /// [`FleetError::Provision`] if no sandbox could be brought up; the
    /// student is left without a binding and the next call tries again.
    pub async fn route(&self, student: &StudentId) -> Result<SandboxInstance, FleetError> {
        let resources = self.provisioner.config().default_resources;
        self.route_with(student, resources).await
    }

    /// Live instance for `student`; `resources` applies only to a cold start
    ///
    /// # Errors
    /// See [`SessionRouter::route`].
    pub async fn route_with(
        &self,
        student: &StudentId,
        resources: ResourceProfile,
    ) -> Result<SandboxInstance, FleetError> {
        let slot = self.slot(student);
        let mut guard = slot.lock_owned().await;

        if let Some(instance) = guard.instance.clone() {
            if self.is_reusable(&instance).await {
                guard.touch();
                metrics::counter!("labfleet_routes_total", "path" => "warm").increment(1);
                return Ok(instance);
            }
            tracing::warn!(
                student = %student,
                machine = %instance.machine_id,
                "bound sandbox is no longer running, replacing"
            );
            guard.instance = None;
            self.destroy_quietly(&instance).await;
        }

        let cold = tokio::spawn(Self::cold_start(
            Arc::clone(&self.provisioner),
            self.sync.clone(),
            student.clone(),
            resources,
            guard,
        ));
        match cold.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(FleetError::ShuttingDown),
        }
    }

    /// Provision, fill and bind a sandbox while holding the student's slot
    async fn cold_start(
        provisioner: Arc<SandboxProvisioner>,
        sync: Option<WorkspaceSync>,
        student: StudentId,
        resources: ResourceProfile,
        mut slot: OwnedMutexGuard<Slot>,
    ) -> Result<SandboxInstance, FleetError> {
        let instance = provisioner.provision(&student, resources).await?;
        if let Some(sync) = &sync {
            if let Err(e) = sync.push(&instance).await {
                tracing::error!(
                    student = %student,
                    machine = %instance.machine_id,
                    error = %e,
                    "workspace push failed, destroying sandbox"
                );
                if let Err(destroy) = provisioner.teardown(&instance).await {
                    tracing::warn!(machine = %instance.machine_id, error = %destroy, "destroy failed");
                }
                return Err(e);
            }
        }
        slot.instance = Some(instance.clone());
        slot.touch();
        metrics::counter!("labfleet_routes_total", "path" => "cold").increment(1);
        Ok(instance)
    }

    async fn is_reusable(&self, instance: &SandboxInstance) -> bool {
        if !self.config.health_check_on_route {
            return true;
        }
        match self.provisioner.is_alive(instance).await {
            Ok(alive) => alive,
            Err(e) => {
                // Transport trouble is not evidence the machine died.
                tracing::debug!(machine = %instance.machine_id, error = %e, "health check failed");
                true
            }
        }
    }

    async fn destroy_quietly(&self, instance: &SandboxInstance) {
        if let Err(e) = self.provisioner.teardown(instance).await {
            tracing::warn!(machine = %instance.machine_id, error = %e, "destroy failed");
        }
    }

    /// Pull the sandbox's writable subtrees into the store
    ///
    /// Returns `false` if the machine is still there but the pull failed.
    async fn save_work(&self, instance: &SandboxInstance) -> bool {
        let Some(sync) = &self.sync else {
            return true;
        };
        match sync.pull_writable(instance).await {
            Ok(_) => true,
            Err(FleetError::Platform(PlatformError::MachineGone(_) | PlatformError::NotFound(_))) => {
                true
            }
            Err(e) => {
                tracing::warn!(
                    student = %instance.student,
                    machine = %instance.machine_id,
                    error = %e,
                    "could not save sandbox edits"
                );
                false
            }
        }
    }

    /// Record activity without routing
    ///
    /// Returns `false` if the student has no bound sandbox.
    pub async fn touch(&self, student: &StudentId) -> bool {
        let Some(slot) = self.slots.get(student).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut guard = slot.lock().await;
        if guard.instance.is_none() {
            return false;
        }
        guard.touch();
        true
    }

    /// Bound instance, if any, without provisioning
    pub async fn instance_for(&self, student: &StudentId) -> Option<SandboxInstance> {
        let slot = self.slots.get(student).map(|s| Arc::clone(s.value()))?;
        let guard = slot.lock().await;
        guard.instance.clone()
    }

    /// Save the student's edits and destroy their sandbox
    ///
    /// Returns `false` if nothing was bound. The binding is cleared even when
    /// the save or the platform call fails, so the next route provisions
    /// afresh.
    ///
    /// # Errors
    /// [`FleetError::Platform`] if the destroy call fails.
    pub async fn teardown(&self, student: &StudentId) -> Result<bool, FleetError> {
        let Some(slot) = self.slots.get(student).map(|s| Arc::clone(s.value())) else {
            return Ok(false);
        };
        let mut guard = slot.lock().await;
        let Some(instance) = guard.instance.take() else {
            return Ok(false);
        };
        self.save_work(&instance).await;
        let result = self.provisioner.teardown(&instance).await;
        drop(guard);
        drop(slot);
        self.forget_if_unused(student);
        result?;
        Ok(true)
    }

    /// Drop the binding if it is still `instance_id`
    ///
    /// Used when a caller discovers the sandbox died underneath it. A later
    /// binding made by someone else is left alone.
    pub async fn evict(&self, student: &StudentId, instance_id: SandboxId) {
        let Some(slot) = self.slots.get(student).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut guard = slot.lock().await;
        if guard.instance.as_ref().is_some_and(|i| i.id == instance_id) {
            if let Some(instance) = guard.instance.take() {
                tracing::info!(student = %student, machine = %instance.machine_id, "evicting sandbox");
                self.destroy_quietly(&instance).await;
            }
        }
    }

    /// Tear down every instance idle longer than the timeout
    ///
    /// Slots that are busy (being routed right now) are skipped; they are by
    /// definition not idle. A sandbox whose edits could not be saved stays
    /// bound until a later pass. Returns the students whose sandboxes were
    /// reaped.
    pub async fn reap_idle(&self) -> Vec<StudentId> {
        let timeout = self.config.idle_timeout();
        let candidates: Vec<(StudentId, Arc<Mutex<Slot>>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut reaped = Vec::new();
        for (student, slot) in candidates {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            if guard.last_active.elapsed() < timeout {
                continue;
            }
            let Some(instance) = guard.instance.clone() else {
                continue;
            };
            if !self.save_work(&instance).await {
                continue;
            }
            guard.instance = None;
            tracing::info!(
                student = %student,
                machine = %instance.machine_id,
                idle_secs = timeout.as_secs(),
                "reaping idle sandbox"
            );
            self.destroy_quietly(&instance).await;
            drop(guard);
            drop(slot);
            metrics::counter!("labfleet_sandboxes_reaped_total").increment(1);
            self.forget_if_unused(&student);
            reaped.push(student);
        }
        reaped
    }

    /// Bind running prefixed machines that no student slot points at
    ///
    /// Such machines are left behind by a cold start whose caller vanished
    /// mid-flight, or by a previous process. Adopted machines are treated as
    /// freshly active, so they are reaped after one idle timeout. Busy slots
    /// are skipped. Returns the students that gained a binding.
    ///
    /// # Errors
    /// [`FleetError::Platform`] if the machines cannot be listed.
    pub async fn adopt_orphans(&self) -> Result<Vec<StudentId>, FleetError> {
        let machines = self.provisioner.platform().list().await?;
        let resources = self.provisioner.config().default_resources;
        let mut adopted = Vec::new();
        for machine in machines {
            if !machine.state.is_running() {
                continue;
            }
            let Some(student) = self.provisioner.student_for(&machine.name) else {
                continue;
            };
            let slot = self.slot(&student);
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            if guard.instance.is_some() {
                continue;
            }
            tracing::warn!(student = %student, machine = %machine.id, "adopting unbound sandbox");
            guard.instance = Some(self.provisioner.instance_from(&student, machine, resources));
            guard.touch();
            metrics::counter!("labfleet_sandboxes_adopted_total").increment(1);
            adopted.push(student);
        }
        Ok(adopted)
    }

    /// Remove an empty slot nobody else holds
    fn forget_if_unused(&self, student: &StudentId) {
        self.slots.remove_if(student, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot.try_lock().is_ok_and(|guard| guard.instance.is_none())
        });
    }

    /// Run [`SessionRouter::adopt_orphans`] then [`SessionRouter::reap_idle`]
    /// periodically until `shutdown` flips
    pub fn spawn_reaper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(router.config.reap_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = router.adopt_orphans().await {
                            tracing::warn!(error = %e, "orphan sweep failed");
                        }
                        let reaped = router.reap_idle().await;
                        if !reaped.is_empty() {
                            tracing::debug!(count = reaped.len(), "reaper pass");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Students with a bound instance, sorted
    pub async fn students(&self) -> Vec<StudentId> {
        self.sessions()
            .await
            .into_iter()
            .filter(|s| s.instance.is_some())
            .map(|s| s.student)
            .collect()
    }

    /// Number of students with a bound instance
    pub async fn live_count(&self) -> usize {
        self.sessions().await.iter().filter(|s| s.instance.is_some()).count()
    }

    /// Snapshot of every routing entry, sorted by student
    pub async fn sessions(&self) -> Vec<StudentSession> {
        let slots: Vec<(StudentId, Arc<Mutex<Slot>>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut sessions = Vec::with_capacity(slots.len());
        for (student, slot) in slots {
            let guard = slot.lock().await;
            sessions.push(StudentSession {
                student,
                instance: guard.instance.clone(),
                last_active: guard.last_active_at,
            });
        }
        sessions.sort_by(|a, b| a.student.cmp(&b.student));
        sessions
    }

    /// Destroy every bound instance
    pub async fn teardown_all(&self) -> usize {
        let students: Vec<StudentId> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut count = 0;
        for student in students {
            match self.teardown(&student).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(student = %student, error = %e, "teardown failed"),
            }
        }
        count
    }
}
