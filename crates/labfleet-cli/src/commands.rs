//! Operator commands
//!
//! [`Admin`] drives a [`Platform`] directly for the one-shot subcommands;
//! [`serve`] runs the long-lived fleet behind the HTTP surface.

use crate::access::{remove_access_file, write_access_file, AccessInfo};
use crate::roster::RosterEntry;
use crate::settings::Settings;
use futures::StreamExt;
use labfleet_core::{
    Fleet, MachineInfo, Platform, PlatformError, ProvisionError, ResourceProfile,
    SandboxInstance, SandboxProvisioner,
};
use labfleet_fly::{server, FlyMachines, HttpClassroom};
use labfleet_policy::{PolicyEngine, PolicyError};
use labfleet_workspace::{FsStore, StudentId};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

/// Failure of an operator command
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// The platform API failed outside provisioning
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// No sandbox could be brought up
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// The policy settings do not validate
    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),

    /// The student has no machine on the platform
    #[error("no sandbox for {0}")]
    NoSandbox(StudentId),

    /// Reading or writing a local access file failed
    #[error("{}: {source}", .path.display())]
    Io {
        /// File being accessed
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of `batch`
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Students with a running sandbox, and its URL
    pub provisioned: Vec<(StudentId, String)>,
    /// Students that could not be provisioned, and why
    pub failed: Vec<(StudentId, String)>,
}

impl BatchReport {
    /// True if every student got a sandbox
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One-shot sandbox administration
pub struct Admin {
    provisioner: SandboxProvisioner,
    access_dir: PathBuf,
}

impl Admin {
    /// Administer sandboxes on `platform` with the fleet settings
    ///
    /// # Errors
    /// [`AdminError::Policy`] for an invalid policy section.
    pub fn new(platform: Arc<dyn Platform>, settings: &Settings) -> Result<Self, AdminError> {
        let policy = PolicyEngine::new(settings.fleet.policy.clone())?;
        Ok(Self {
            provisioner: SandboxProvisioner::new(platform, policy, settings.fleet.provision.clone()),
            access_dir: settings.storage.access_dir.clone(),
        })
    }

    /// Every machine in the app
    ///
    /// # Errors
    /// Platform failures.
    pub async fn list(&self) -> Result<Vec<MachineInfo>, AdminError> {
        Ok(self.provisioner.platform().list().await?)
    }

    /// Bring up `student`'s sandbox and write their access file
    ///
    /// # Errors
    /// Provisioning failures, or the access file cannot be written.
    pub async fn provision(
        &self,
        student: &StudentId,
        resources: ResourceProfile,
    ) -> Result<(SandboxInstance, PathBuf), AdminError> {
        let instance = self.provisioner.provision(student, resources).await?;
        let info = AccessInfo {
            student_id: student.clone(),
            url: instance.url.clone(),
        };
        let path = write_access_file(&self.access_dir, &info)
            .await
            .map_err(|source| AdminError::Io {
                path: self.access_dir.join(student.as_str()),
                source,
            })?;
        Ok((instance, path))
    }

    /// Stop `student`'s machine, keeping its volume
    ///
    /// # Errors
    /// [`AdminError::NoSandbox`] when the student has no machine.
    pub async fn stop(&self, student: &StudentId) -> Result<MachineInfo, AdminError> {
        let machine = self.machine_for(student).await?;
        self.provisioner.platform().stop(&machine.id).await?;
        tracing::info!(student = %student, machine = %machine.id, "sandbox stopped");
        Ok(machine)
    }

    /// Start `student`'s stopped machine
    ///
    /// # Errors
    /// [`AdminError::NoSandbox`] when the student has no machine.
    pub async fn start(&self, student: &StudentId) -> Result<MachineInfo, AdminError> {
        let machine = self.machine_for(student).await?;
        self.provisioner.platform().start(&machine.id).await?;
        tracing::info!(student = %student, machine = %machine.id, "sandbox started");
        Ok(machine)
    }

    /// Destroy `student`'s machine and remove their access file
    ///
    /// # Errors
    /// [`AdminError::NoSandbox`] when the student has no machine.
    pub async fn delete(&self, student: &StudentId) -> Result<MachineInfo, AdminError> {
        let machine = self.machine_for(student).await?;
        self.provisioner.platform().destroy(&machine.id).await?;
        remove_access_file(&self.access_dir, student)
            .await
            .map_err(|source| AdminError::Io {
                path: self.access_dir.join(student.as_str()),
                source,
            })?;
        tracing::info!(student = %student, machine = %machine.id, "sandbox deleted");
        Ok(machine)
    }

    /// Provision a whole roster, at most `parallel` at a time
    ///
    /// One student's failure does not stop the others.
    pub async fn batch(&self, roster: Vec<RosterEntry>, parallel: usize) -> BatchReport {
        let outcomes: Vec<_> = futures::stream::iter(roster)
            .map(|entry| async move {
                let outcome = self.provision(&entry.student, entry.resources).await;
                (entry.student, outcome)
            })
            .buffer_unordered(parallel.max(1))
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (student, outcome) in outcomes {
            match outcome {
                Ok((instance, _)) => report.provisioned.push((student, instance.url)),
                Err(e) => {
                    tracing::warn!(student = %student, error = %e, "batch provision failed");
                    report.failed.push((student, e.to_string()));
                }
            }
        }
        report.provisioned.sort();
        report.failed.sort();
        report
    }

    async fn machine_for(&self, student: &StudentId) -> Result<MachineInfo, AdminError> {
        let name = self.provisioner.machine_name(student);
        self.provisioner
            .platform()
            .find_by_name(&name)
            .await?
            .ok_or_else(|| AdminError::NoSandbox(student.clone()))
    }
}

impl std::fmt::Debug for Admin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admin")
            .field("access_dir", &self.access_dir)
            .finish_non_exhaustive()
    }
}

/// Fly client for the one-shot commands, checked against the API first
///
/// # Errors
/// Incomplete Fly settings, or the app is not reachable with the token.
pub async fn fly_platform(settings: &Settings) -> anyhow::Result<Arc<FlyMachines>> {
    settings.fly.validate()?;
    let fly = FlyMachines::new(settings.fly.clone())?;
    fly.check_app()
        .await
        .map_err(|e| anyhow::anyhow!("fly app {:?} is not usable: {e}", settings.fly.app_name))?;
    Ok(Arc::new(fly))
}

/// Run the fleet and its HTTP surface until `shutdown` resolves
///
/// On shutdown, gradings in flight finish and their reports get a last
/// delivery pass; then sandboxes still bound are saved and destroyed.
///
/// # Errors
/// Startup failures: settings, store, Fly API or binding the listener.
pub async fn serve(
    settings: Settings,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let platform = fly_platform(&settings).await?;
    let store = Arc::new(
        FsStore::open(&settings.storage.store_root, settings.storage.cache_capacity).await?,
    );
    let classroom = Arc::new(HttpClassroom::new(settings.classroom.clone())?);
    if settings.classroom.report_url.is_empty() {
        tracing::warn!("CLASSROOM_REPORT_URL is not set; scores will stay queued");
    }

    let fleet = Arc::new(Fleet::new(
        settings.fleet.clone(),
        store,
        platform,
        classroom,
    )?);
    let handle = fleet.start()?;

    let (addr, running) = server::bind(
        Arc::clone(&fleet),
        &settings.server,
        settings.classroom.webhook_token.clone(),
        shutdown,
    )?;
    tracing::info!(%addr, app = %settings.fly.app_name, "labfleet listening");
    running.await;

    tracing::info!("shutting down");
    let destroyed = handle.shutdown_and_teardown().await;
    tracing::info!(destroyed, "labfleet stopped");
    Ok(())
}
