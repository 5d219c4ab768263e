//! Sandbox provisioner
//!
//! Turns a student id into a running [`SandboxInstance`]:
//! - grants come from the policy engine and become mounts
//! - machine names are deterministic, so a retry after a timed-out attempt
//!   adopts the machine the first attempt created instead of making another
//! - each attempt has its own deadline; attempts back off exponentially
//! - when every attempt fails, whatever was created is destroyed

use crate::config::ProvisionConfig;
use crate::error::{PlatformError, ProvisionError};
use crate::platform::{MachineInfo, MachineRequest, MachineState, Platform};
use crate::types::{ResourceProfile, SandboxId, SandboxInstance, SandboxMount};
use chrono::Utc;
use labfleet_policy::PolicyEngine;
use labfleet_workspace::StudentId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Environment variable carrying the student id into the sandbox
pub const ENV_STUDENT_ID: &str = "STUDENT_ID";

/// Environment variable carrying the JSON-encoded mounts
pub const ENV_GRANTS: &str = "LABFLEET_GRANTS";

/// Creates and destroys sandboxes
pub struct SandboxProvisioner {
    platform: Arc<dyn Platform>,
    policy: PolicyEngine,
    config: ProvisionConfig,
}

impl SandboxProvisioner {
    /// New provisioner
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, policy: PolicyEngine, config: ProvisionConfig) -> Self {
        Self {
            platform,
            policy,
            config,
        }
    }

    /// Settings in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Platform handle
    #[inline]
    #[must_use]
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Deterministic machine name for `student`
    #[must_use]
    pub fn machine_name(&self, student: &StudentId) -> String {
        format!("{}{}", self.config.name_prefix, student)
    }

    /// Build the create request for `student`
    #[must_use]
    pub fn request_for(&self, student: &StudentId, resources: ResourceProfile) -> MachineRequest {
        let mounts = SandboxMount::from_grants(&self.policy.grants_for(student));
        let mut env = BTreeMap::new();
        env.insert(ENV_STUDENT_ID.to_string(), student.to_string());
        env.insert(
            ENV_GRANTS.to_string(),
            serde_json::to_string(&mounts).unwrap_or_else(|_| "[]".to_string()),
        );
        MachineRequest {
            name: self.machine_name(student),
            student: student.clone(),
            mounts,
            resources,
            env,
        }
    }

    /// Instance record for a machine already running for `student`
    #[must_use]
    pub fn instance_from(
        &self,
        student: &StudentId,
        machine: MachineInfo,
        resources: ResourceProfile,
    ) -> SandboxInstance {
        SandboxInstance {
            id: SandboxId::new(),
            student: student.clone(),
            machine_id: machine.id,
            name: machine.name,
            url: machine.url,
            mounts: SandboxMount::from_grants(&self.policy.grants_for(student)),
            resources,
            created_at: Utc::now(),
        }
    }

    /// Student a machine name belongs to, if it carries this fleet's prefix
    #[must_use]
    pub fn student_for(&self, machine_name: &str) -> Option<StudentId> {
        machine_name
            .strip_prefix(self.config.name_prefix.as_str())
            .and_then(|raw| StudentId::new(raw).ok())
    }

    /// Bring up a sandbox for `student`
    ///
    /// # Errors
    /// - [`ProvisionError::Rejected`] immediately for permanent refusals
    /// - [`ProvisionError::Exhausted`] after `max_attempts` retryable failures
    pub async fn provision(
        &self,
        student: &StudentId,
        resources: ResourceProfile,
    ) -> Result<SandboxInstance, ProvisionError> {
        let request = self.request_for(student, resources);
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            metrics::counter!("labfleet_provision_attempts_total").increment(1);

            let outcome =
                tokio::time::timeout(self.config.attempt_timeout(), self.attempt(&request)).await;
            let err = match outcome {
                Ok(Ok(machine)) => {
                    metrics::histogram!("labfleet_provision_seconds")
                        .record(started.elapsed().as_secs_f64());
                    tracing::info!(
                        student = %student,
                        machine = %machine.id,
                        attempt,
                        "sandbox started"
                    );
                    return Ok(self.instance_from(student, machine, resources));
                }
                Ok(Err(err)) => err,
                Err(_) => ProvisionError::Timeout(self.config.attempt_timeout()),
            };

            if !err.is_retryable() || attempt >= self.config.max_attempts {
                metrics::counter!("labfleet_provision_failures_total").increment(1);
                tracing::error!(student = %student, attempt, error = %err, "provisioning failed");
                self.cleanup(&request.name).await;
                if err.is_retryable() {
                    return Err(ProvisionError::Exhausted {
                        student: student.clone(),
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                return Err(err);
            }

            let delay = self.config.backoff(attempt);
            tracing::warn!(
                student = %student,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "provision attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One attempt: adopt or create, then wait for `started`
    async fn attempt(&self, request: &MachineRequest) -> Result<MachineInfo, ProvisionError> {
        let machine = match self.platform.find_by_name(&request.name).await? {
            Some(existing) if existing.state.is_terminal() => {
                tracing::debug!(machine = %existing.id, state = %existing.state, "replacing dead machine");
                self.platform.destroy(&existing.id).await?;
                self.platform.create(request).await?
            }
            Some(existing) => {
                tracing::debug!(machine = %existing.id, state = %existing.state, "adopting machine");
                if matches!(existing.state, MachineState::Stopped | MachineState::Stopping) {
                    self.platform.start(&existing.id).await?;
                }
                existing
            }
            None => self.platform.create(request).await?,
        };

        let mut state = machine.state;
        while !state.is_running() {
            if state.is_terminal() {
                return Err(ProvisionError::Unhealthy {
                    machine_id: machine.id,
                    state: state.to_string(),
                });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
            state = self.platform.status(&machine.id).await?;
        }
        Ok(machine)
    }

    /// Destroy anything left under `name` after a failed provision
    async fn cleanup(&self, name: &str) {
        match self.platform.find_by_name(name).await {
            Ok(Some(machine)) => {
                if let Err(e) = self.platform.destroy(&machine.id).await {
                    tracing::warn!(machine = %machine.id, error = %e, "cleanup destroy failed");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(name, error = %e, "cleanup lookup failed"),
        }
    }

    /// Is the instance's machine still running
    ///
    /// # Errors
    /// Transport failures; a missing machine is reported as `Ok(false)`.
    pub async fn is_alive(&self, instance: &SandboxInstance) -> Result<bool, PlatformError> {
        match self.platform.status(&instance.machine_id).await {
            Ok(state) => Ok(state.is_running()),
            Err(PlatformError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Destroy an instance's machine
    ///
    /// # Errors
    /// Propagates platform failures.
    pub async fn teardown(&self, instance: &SandboxInstance) -> Result<(), PlatformError> {
        self.platform.destroy(&instance.machine_id).await?;
        tracing::info!(student = %instance.student, machine = %instance.machine_id, "sandbox destroyed");
        Ok(())
    }
}

impl std::fmt::Debug for SandboxProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxProvisioner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ExecId, ExecOutput, ExecRequest, SandboxFile};
    use async_trait::async_trait;
    use labfleet_workspace::WorkspacePath;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Platform scripted with one create result per call
    #[derive(Default)]
    struct ScriptedPlatform {
        creates: Mutex<VecDeque<Result<MachineState, PlatformError>>>,
        machines: Mutex<Vec<MachineInfo>>,
        destroyed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Platform for ScriptedPlatform {
        async fn find_by_name(&self, name: &str) -> Result<Option<MachineInfo>, PlatformError> {
            Ok(self.machines.lock().iter().find(|m| m.name == name).cloned())
        }

        async fn create(&self, request: &MachineRequest) -> Result<MachineInfo, PlatformError> {
            let state = self
                .creates
                .lock()
                .pop_front()
                .unwrap_or(Ok(MachineState::Started))?;
            let mut machines = self.machines.lock();
            let info = MachineInfo {
                id: format!("m{}", machines.len()),
                name: request.name.clone(),
                state,
                url: format!("https://sandbox/{}", request.name),
            };
            machines.push(info.clone());
            Ok(info)
        }

        async fn status(&self, machine_id: &str) -> Result<MachineState, PlatformError> {
            self.machines
                .lock()
                .iter()
                .find(|m| m.id == machine_id)
                .map(|m| m.state)
                .ok_or_else(|| PlatformError::NotFound(machine_id.to_string()))
        }

        async fn start(&self, _machine_id: &str) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn stop(&self, _machine_id: &str) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn destroy(&self, machine_id: &str) -> Result<(), PlatformError> {
            self.machines.lock().retain(|m| m.id != machine_id);
            self.destroyed.lock().push(machine_id.to_string());
            Ok(())
        }

        async fn list(&self) -> Result<Vec<MachineInfo>, PlatformError> {
            Ok(self.machines.lock().clone())
        }

        async fn exec(&self, _: &str, _: &ExecRequest) -> Result<ExecOutput, PlatformError> {
            Ok(ExecOutput::default())
        }

        async fn kill_exec(&self, _: &str, _: ExecId) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn put_files(&self, _: &str, _: &[SandboxFile]) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn fetch_files(
            &self,
            _: &str,
            _: &WorkspacePath,
        ) -> Result<Vec<SandboxFile>, PlatformError> {
            Ok(Vec::new())
        }
    }

    fn fast_config() -> ProvisionConfig {
        ProvisionConfig {
            base_backoff_ms: 10,
            max_backoff_ms: 40,
            poll_interval_ms: 5,
            attempt_timeout_secs: 5,
            ..ProvisionConfig::default()
        }
    }

    fn provisioner(platform: Arc<ScriptedPlatform>) -> SandboxProvisioner {
        SandboxProvisioner::new(platform, PolicyEngine::default(), fast_config())
    }

    fn alice() -> StudentId {
        StudentId::new("alice").unwrap()
    }

    #[test]
    fn request_carries_student_and_grants() {
        let p = provisioner(Arc::new(ScriptedPlatform::default()));
        let request = p.request_for(&alice(), ResourceProfile::High);
        assert_eq!(request.name, "jupyter-alice");
        assert_eq!(request.env[ENV_STUDENT_ID], "alice");
        assert!(request.env[ENV_GRANTS].contains("answers/alice"));
        assert_eq!(request.mounts.len(), 2);
    }

    #[test]
    fn machine_names_map_back_to_students() {
        let p = provisioner(Arc::new(ScriptedPlatform::default()));
        assert_eq!(p.student_for("jupyter-alice"), Some(alice()));
        assert_eq!(p.student_for("web-alice"), None);
        assert_eq!(p.student_for("jupyter-"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_capacity_errors_then_succeeds() {
        let platform = Arc::new(ScriptedPlatform::default());
        platform
            .creates
            .lock()
            .push_back(Err(PlatformError::Capacity("full".into())));
        let p = provisioner(Arc::clone(&platform));

        let instance = p.provision(&alice(), ResourceProfile::Standard).await.unwrap();
        assert_eq!(instance.student, alice());
        assert_eq!(platform.machines.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried() {
        let platform = Arc::new(ScriptedPlatform::default());
        platform.creates.lock().push_back(Err(PlatformError::Rejected {
            status: 422,
            message: "bad image".into(),
        }));
        let p = provisioner(Arc::clone(&platform));

        let err = p.provision(&alice(), ResourceProfile::Standard).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Rejected { status: 422, .. }));
        assert!(platform.creates.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_machines_are_cleaned_up_after_last_attempt() {
        let platform = Arc::new(ScriptedPlatform::default());
        for _ in 0..3 {
            platform.creates.lock().push_back(Ok(MachineState::Failed));
        }
        let p = provisioner(Arc::clone(&platform));

        let err = p.provision(&alice(), ResourceProfile::Standard).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Exhausted { attempts: 3, .. }));
        assert!(platform.machines.lock().is_empty());
        assert_eq!(platform.destroyed.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_machine_is_adopted() {
        let platform = Arc::new(ScriptedPlatform::default());
        platform.machines.lock().push(MachineInfo {
            id: "old".into(),
            name: "jupyter-alice".into(),
            state: MachineState::Stopped,
            url: "https://sandbox/jupyter-alice".into(),
        });
        let p = provisioner(Arc::clone(&platform));

        // Stopped state never flips in this fake, so only the adoption path is observed.
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            p.attempt(&p.request_for(&alice(), ResourceProfile::Standard)),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(platform.machines.lock().len(), 1);
        assert_eq!(platform.machines.lock()[0].id, "old");
    }
}
