//! Grading bridge
//!
//! Turns a submission event into a graded [`Submission`]:
//! 1. resolve the exercise and route to the student's sandbox
//! 2. pull the sandbox's copy of the answers into the store, then snapshot
//!    them through the student's own grants
//! 3. run the suite's checks in order under one suite-wide deadline
//! 4. freeze the result and queue a score report
//!
//! When the deadline passes the running check is killed, finished checks
//! keep their results and the rest are `NotCompleted`. If the sandbox dies
//! mid-run the bridge moves to a fresh one and continues from the check
//! that was interrupted, at most `resume_attempts` times.
//!
//! The background worker retries a submission whose grading could not start
//! (no sandbox, store or platform trouble) with backoff. A submission it
//! gives up on, or that is still waiting when the fleet stops, is reported
//! as aborted; every queued submission ends in exactly one report.

use crate::config::GradingConfig;
use crate::error::{FleetError, PlatformError, ProvisionError};
use crate::platform::{ExecRequest, Platform};
use crate::reporter::{ReportOutbox, ScoreReport};
use crate::router::SessionRouter;
use crate::scoped::ScopedWorkspace;
use crate::submission::{CheckOutcome, CheckResult, GradingStatus, Submission};
use chrono::{DateTime, Utc};
use labfleet_policy::PolicyEngine;
use labfleet_workspace::{ExerciseCatalog, ExerciseId, Snapshot, StoreError, StudentId, WorkspacePath};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Inbound "student submitted" notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionEvent {
    /// Who submitted
    pub student_id: StudentId,
    /// Which exercise
    pub exercise_id: ExerciseId,
    /// When the classroom saw it; defaults to receipt time
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
    /// Classroom-side id, echoed back in the score report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
}

impl SubmissionEvent {
    /// Event stamped now
    #[must_use]
    pub fn new(student_id: StudentId, exercise_id: ExerciseId) -> Self {
        Self {
            student_id,
            exercise_id,
            submitted_at: Utc::now(),
            delivery_id: None,
        }
    }

    /// With a classroom-side delivery id
    #[must_use]
    pub fn with_delivery_id(mut self, delivery_id: impl Into<String>) -> Self {
        self.delivery_id = Some(delivery_id.into());
        self
    }
}

/// Runs test suites inside student sandboxes
pub struct GradingBridge {
    router: Arc<SessionRouter>,
    catalog: ExerciseCatalog,
    policy: PolicyEngine,
    outbox: Arc<ReportOutbox>,
    config: GradingConfig,
}

enum RunEnd {
    Finished,
    TimedOut,
    Aborted(String),
}

impl GradingBridge {
    /// New bridge
    #[must_use]
    pub fn new(
        router: Arc<SessionRouter>,
        catalog: ExerciseCatalog,
        policy: PolicyEngine,
        outbox: Arc<ReportOutbox>,
        config: GradingConfig,
    ) -> Self {
        Self {
            router,
            catalog,
            policy,
            outbox,
            config,
        }
    }

    fn platform(&self) -> &Arc<dyn Platform> {
        self.router.provisioner().platform()
    }

    /// Settings in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &GradingConfig {
        &self.config
    }

    fn answers_for(&self, student: &StudentId, exercise: &ExerciseId) -> Result<WorkspacePath, FleetError> {
        Ok(self
            .policy
            .answer_dir(student)
            .child(exercise.as_str())
            .map_err(StoreError::from)?)
    }

    fn scoped(&self, student: &StudentId) -> ScopedWorkspace {
        ScopedWorkspace::new(
            Arc::clone(self.catalog.store()),
            self.policy.grants_for(student),
        )
    }

    /// Grade one submission and queue its report
    ///
    /// # Errors
    /// - [`FleetError::UnknownExercise`] if the exercise has no manifest
    /// - [`FleetError::Provision`] if no sandbox could be brought up
    /// - platform or store failures while pulling the answers out of it
    /// - [`FleetError::GradingTimeout`] with the partial submission when the
    ///   suite deadline passes; the report is still queued
    /// - [`FleetError::GradingAborted`] when the sandbox could not be kept
    ///   alive; the report is still queued
    pub async fn grade(&self, event: &SubmissionEvent) -> Result<Submission, FleetError> {
        let student = &event.student_id;
        let exercise = match self.catalog.get(&event.exercise_id).await {
            Ok(exercise) => exercise,
            Err(StoreError::NotFound(_)) => {
                return Err(FleetError::UnknownExercise(event.exercise_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let answers = self.answers_for(student, &exercise.id)?;
        let mut instance = self.router.route(student).await?;
        if let Some(sync) = self.router.sync() {
            sync.pull(&instance, &answers).await?;
        }
        let snapshot = self.scoped(student).snapshot(&answers).await?;

        let budget = exercise.suite.timeout().min(self.config.max_suite_timeout());
        let deadline = Instant::now() + budget;
        let checks = &exercise.suite.checks;
        let mut results: Vec<CheckResult> = Vec::with_capacity(checks.len());
        let mut resumes_left = self.config.resume_attempts;

        tracing::info!(
            student = %student,
            exercise = %exercise.id,
            checks = checks.len(),
            budget_secs = budget.as_secs(),
            files = snapshot.len(),
            "grading started"
        );

        let end = loop {
            let Some(check) = checks.get(results.len()) else {
                break RunEnd::Finished;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break RunEnd::TimedOut;
            }

            let request = ExecRequest::new(check.command.clone(), answers.clone(), remaining);
            let started = Instant::now();
            let outcome = tokio::time::timeout_at(
                deadline,
                self.platform().exec(&instance.machine_id, &request),
            )
            .await;

            match outcome {
                Ok(Ok(output)) => {
                    let outcome = if output.success() {
                        CheckOutcome::Passed
                    } else {
                        CheckOutcome::Failed {
                            exit_code: output.exit_code,
                        }
                    };
                    tracing::debug!(check = %check.name, ?outcome, "check finished");
                    results.push(CheckResult {
                        name: check.name.clone(),
                        weight: check.weight,
                        outcome,
                        duration_ms: u64::try_from(started.elapsed().as_millis())
                            .unwrap_or(u64::MAX),
                    });
                }
                Ok(Err(PlatformError::MachineGone(reason))) if resumes_left > 0 => {
                    resumes_left -= 1;
                    tracing::warn!(
                        student = %student,
                        machine = %instance.machine_id,
                        check = %check.name,
                        %reason,
                        "sandbox lost during grading, resuming on a fresh one"
                    );
                    self.router.evict(student, instance.id).await;
                    instance = match self.router.route(student).await {
                        Ok(fresh) => fresh,
                        Err(e) => break RunEnd::Aborted(e.to_string()),
                    };
                }
                Ok(Err(e)) => break RunEnd::Aborted(e.to_string()),
                Err(_) => {
                    if let Err(e) = self
                        .platform()
                        .kill_exec(&instance.machine_id, request.exec_id)
                        .await
                    {
                        tracing::warn!(check = %check.name, error = %e, "could not kill timed-out check");
                    }
                    break RunEnd::TimedOut;
                }
            }
        };

        for check in &checks[results.len()..] {
            results.push(CheckResult::not_completed(&check.name, check.weight));
        }

        let status = match end {
            RunEnd::Finished => GradingStatus::Completed,
            RunEnd::TimedOut => GradingStatus::TimedOut,
            RunEnd::Aborted(_) => GradingStatus::Aborted,
        };
        let submission = Submission::new(
            student.clone(),
            exercise.id.clone(),
            event.submitted_at,
            Some(instance.id),
            snapshot,
            results,
            status,
        );
        let mut report = ScoreReport::from(&submission);
        report.delivery_id.clone_from(&event.delivery_id);
        if let RunEnd::Aborted(reason) = &end {
            report.detail = Some(reason.clone());
        }
        self.outbox.enqueue(report);
        metrics::counter!("labfleet_submissions_graded_total", "status" => status.to_string())
            .increment(1);
        tracing::info!(
            student = %student,
            exercise = %exercise.id,
            submission = %submission.id(),
            score = submission.score(),
            %status,
            "grading finished"
        );

        match end {
            RunEnd::Finished => Ok(submission),
            RunEnd::TimedOut => Err(FleetError::GradingTimeout {
                submission: Box::new(submission),
            }),
            RunEnd::Aborted(reason) => Err(FleetError::GradingAborted {
                submission: Box::new(submission),
                reason,
            }),
        }
    }

    /// Queue an aborted report for a submission that could not be graded
    ///
    /// Every check of the exercise, if it can still be loaded, is
    /// `NotCompleted`; the snapshot is whatever the store holds.
    pub async fn report_failure(&self, event: &SubmissionEvent, reason: &str) {
        let student = &event.student_id;
        let checks = match self.catalog.get(&event.exercise_id).await {
            Ok(exercise) => exercise
                .suite
                .checks
                .iter()
                .map(|c| CheckResult::not_completed(&c.name, c.weight))
                .collect(),
            Err(_) => Vec::new(),
        };
        let snapshot = match self.answers_for(student, &event.exercise_id) {
            Ok(answers) => match self.scoped(student).snapshot(&answers).await {
                Ok(snapshot) => snapshot,
                Err(_) => Snapshot::empty(answers),
            },
            Err(_) => Snapshot::empty(self.policy.answer_dir(student)),
        };
        let submission = Submission::new(
            student.clone(),
            event.exercise_id.clone(),
            event.submitted_at,
            None,
            snapshot,
            checks,
            GradingStatus::Aborted,
        );
        let mut report = ScoreReport::from(&submission);
        report.delivery_id.clone_from(&event.delivery_id);
        report.detail = Some(reason.to_string());
        self.outbox.enqueue(report);
        metrics::counter!("labfleet_submissions_graded_total", "status" => GradingStatus::Aborted.to_string())
            .increment(1);
        tracing::error!(
            student = %student,
            exercise = %event.exercise_id,
            submission = %submission.id(),
            reason,
            "submission could not be graded"
        );
    }
}

impl std::fmt::Debug for GradingBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradingBridge")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Producer side of the grading queue
#[derive(Debug, Clone)]
pub struct GradingQueue {
    sender: mpsc::Sender<SubmissionEvent>,
}

impl GradingQueue {
    /// Bounded queue plus its receiving end
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<SubmissionEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Enqueue without waiting
    ///
    /// # Errors
    /// - [`FleetError::QueueFull`] if the buffer is full
    /// - [`FleetError::ShuttingDown`] if the worker has stopped
    pub fn submit(&self, event: SubmissionEvent) -> Result<(), FleetError> {
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FleetError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => FleetError::ShuttingDown,
        })
    }
}

/// Whether a grading that failed before producing a result may succeed later
fn worth_regrading(err: &FleetError) -> bool {
    match err {
        FleetError::Provision(e) => !matches!(e, ProvisionError::Rejected { .. }),
        FleetError::Platform(e) => e.is_transient() || matches!(e, PlatformError::MachineGone(_)),
        FleetError::Store(e) => matches!(e, StoreError::Io { .. }),
        _ => false,
    }
}

/// Grade one queued submission until it produces a report
///
/// `permit` is the slot the dispatcher acquired; it is released while
/// waiting between tries.
async fn grade_queued(
    bridge: Arc<GradingBridge>,
    event: SubmissionEvent,
    permits: Arc<Semaphore>,
    permit: OwnedSemaphorePermit,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut permit = Some(permit);
    let mut failures = 0;
    loop {
        let held = match permit.take() {
            Some(held) => held,
            None => match Arc::clone(&permits).acquire_owned().await {
                Ok(held) => held,
                Err(_) => return,
            },
        };
        let result = bridge.grade(&event).await;
        drop(held);

        let err = match result {
            Ok(_) => return,
            Err(e @ (FleetError::GradingTimeout { .. } | FleetError::GradingAborted { .. })) => {
                tracing::warn!(student = %event.student_id, exercise = %event.exercise_id, error = %e, "grading incomplete");
                return;
            }
            Err(e) => e,
        };

        failures += 1;
        if !worth_regrading(&err) || failures >= bridge.config.max_attempts {
            bridge.report_failure(&event, &err.to_string()).await;
            return;
        }

        let delay = bridge.config.retry_backoff(failures);
        tracing::warn!(
            student = %event.student_id,
            exercise = %event.exercise_id,
            attempt = failures,
            delay_secs = delay.as_secs(),
            error = %err,
            "grading could not start, retrying"
        );
        let stopping = tokio::select! {
            () = tokio::time::sleep(delay) => false,
            _ = shutdown.wait_for(|stop| *stop) => true,
        };
        if stopping {
            bridge
                .report_failure(&event, &format!("fleet stopped before grading could start: {err}"))
                .await;
            return;
        }
    }
}

/// Grade queued submissions, at most `max_concurrent` at a time
///
/// When `shutdown` flips the queue is closed, submissions already buffered
/// are still graded, and the task ends once every grading has queued its
/// report.
pub fn spawn_grading_worker(
    bridge: Arc<GradingBridge>,
    mut events: mpsc::Receiver<SubmissionEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let permits = Arc::new(Semaphore::new(bridge.config.max_concurrent));
    tokio::spawn(async move {
        let mut running = tokio::task::JoinSet::new();
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            running.spawn(grade_queued(
                Arc::clone(&bridge),
                event,
                Arc::clone(&permits),
                permit,
                shutdown.clone(),
            ));
            while running.try_join_next().is_some() {}
        }

        events.close();
        while let Some(event) = events.recv().await {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            running.spawn(grade_queued(
                Arc::clone(&bridge),
                event,
                Arc::clone(&permits),
                permit,
                shutdown.clone(),
            ));
        }
        while running.join_next().await.is_some() {}
        tracing::debug!("grading worker stopped");
    })
}
