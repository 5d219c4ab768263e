//! Score reporting
//!
//! Grades are queued in a [`ReportOutbox`] and pushed to the classroom
//! through a [`ClassroomClient`]. Delivery failures never drop a report:
//! it stays queued with exponential backoff until the classroom accepts it.

use crate::config::ReportConfig;
use crate::error::IntegrationError;
use crate::submission::{CheckResult, GradingStatus, Submission};
use crate::types::SubmissionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_workspace::{ContentHash, ExerciseId, StudentId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Payload sent to the classroom for one graded submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreReport {
    /// Submission id; the classroom deduplicates on it
    pub submission_id: SubmissionId,
    /// Student
    pub student_id: StudentId,
    /// Exercise
    pub exercise_id: ExerciseId,
    /// Score in `0..=100`
    pub score: u8,
    /// How grading ended
    pub status: GradingStatus,
    /// Per-check results
    pub checks: Vec<CheckResult>,
    /// Hash of the graded answer snapshot
    pub snapshot_root: ContentHash,
    /// When the classroom reported the submission
    pub submitted_at: DateTime<Utc>,
    /// When grading finished
    pub graded_at: DateTime<Utc>,
    /// Classroom-side id of the submission event, if it had one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    /// Why grading did not complete, for aborted submissions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&Submission> for ScoreReport {
    fn from(submission: &Submission) -> Self {
        Self {
            submission_id: submission.id(),
            student_id: submission.student().clone(),
            exercise_id: submission.exercise().clone(),
            score: submission.score(),
            status: submission.status(),
            checks: submission.checks().to_vec(),
            snapshot_root: submission.snapshot().root,
            submitted_at: submission.submitted_at(),
            graded_at: submission.graded_at(),
            delivery_id: None,
            detail: None,
        }
    }
}

/// Outbound side of the classroom integration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClassroomClient: Send + Sync {
    /// Deliver one report; an error means "try again later"
    async fn report(&self, report: &ScoreReport) -> Result<(), IntegrationError>;
}

#[derive(Debug)]
struct Pending {
    report: ScoreReport,
    failures: u32,
    next_attempt: Instant,
}

/// Result of one flush pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushStats {
    /// Reports accepted by the classroom
    pub delivered: usize,
    /// Reports that failed and were requeued
    pub failed: usize,
    /// Reports still queued afterwards
    pub pending: usize,
}

/// Durable-until-delivered queue of score reports
pub struct ReportOutbox {
    client: Arc<dyn ClassroomClient>,
    queue: Mutex<VecDeque<Pending>>,
    flush_lock: tokio::sync::Mutex<()>,
    delivered: AtomicU64,
    config: ReportConfig,
}

impl ReportOutbox {
    /// New, empty outbox
    #[must_use]
    pub fn new(client: Arc<dyn ClassroomClient>, config: ReportConfig) -> Self {
        Self {
            client,
            queue: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            delivered: AtomicU64::new(0),
            config,
        }
    }

    /// Queue a report for delivery
    pub fn enqueue(&self, report: ScoreReport) {
        tracing::debug!(
            submission = %report.submission_id,
            student = %report.student_id,
            score = report.score,
            "report queued"
        );
        let mut queue = self.queue.lock();
        queue.push_back(Pending {
            report,
            failures: 0,
            next_attempt: Instant::now(),
        });
        metrics::gauge!("labfleet_reports_pending").set(queue.len() as f64);
    }

    /// Reports not yet accepted
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Reports accepted since start
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Try every report whose backoff has elapsed
    ///
    /// Reports are sent in queue order; failures go back to the end of the
    /// queue with a longer delay. Concurrent flushes serialize.
    pub async fn flush(&self) -> FlushStats {
        let _flushing = self.flush_lock.lock().await;
        let now = Instant::now();
        let due: Vec<Pending> = {
            let mut queue = self.queue.lock();
            let (due, waiting): (VecDeque<Pending>, VecDeque<Pending>) =
                queue.drain(..).partition(|p| p.next_attempt <= now);
            *queue = waiting;
            due.into_iter().collect()
        };

        let mut stats = FlushStats::default();
        let mut retry = Vec::new();
        for mut pending in due {
            match self.client.report(&pending.report).await {
                Ok(()) => {
                    stats.delivered += 1;
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("labfleet_reports_delivered_total").increment(1);
                    tracing::info!(
                        submission = %pending.report.submission_id,
                        student = %pending.report.student_id,
                        score = pending.report.score,
                        "score reported"
                    );
                }
                Err(e) => {
                    stats.failed += 1;
                    pending.failures += 1;
                    let delay = self.config.backoff(pending.failures);
                    pending.next_attempt = Instant::now() + delay;
                    metrics::counter!("labfleet_reports_failed_total").increment(1);
                    tracing::warn!(
                        submission = %pending.report.submission_id,
                        failures = pending.failures,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "score report failed"
                    );
                    retry.push(pending);
                }
            }
        }

        let mut queue = self.queue.lock();
        queue.extend(retry);
        stats.pending = queue.len();
        metrics::gauge!("labfleet_reports_pending").set(stats.pending as f64);
        stats
    }

    /// Flush periodically until `shutdown` flips, then flush once more
    pub fn spawn_flusher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(outbox.config.flush_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        outbox.flush().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            let stats = outbox.flush().await;
            if stats.pending > 0 {
                tracing::warn!(pending = stats.pending, "undelivered score reports at shutdown");
            }
        })
    }
}

impl std::fmt::Debug for ReportOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportOutbox")
            .field("pending", &self.pending())
            .field("delivered", &self.delivered())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::CheckOutcome;
    use labfleet_workspace::{FileEntry, Snapshot};
    use std::time::Duration;

    fn report(student: &str) -> ScoreReport {
        let submission = Submission::new(
            StudentId::new(student).unwrap(),
            ExerciseId::new("ex1").unwrap(),
            Utc::now(),
            None,
            Snapshot::from_entries("answers".parse().unwrap(), &Vec::<FileEntry>::new()).unwrap(),
            vec![CheckResult {
                name: "t".into(),
                weight: 1,
                outcome: CheckOutcome::Passed,
                duration_ms: 3,
            }],
            GradingStatus::Completed,
        );
        ScoreReport::from(&submission)
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_and_empties_queue() {
        let mut client = MockClassroomClient::new();
        client.expect_report().times(2).returning(|_| Ok(()));
        let outbox = ReportOutbox::new(Arc::new(client), ReportConfig::default());

        outbox.enqueue(report("alice"));
        outbox.enqueue(report("bob"));
        let stats = outbox.flush().await;

        assert_eq!(stats, FlushStats { delivered: 2, failed: 0, pending: 0 });
        assert_eq!(outbox.delivered(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reports_wait_for_backoff() {
        let mut client = MockClassroomClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_report()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(IntegrationError::Unreachable("down".into())));
        client
            .expect_report()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let outbox = ReportOutbox::new(Arc::new(client), ReportConfig::default());

        outbox.enqueue(report("alice"));
        assert_eq!(outbox.flush().await.failed, 1);

        // Still inside the backoff window: nothing is attempted.
        assert_eq!(outbox.flush().await, FlushStats { delivered: 0, failed: 0, pending: 1 });

        tokio::time::advance(Duration::from_secs(2)).await;
        let stats = outbox.flush().await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(outbox.pending(), 0);
    }

    #[test]
    fn report_serializes_submission() {
        let json = serde_json::to_value(report("alice")).unwrap();
        assert_eq!(json["student_id"], "alice");
        assert_eq!(json["score"], 100);
        assert_eq!(json["status"], "completed");
        assert_eq!(json["checks"][0]["outcome"], "passed");
        assert!(json.get("delivery_id").is_none());
    }
}
