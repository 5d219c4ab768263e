//! Graded submissions
//!
//! A [`Submission`] is built once, after the suite has finished or been cut
//! off, and never changes afterwards. Fields are private and exposed through
//! getters so nothing downstream can edit a grade.

use crate::types::{SandboxId, SubmissionId};
use chrono::{DateTime, Utc};
use labfleet_workspace::{ExerciseId, Snapshot, StudentId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CheckOutcome {
    /// Exit code zero
    Passed,
    /// Non-zero exit code
    Failed {
        /// Process exit code
        exit_code: i32,
    },
    /// Did not finish before the suite deadline or the sandbox was lost
    NotCompleted,
}

impl CheckOutcome {
    /// True for [`CheckOutcome::Passed`]
    #[inline]
    #[must_use]
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Result of one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name from the manifest
    pub name: String,
    /// Weight from the manifest
    pub weight: u32,
    /// Outcome
    #[serde(flatten)]
    pub outcome: CheckOutcome,
    /// Wall-clock time spent, zero for checks that never ran
    pub duration_ms: u64,
}

impl CheckResult {
    /// A check the suite never got to
    #[must_use]
    pub fn not_completed(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
            outcome: CheckOutcome::NotCompleted,
            duration_ms: 0,
        }
    }
}

/// How the grading run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingStatus {
    /// Every check ran
    Completed,
    /// The suite deadline passed
    TimedOut,
    /// The sandbox could not be kept alive
    Aborted,
}

impl fmt::Display for GradingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Aborted => "aborted",
        })
    }
}

/// Weighted score in `0..=100`, rounded down
///
/// Checks that did not complete count towards the total but never towards
/// the passed weight. A suite with no weight scores zero.
#[must_use]
pub fn score(checks: &[CheckResult]) -> u8 {
    let total: u64 = checks.iter().map(|c| u64::from(c.weight)).sum();
    if total == 0 {
        return 0;
    }
    let passed: u64 = checks
        .iter()
        .filter(|c| c.outcome.is_passed())
        .map(|c| u64::from(c.weight))
        .sum();
    u8::try_from(passed * 100 / total).unwrap_or(100)
}

/// An immutable graded submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    id: SubmissionId,
    student: StudentId,
    exercise: ExerciseId,
    submitted_at: DateTime<Utc>,
    graded_at: DateTime<Utc>,
    sandbox: Option<SandboxId>,
    snapshot: Snapshot,
    checks: Vec<CheckResult>,
    status: GradingStatus,
    score: u8,
}

impl Submission {
    /// Freeze a grading run; the score is computed here
    #[must_use]
    pub fn new(
        student: StudentId,
        exercise: ExerciseId,
        submitted_at: DateTime<Utc>,
        sandbox: Option<SandboxId>,
        snapshot: Snapshot,
        checks: Vec<CheckResult>,
        status: GradingStatus,
    ) -> Self {
        let score = score(&checks);
        Self {
            id: SubmissionId::new(),
            student,
            exercise,
            submitted_at,
            graded_at: Utc::now(),
            sandbox,
            snapshot,
            checks,
            status,
            score,
        }
    }

    /// Submission id
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Student
    #[inline]
    #[must_use]
    pub fn student(&self) -> &StudentId {
        &self.student
    }

    /// Exercise
    #[inline]
    #[must_use]
    pub fn exercise(&self) -> &ExerciseId {
        &self.exercise
    }

    /// When the classroom reported the submission
    #[inline]
    #[must_use]
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// When grading finished
    #[inline]
    #[must_use]
    pub fn graded_at(&self) -> DateTime<Utc> {
        self.graded_at
    }

    /// Sandbox the final checks ran in
    #[inline]
    #[must_use]
    pub fn sandbox(&self) -> Option<SandboxId> {
        self.sandbox
    }

    /// Answer files as they were when grading started
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Per-check results in manifest order
    #[inline]
    #[must_use]
    pub fn checks(&self) -> &[CheckResult] {
        &self.checks
    }

    /// How grading ended
    #[inline]
    #[must_use]
    pub fn status(&self) -> GradingStatus {
        self.status
    }

    /// Score in `0..=100`
    #[inline]
    #[must_use]
    pub fn score(&self) -> u8 {
        self.score
    }

    /// Checks that passed
    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.outcome.is_passed()).count()
    }

    /// Checks that never finished
    #[must_use]
    pub fn not_completed_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.outcome == CheckOutcome::NotCompleted)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labfleet_workspace::{FileEntry, WorkspacePath};

    fn result(name: &str, weight: u32, outcome: CheckOutcome) -> CheckResult {
        CheckResult {
            name: name.into(),
            weight,
            outcome,
            duration_ms: 1,
        }
    }

    #[test]
    fn score_is_weighted_and_rounded_down() {
        let checks = vec![
            result("a", 1, CheckOutcome::Passed),
            result("b", 1, CheckOutcome::Passed),
            result("c", 1, CheckOutcome::Failed { exit_code: 1 }),
        ];
        assert_eq!(score(&checks), 66);

        let weighted = vec![
            result("a", 3, CheckOutcome::Passed),
            result("b", 1, CheckOutcome::Failed { exit_code: 2 }),
        ];
        assert_eq!(score(&weighted), 75);
    }

    #[test]
    fn not_completed_counts_against() {
        let checks = vec![
            result("a", 1, CheckOutcome::Passed),
            CheckResult::not_completed("b", 1),
        ];
        assert_eq!(score(&checks), 50);
    }

    #[test]
    fn empty_suite_scores_zero() {
        assert_eq!(score(&[]), 0);
        assert_eq!(score(&[result("a", 0, CheckOutcome::Passed)]), 0);
    }

    #[test]
    fn submission_counts() {
        let prefix: WorkspacePath = "answers/alice/ex1".parse().unwrap();
        let snapshot = Snapshot::from_entries(prefix, &Vec::<FileEntry>::new()).unwrap();
        let submission = Submission::new(
            StudentId::new("alice").unwrap(),
            ExerciseId::new("ex1").unwrap(),
            Utc::now(),
            None,
            snapshot,
            vec![
                result("a", 1, CheckOutcome::Passed),
                CheckResult::not_completed("b", 1),
            ],
            GradingStatus::TimedOut,
        );
        assert_eq!(submission.passed_count(), 1);
        assert_eq!(submission.not_completed_count(), 1);
        assert_eq!(submission.score(), 50);
        assert_eq!(submission.status().to_string(), "timed_out");
    }

    #[test]
    fn outcome_serializes_flat() {
        let json = serde_json::to_value(result("a", 1, CheckOutcome::Failed { exit_code: 3 })).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["exit_code"], 3);
    }
}
