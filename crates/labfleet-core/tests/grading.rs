//! Grading bridge behaviour
//!
//! Covers:
//! - full and partial scores
//! - suite timeout with partial results
//! - resuming on a fresh sandbox after the first one dies
//! - report delivery through the outbox
//! - queued gradings surviving provisioning trouble and shutdown

use labfleet_core::{CheckOutcome, FleetError, GradingStatus, PlatformError, ScoreReport, SubmissionEvent};
use labfleet_test_utils::{check_command, exercise, path, seed_answer, student, ExecStep, TestFleet};
use labfleet_workspace::WorkspaceStore;
use pretty_assertions::assert_eq;
use std::time::Duration;

const CHECKS: [&str; 5] = ["a", "b", "c", "d", "e"];

fn event(student_id: &str) -> SubmissionEvent {
    SubmissionEvent::new(student(student_id), exercise("ex1"))
}

fn argv(name: &str) -> Vec<String> {
    check_command(name)
}

fn script(fixture: &TestFleet, name: &str, steps: Vec<ExecStep>) {
    let command = argv(name);
    let refs: Vec<&str> = command.iter().map(String::as_str).collect();
    fixture.platform.script(&refs, steps);
}

async fn wait_for_reports(fixture: &TestFleet, count: usize) -> Vec<ScoreReport> {
    for _ in 0..120 {
        if fixture.classroom.reports().len() >= count {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    fixture.classroom.reports()
}

#[tokio::test(start_paused = true)]
async fn all_checks_passing_scores_100() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    seed_answer(fixture.store.as_ref(), "alice", "ex1", "main.py", b"print(42)").await;

    let submission = fixture.fleet.grade_now(&event("alice")).await.unwrap();

    assert_eq!(submission.score(), 100);
    assert_eq!(submission.status(), GradingStatus::Completed);
    assert_eq!(submission.checks().len(), 5);
    assert_eq!(submission.passed_count(), 5);
    assert_eq!(fixture.fleet.outbox().pending(), 1);
}

#[tokio::test(start_paused = true)]
async fn one_failing_check_gives_partial_credit() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    script(&fixture, "c", vec![ExecStep::Exit(1)]);

    let submission = fixture.fleet.grade_now(&event("alice")).await.unwrap();

    assert_eq!(submission.score(), 80);
    assert_eq!(submission.checks()[2].name, "c");
    assert_eq!(submission.checks()[2].outcome, CheckOutcome::Failed { exit_code: 1 });
    assert_eq!(submission.status(), GradingStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn suite_timeout_keeps_completed_checks() {
    let fixture = TestFleet::with_exercise(&CHECKS, 10).await;
    script(&fixture, "d", vec![ExecStep::Hang]);

    let err = fixture.fleet.grade_now(&event("alice")).await.unwrap_err();
    let submission = match err {
        FleetError::GradingTimeout { submission } => submission,
        other => panic!("expected a grading timeout, got {other:?}"),
    };

    let outcomes: Vec<&CheckOutcome> = submission.checks().iter().map(|c| &c.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            &CheckOutcome::Passed,
            &CheckOutcome::Passed,
            &CheckOutcome::Passed,
            &CheckOutcome::NotCompleted,
            &CheckOutcome::NotCompleted,
        ]
    );
    assert_eq!(submission.status(), GradingStatus::TimedOut);
    assert_eq!(submission.score(), 60);
    assert_eq!(fixture.platform.killed_execs().len(), 1);

    // The partial grade is still reported.
    assert_eq!(fixture.fleet.outbox().pending(), 1);
    fixture.fleet.outbox().flush().await;
    let reports = fixture.classroom.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, GradingStatus::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn slow_checks_share_one_deadline() {
    let fixture = TestFleet::with_exercise(&CHECKS, 10).await;
    for name in CHECKS {
        script(&fixture, name, vec![ExecStep::Slow(Duration::from_secs(3), 0)]);
    }

    let err = fixture.fleet.grade_now(&event("alice")).await.unwrap_err();
    let submission = err.submission().unwrap();

    // 3 checks fit in 10s; the fourth is cut off.
    assert_eq!(submission.passed_count(), 3);
    assert_eq!(submission.not_completed_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn grading_resumes_on_a_fresh_sandbox() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    script(&fixture, "b", vec![ExecStep::Crash, ExecStep::Exit(0)]);

    let submission = fixture.fleet.grade_now(&event("alice")).await.unwrap();

    assert_eq!(submission.score(), 100);
    assert_eq!(fixture.platform.create_count(), 2);
    assert_eq!(fixture.platform.live_machines().len(), 1);

    let log = fixture.platform.exec_log();
    let b_runs: Vec<&String> = log
        .iter()
        .filter(|(_, cmd)| *cmd == argv("b"))
        .map(|(machine, _)| machine)
        .collect();
    assert_eq!(b_runs.len(), 2);
    assert_ne!(b_runs[0], b_runs[1]);
}

#[tokio::test(start_paused = true)]
async fn second_sandbox_loss_aborts() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    script(
        &fixture,
        "b",
        vec![ExecStep::Crash, ExecStep::Crash, ExecStep::Exit(0)],
    );

    let err = fixture.fleet.grade_now(&event("alice")).await.unwrap_err();
    assert!(matches!(err, FleetError::GradingAborted { .. }));
    let submission = err.submission().unwrap();
    assert_eq!(submission.status(), GradingStatus::Aborted);
    assert_eq!(submission.passed_count(), 1);
    assert_eq!(submission.not_completed_count(), 4);
    assert_eq!(fixture.fleet.outbox().pending(), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_exercise_does_not_start_a_sandbox() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    let missing = SubmissionEvent::new(student("alice"), exercise("nope"));

    let err = fixture.fleet.grade_now(&missing).await.unwrap_err();

    assert!(matches!(err, FleetError::UnknownExercise(ref id) if id.as_str() == "nope"));
    assert_eq!(fixture.platform.create_count(), 0);
    assert_eq!(fixture.fleet.outbox().pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn snapshot_is_frozen_at_submission() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    seed_answer(fixture.store.as_ref(), "alice", "ex1", "main.py", b"v1").await;

    let submission = fixture.fleet.grade_now(&event("alice")).await.unwrap();
    let before = submission.snapshot().clone();

    fixture
        .store
        .write(&path("answers/alice/ex1/main.py"), b"v2")
        .await
        .unwrap();

    assert_eq!(submission.snapshot(), &before);
    let hash = before.files[&path("main.py")];
    assert_eq!(fixture.store.blob(&hash).await.unwrap(), b"v1");
}

#[tokio::test(start_paused = true)]
async fn grading_reuses_the_students_session() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    let session = fixture.fleet.open_session(&student("alice"), None).await.unwrap();

    let submission = fixture.fleet.grade_now(&event("alice")).await.unwrap();

    assert_eq!(submission.sandbox(), Some(session.id));
    assert_eq!(fixture.platform.create_count(), 1);
    assert_eq!(
        fixture.fleet.router().instance_for(&student("alice")).await.unwrap().id,
        session.id
    );
}

#[tokio::test(start_paused = true)]
async fn failed_deliveries_are_retried_until_accepted() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    fixture.classroom.fail_next(2);
    fixture.fleet.grade_now(&event("alice")).await.unwrap();
    let outbox = fixture.fleet.outbox();

    assert_eq!(outbox.flush().await.failed, 1);
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(outbox.flush().await.failed, 1);
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(outbox.flush().await.delivered, 1);

    assert_eq!(fixture.classroom.attempts(), 3);
    assert_eq!(fixture.classroom.reports().len(), 1);
    assert_eq!(outbox.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn queued_submissions_are_graded_and_reported() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    let handle = fixture.fleet.start().unwrap();

    fixture.fleet.submit(event("alice")).unwrap();
    fixture.fleet.submit(event("bob")).unwrap();

    for _ in 0..20 {
        if fixture.classroom.reports().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    handle.shutdown().await;

    let mut students: Vec<String> = fixture
        .classroom
        .reports()
        .iter()
        .map(|r| r.student_id.to_string())
        .collect();
    students.sort();
    assert_eq!(students, vec!["alice", "bob"]);
    assert!(matches!(
        fixture.fleet.submit(event("carol")),
        Err(FleetError::ShuttingDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn grading_uses_the_answers_edited_in_the_sandbox() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    seed_answer(fixture.store.as_ref(), "alice", "ex1", "main.py", b"v1").await;
    let session = fixture.fleet.open_session(&student("alice"), None).await.unwrap();
    fixture
        .platform
        .edit_in_sandbox(&session.machine_id, path("answers/alice/ex1/main.py"), b"v2");

    let submission = fixture.fleet.grade_now(&event("alice")).await.unwrap();

    let hash = submission.snapshot().files[&path("main.py")];
    assert_eq!(fixture.store.blob(&hash).await.unwrap(), b"v2");
    assert_eq!(
        fixture.store.read(&path("answers/alice/ex1/main.py")).await.unwrap(),
        b"v2"
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_delivers_reports_of_gradings_in_flight() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    script(&fixture, "a", vec![ExecStep::Slow(Duration::from_secs(5), 0)]);
    let handle = fixture.fleet.start().unwrap();

    fixture.fleet.submit(event("alice")).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(fixture.classroom.reports().is_empty());
    handle.shutdown().await;

    let reports = fixture.classroom.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, GradingStatus::Completed);
    assert_eq!(reports[0].score, 100);
    assert_eq!(fixture.fleet.outbox().pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_with_teardown_leaves_no_machines() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    script(&fixture, "c", vec![ExecStep::Slow(Duration::from_secs(5), 0)]);
    let handle = fixture.fleet.start().unwrap();

    fixture.fleet.submit(event("alice")).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let destroyed = handle.shutdown_and_teardown().await;

    assert_eq!(destroyed, 1);
    assert_eq!(fixture.platform.create_count(), 1);
    assert!(fixture.platform.live_machines().is_empty());
    assert_eq!(fixture.classroom.reports().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn queued_grading_waits_out_provisioning_failures() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    // Enough to exhaust every provisioning attempt of the first try.
    fixture.platform.fail_next_creates(3);
    let handle = fixture.fleet.start().unwrap();

    fixture.fleet.submit(event("alice")).unwrap();
    let reports = wait_for_reports(&fixture, 1).await;
    handle.shutdown().await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, GradingStatus::Completed);
    assert_eq!(reports[0].score, 100);
    assert_eq!(reports[0].detail, None);
    assert_eq!(fixture.platform.create_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_sandbox_is_reported_as_aborted() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    fixture.platform.fail_next_create_with(PlatformError::Rejected {
        status: 422,
        message: "bad image".into(),
    });
    let handle = fixture.fleet.start().unwrap();

    fixture
        .fleet
        .submit(event("alice").with_delivery_id("delivery-7"))
        .unwrap();
    let reports = wait_for_reports(&fixture, 1).await;
    handle.shutdown().await;

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.status, GradingStatus::Aborted);
    assert_eq!(report.score, 0);
    assert_eq!(report.delivery_id.as_deref(), Some("delivery-7"));
    assert!(report.detail.as_deref().unwrap().contains("bad image"));
    assert_eq!(report.checks.len(), CHECKS.len());
    assert!(report.checks.iter().all(|c| c.outcome == CheckOutcome::NotCompleted));
    assert_eq!(fixture.platform.create_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_reports_submissions_still_waiting_for_a_sandbox() {
    let fixture = TestFleet::with_exercise(&CHECKS, 60).await;
    fixture.platform.fail_next_creates(3);
    let handle = fixture.fleet.start().unwrap();

    fixture.fleet.submit(event("alice")).unwrap();
    // The first try has failed and the retry is waiting out its backoff.
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.shutdown().await;

    let reports = fixture.classroom.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, GradingStatus::Aborted);
    assert!(reports[0].detail.as_deref().unwrap().contains("fleet stopped"));
    assert_eq!(fixture.platform.create_count(), 0);
}
