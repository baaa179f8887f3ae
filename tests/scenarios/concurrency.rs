//! Test: Concurrency - one running attempt per (stage, revision)

use crate::helpers::*;
use chrono::Utc;
use stagegate::core::{PipelineError, ResourceKind, Stage, StageAttempt, StageStatus, TriggerSource};
use stagegate::execution::CancelRequest;
use stagegate::persistence::AuditLog;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Two simultaneous pushes of one revision: exactly one builds
#[tokio::test]
async fn test_simultaneous_invocations_run_once() {
    let f = fixture().build_delay(Duration::from_millis(100)).build();
    let r = rev("abc123");

    let (first, second) =
        tokio::join!(f.controller.on_push(r.clone()), f.controller.on_push(r.clone()));
    let results = [first, second];

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    let rejected = results.iter().find_map(|result| result.as_ref().err()).unwrap();
    assert!(matches!(
        rejected.source,
        PipelineError::AlreadyRunning {
            stage: Stage::Build,
            ..
        }
    ));

    let attempts = f.attempts(&r, Stage::Build).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, StageStatus::Succeeded);
    // one build per image kind
    assert_eq!(f.builder.calls.load(Ordering::SeqCst), 2);
}

/// Different revisions do not block each other
#[tokio::test]
async fn test_different_revisions_run_in_parallel() {
    let f = fixture().build_delay(Duration::from_millis(50)).build();

    let (a, b) = tokio::join!(
        f.controller.on_push(rev("aaa111")),
        f.controller.on_push(rev("bbb222"))
    );

    assert!(a.unwrap().succeeded());
    assert!(b.unwrap().succeeded());
    assert_eq!(f.builder.calls.load(Ordering::SeqCst), 4);
}

/// A Running attempt left by a crashed process blocks until cancelled
#[tokio::test]
async fn test_stale_running_attempt_blocks_until_cancelled() {
    let f = fixture().build();
    let r = rev("abc123");
    let mut stale = StageAttempt::start(Stage::Build, r.clone(), 1, TriggerSource::Push);
    stale.heartbeat_at = Some(Utc::now() - chrono::Duration::minutes(5));
    f.audit.record_attempt(&stale).await.unwrap();

    let err = f.controller.on_push(r.clone()).await.unwrap_err();
    assert!(matches!(err.source, PipelineError::AlreadyRunning { .. }));
    assert_eq!(f.builder.calls.load(Ordering::SeqCst), 0);

    assert_eq!(f.controller.cancel(stale.id).await.unwrap(), CancelRequest::Expired);
    assert_eq!(f.status(&r, Stage::Build).await, StageStatus::Cancelled);

    let outcome = f.controller.on_push(r.clone()).await.unwrap();
    assert!(outcome.succeeded());
    assert_eq!(outcome.attempt.attempt, 2);
}

/// Cancelling something that is not running is an error
#[tokio::test]
async fn test_cancel_finished_attempt_is_rejected() {
    let f = fixture().build();
    let outcome = f.controller.on_push(rev("abc123")).await.unwrap();

    let err = f.controller.cancel(outcome.attempt.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Audit(_)));
}

/// Cancelling mid-validation stops the stage before promotion
#[tokio::test]
async fn test_cancel_before_promotion_leaves_aliases_untouched() {
    let f = fixture().suite_delay(Duration::from_millis(500)).build();
    let r = rev("abc123");
    f.controller.on_push(r.clone()).await.unwrap();

    let delivery = f.controller.dispatch_manual(Stage::Delivery, Some(r.clone()));
    let operator = async {
        let attempt = f.running_in_validation(Stage::Delivery).await;
        f.controller.cancel(attempt.id).await.unwrap()
    };
    let (result, request) = tokio::join!(delivery, operator);

    assert_eq!(request, CancelRequest::Requested);
    let err = result.unwrap_err();
    assert!(matches!(err.source, PipelineError::Cancelled));
    assert_eq!(f.status(&r, Stage::Delivery).await, StageStatus::Cancelled);
    assert_eq!(f.alias(ResourceKind::Model, "staging").await, None);
    assert_eq!(f.alias(SERVING, "staging").await, None);
    assert_eq!(f.launcher.running(), 0);
}

/// A cancel from another process asks the owner to stop; the stage stays
/// exclusively owned until the owner records the outcome
#[tokio::test]
async fn test_cancel_from_another_controller_keeps_attempt_owned() {
    let owner = fixture()
        .suite_delay(Duration::from_secs(2))
        .heartbeat(Duration::from_millis(200))
        .build();
    let operator = fixture()
        .registries(owner.registries.clone())
        .audit(owner.audit.clone())
        .build();
    let r = rev("abc123");
    owner.controller.on_push(r.clone()).await.unwrap();

    let delivery = owner.controller.dispatch_manual(Stage::Delivery, Some(r.clone()));
    let intervene = async {
        let attempt = owner.running_in_validation(Stage::Delivery).await;
        let request = operator.controller.cancel(attempt.id).await.unwrap();
        let status = operator.status(&r, Stage::Delivery).await;
        let second = operator
            .controller
            .dispatch_manual(Stage::Delivery, Some(r.clone()))
            .await;
        (request, status, second)
    };
    let (first, (request, status, second)) = tokio::join!(delivery, intervene);

    assert_eq!(request, CancelRequest::Requested);
    assert_eq!(status, StageStatus::Running);
    let rejected = second.unwrap_err();
    assert!(matches!(rejected.source, PipelineError::AlreadyRunning { .. }));
    assert_eq!(operator.suite.runs.load(Ordering::SeqCst), 0);

    let err = first.unwrap_err();
    assert!(matches!(err.source, PipelineError::Cancelled));

    let attempts = owner.attempts(&r, Stage::Delivery).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, StageStatus::Cancelled);
    assert!(attempts[0].cancel_requested);
    assert_eq!(owner.alias(ResourceKind::Model, "staging").await, None);
    assert_eq!(owner.alias(SERVING, "staging").await, None);
}
