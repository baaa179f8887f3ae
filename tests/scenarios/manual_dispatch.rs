//! Test: Manual Dispatch - operator reruns and implicit revision resolution

use crate::helpers::*;
use stagegate::core::{PipelineError, ResourceKind, Stage, StageStatus, TriggerSource};
use std::sync::atomic::Ordering;

/// A rerun is a new attempt and does not trigger downstream by itself
#[tokio::test]
async fn test_rerun_creates_new_attempt_without_downstream() {
    let f = fixture().build();
    let r = rev("abc123");
    f.controller.run_revision(r.clone()).await.unwrap();

    let rerun = f.controller.dispatch_manual(Stage::Delivery, Some(r.clone())).await.unwrap();

    assert!(rerun.succeeded());
    assert_eq!(rerun.attempt.attempt, 2);
    assert_eq!(rerun.attempt.trigger, TriggerSource::ManualDispatch);
    assert!(rerun.downstream_event().is_none());
    assert_eq!(f.attempts(&r, Stage::Staging).await.len(), 1);

    // The retrained model is the new staging candidate; production is untouched
    assert_eq!(f.alias(ResourceKind::Model, "staging").await.as_deref(), Some("2"));
    assert_eq!(f.alias(ResourceKind::Model, "production").await.as_deref(), Some("1"));
    assert_eq!(f.trainer.calls.load(Ordering::SeqCst), 2);
}

/// Without a revision, a stage runs whatever its source environment holds
#[tokio::test]
async fn test_implicit_revision_comes_from_alias() {
    let f = fixture().build();
    let r = rev("abc123");
    let build = f.controller.on_push(r.clone()).await.unwrap();
    f.controller
        .handle_event(&build.downstream_event().unwrap())
        .await
        .unwrap();

    let staging = f.controller.dispatch_manual(Stage::Staging, None).await.unwrap();

    assert_eq!(staging.revision(), &r);
    assert_eq!(staging.attempt.trigger, TriggerSource::ManualDispatch);
    assert_eq!(f.alias_lineage(SERVING, "production").await, Some(r));
}

/// Delivery without a revision picks the most recently pushed images
#[tokio::test]
async fn test_implicit_commit_revision_is_latest_push() {
    let f = fixture().build();
    f.controller.on_push(rev("aaa111")).await.unwrap();
    f.controller.on_push(rev("bbb222")).await.unwrap();

    let delivery = f.controller.dispatch_manual(Stage::Delivery, None).await.unwrap();

    assert_eq!(delivery.revision(), &rev("bbb222"));
}

/// Nothing to resolve is a context error naming the stage
#[tokio::test]
async fn test_unresolvable_context_is_an_error() {
    let f = fixture().build();

    let err = f.controller.dispatch_manual(Stage::Deployment, None).await.unwrap_err();
    assert_eq!(err.stage, Stage::Deployment);
    assert!(err.revision.is_none());
    assert!(matches!(err.source, PipelineError::ContextResolution { .. }));

    let err = f.controller.dispatch_manual(Stage::Build, None).await.unwrap_err();
    assert!(matches!(err.source, PipelineError::ContextResolution { stage: Stage::Build, .. }));
}

/// A failed stage can be retried by hand; each retry is recorded
#[tokio::test]
async fn test_manual_retry_after_failure_is_allowed() {
    let f = fixture().metrics(failing_metrics()).build();
    let r = rev("abc123");
    f.controller.run_revision(r.clone()).await.unwrap_err();

    let err = f
        .controller
        .dispatch_manual(Stage::Delivery, Some(r.clone()))
        .await
        .unwrap_err();

    assert!(matches!(err.source, PipelineError::QualityGate { version: 2, .. }));
    let attempts = f.attempts(&r, Stage::Delivery).await;
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a.status == StageStatus::Failed));
}

/// A revision that no longer holds the alias cannot be dispatched against it
#[tokio::test]
async fn test_superseded_revision_is_rejected() {
    let f = fixture().build();
    for id in ["aaa111", "bbb222"] {
        let build = f.controller.on_push(rev(id)).await.unwrap();
        f.controller
            .handle_event(&build.downstream_event().unwrap())
            .await
            .unwrap();
    }

    let err = f
        .controller
        .dispatch_manual(Stage::Staging, Some(rev("aaa111")))
        .await
        .unwrap_err();

    assert!(matches!(err.source, PipelineError::ContextResolution { .. }));
    assert!(f.attempts(&rev("aaa111"), Stage::Staging).await.is_empty());
}

/// Following a manual run chains the remaining stages
#[tokio::test]
async fn test_follow_after_manual_dispatch() {
    let f = fixture().build();
    let r = rev("abc123");
    f.controller.on_push(r.clone()).await.unwrap();

    let delivery = f.controller.dispatch_manual(Stage::Delivery, Some(r.clone())).await.unwrap();
    let rest = f.controller.follow(delivery.completion_event()).await.unwrap();

    let stages: Vec<Stage> = rest.iter().map(|o| o.stage()).collect();
    assert_eq!(stages, vec![Stage::Staging, Stage::Deployment]);
    assert_eq!(f.alias_lineage(ResourceKind::Model, "production").await, Some(r));
}
