//! Test: Promotion Rollback - a failed artifact tag never leaves the aliases split

use crate::helpers::*;
use stagegate::core::{PipelineError, ResourceKind, Revision, Stage, StageStatus};
use stagegate::ControllerEvent;
use std::sync::atomic::Ordering;

async fn deliver(f: &Fixture, r: &Revision) -> Result<(), stagegate::StageError> {
    let build = f.controller.on_push(r.clone()).await?;
    let event = build.downstream_event().unwrap();
    f.controller.handle_event(&event).await.map(|_| ())
}

/// The model alias moves before the serving image alias
#[tokio::test]
async fn test_model_alias_moves_first() {
    let flaky = flaky_registries();
    let f = fixture().registries(flaky.set.clone()).build();

    f.controller.run_revision(rev("abc123")).await.unwrap();

    let log = flaky.log.lock().unwrap().clone();
    assert_eq!(
        log,
        vec![
            "model:staging".to_string(),
            "artifact:serving:staging".to_string(),
            "model:production".to_string(),
            "artifact:serving:production".to_string(),
        ]
    );
}

/// The model alias returns to the previous release when the artifact tag fails
#[tokio::test]
async fn test_failed_artifact_tag_restores_previous_holder() {
    let flaky = flaky_registries();
    let f = fixture().registries(flaky.set.clone()).build();
    let previous = rev("aaa111");
    let candidate = rev("bbb222");

    deliver(&f, &previous).await.unwrap();
    assert_eq!(f.alias(ResourceKind::Model, "staging").await.as_deref(), Some("1"));

    flaky.serving.fail_tags.store(true, Ordering::SeqCst);
    let err = deliver(&f, &candidate).await.unwrap_err();

    assert_eq!(err.stage, Stage::Delivery);
    assert!(!err.source.requires_operator());
    match &err.source {
        PipelineError::PromotionRolledBack { alias, kind, .. } => {
            assert_eq!(alias, "staging");
            assert_eq!(*kind, SERVING);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Net no-op: both aliases still name the previous release
    assert_eq!(f.alias(ResourceKind::Model, "staging").await.as_deref(), Some("1"));
    assert_eq!(f.alias_lineage(ResourceKind::Model, "staging").await, Some(previous.clone()));
    assert_eq!(f.alias_lineage(SERVING, "staging").await, Some(previous));
    assert_eq!(f.status(&candidate, Stage::Delivery).await, StageStatus::Failed);
}

/// A first-time promotion that fails leaves the alias unset
#[tokio::test]
async fn test_failed_first_promotion_removes_model_alias() {
    let flaky = flaky_registries();
    flaky.serving.fail_tags.store(true, Ordering::SeqCst);
    let f = fixture().registries(flaky.set.clone()).build();

    let err = deliver(&f, &rev("abc123")).await.unwrap_err();

    assert!(matches!(err.source, PipelineError::PromotionRolledBack { .. }));
    assert!(f.alias(ResourceKind::Model, "staging").await.is_none());
    assert!(f.alias(SERVING, "staging").await.is_none());
}

/// When the rollback fails too, the error demands an operator
#[tokio::test]
async fn test_failed_rollback_is_partial_promotion() {
    let flaky = flaky_registries();
    flaky.serving.fail_tags.store(true, Ordering::SeqCst);
    flaky.models.fail_alias_deletes.store(true, Ordering::SeqCst);
    let f = fixture().registries(flaky.set.clone()).build();
    let r = rev("abc123");

    let err = deliver(&f, &r).await.unwrap_err();

    assert!(err.source.requires_operator());
    match &err.source {
        PipelineError::PartialPromotion {
            alias,
            revision,
            failed_kind,
            inconsistent,
            rollback_errors,
            ..
        } => {
            assert_eq!(alias, "staging");
            assert_eq!(revision, &r);
            assert_eq!(*failed_kind, SERVING);
            assert_eq!(inconsistent, &vec![ResourceKind::Model]);
            assert_eq!(rollback_errors.len(), 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("PARTIAL PROMOTION"));

    // The model alias moved and could not be moved back
    assert_eq!(f.alias(ResourceKind::Model, "staging").await.as_deref(), Some("1"));
    assert!(f.alias(SERVING, "staging").await.is_none());

    let flagged = f.recorded_events().into_iter().any(|e| {
        matches!(
            e,
            ControllerEvent::StageFailed {
                stage: Stage::Delivery,
                requires_operator: true,
                ..
            }
        )
    });
    assert!(flagged);
}

/// Staging refuses to run against a split alias
#[tokio::test]
async fn test_split_alias_is_not_dispatched() {
    let flaky = flaky_registries();
    flaky.serving.fail_tags.store(true, Ordering::SeqCst);
    flaky.models.fail_alias_deletes.store(true, Ordering::SeqCst);
    let f = fixture().registries(flaky.set.clone()).build();

    deliver(&f, &rev("abc123")).await.unwrap_err();

    let err = f.controller.dispatch_manual(Stage::Staging, None).await.unwrap_err();
    assert!(matches!(err.source, PipelineError::ContextResolution { stage: Stage::Staging, .. }));
}
