//! Test: Success Chain - a revision moves build -> delivery -> staging -> deployment

use crate::helpers::*;
use stagegate::core::{ResourceKind, Stage, StageStatus, TriggerSource};
use stagegate::{Conclusion, ControllerEvent, UpstreamEvent};
use std::sync::atomic::Ordering;

/// Passing metrics carry a revision all the way to production
#[tokio::test]
async fn test_full_chain_reaches_production() {
    let f = fixture().build();
    let r = rev("abc123");

    let outcomes = f.controller.run_revision(r.clone()).await.unwrap();

    let stages: Vec<Stage> = outcomes.iter().map(|o| o.stage()).collect();
    assert_eq!(stages, Stage::ORDER.to_vec());
    assert!(outcomes.iter().all(|o| o.succeeded()));

    let gate = outcomes[1].gate.as_ref().unwrap();
    assert!(gate.passed);
    assert_eq!(gate.model_version, 1);

    for alias in ["staging", "production"] {
        assert_eq!(f.alias_lineage(ResourceKind::Model, alias).await, Some(r.clone()));
        assert_eq!(f.alias_lineage(SERVING, alias).await, Some(r.clone()));
    }

    for stage in Stage::ORDER {
        assert_eq!(f.status(&r, stage).await, StageStatus::Succeeded);
    }
}

/// Validation instances are stopped; the deployed one is left running
#[tokio::test]
async fn test_deployment_leaves_production_service_running() {
    let f = fixture().build();
    let r = rev("abc123");

    let outcomes = f.controller.run_revision(r.clone()).await.unwrap();

    let deployment = outcomes.last().unwrap();
    assert_eq!(deployment.stage(), Stage::Deployment);
    assert!(deployment.service.is_some());

    // delivery and staging each validate once
    assert_eq!(f.suite.runs.load(Ordering::SeqCst), 2);
    assert_eq!(f.launcher.starts.load(Ordering::SeqCst), 3);
    assert_eq!(f.launcher.running(), 1);

    let launched = f.launcher.launched.lock().unwrap();
    let production = launched.last().unwrap();
    assert!(production.keep_running);
    assert_eq!(production.port, 8080);
    assert_eq!(production.image.revision, r);
    assert_eq!(production.model.as_ref().map(|m| m.version), Some(1));
}

/// Staging resolves the alias that delivery's promotion just tagged
#[tokio::test]
async fn test_staging_resolves_versions_promoted_by_delivery() {
    let f = fixture().build();
    let r = rev("abc123");

    let build = f.controller.on_push(r.clone()).await.unwrap();
    let delivery = f
        .controller
        .handle_event(&build.downstream_event().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.stage(), Stage::Delivery);
    let promoted = delivery.promotion.clone().unwrap();
    assert_eq!(promoted.alias, "staging");
    assert_eq!(promoted.revision, r);

    let event = UpstreamEvent::success(Stage::Delivery, r.clone());
    let staging = f.controller.handle_event(&event).await.unwrap().unwrap();

    assert_eq!(staging.stage(), Stage::Staging);
    assert_eq!(staging.attempt.trigger, TriggerSource::UpstreamCompletion);
    assert_eq!(
        staging.context.version(ResourceKind::Model),
        promoted.version_of(ResourceKind::Model)
    );
    assert_eq!(staging.context.version(SERVING), promoted.version_of(SERVING));
}

/// A failed or cancelled upstream never triggers its successor
#[tokio::test]
async fn test_non_success_conclusion_does_not_trigger() {
    let f = fixture().build();
    let r = rev("abc123");
    f.controller.on_push(r.clone()).await.unwrap();

    for conclusion in [Conclusion::Failure, Conclusion::Cancelled] {
        let event = UpstreamEvent {
            upstream_stage: Stage::Build,
            conclusion,
            revision: r.clone(),
        };
        assert!(f.controller.handle_event(&event).await.unwrap().is_none());
    }

    assert!(f.attempts(&r, Stage::Delivery).await.is_empty());
    assert_eq!(f.trainer.calls.load(Ordering::SeqCst), 0);
}

/// A late completion for a revision that lost the staging alias is skipped
#[tokio::test]
async fn test_superseded_candidate_is_skipped() {
    let f = fixture().build();
    let old = rev("aaa111");
    let new = rev("bbb222");

    for r in [&old, &new] {
        let build = f.controller.on_push(r.clone()).await.unwrap();
        f.controller
            .handle_event(&build.downstream_event().unwrap())
            .await
            .unwrap();
    }
    assert_eq!(f.alias_lineage(ResourceKind::Model, "staging").await, Some(new.clone()));

    let late = UpstreamEvent::success(Stage::Delivery, old.clone());
    assert!(f.controller.handle_event(&late).await.unwrap().is_none());

    assert_eq!(f.status(&old, Stage::Staging).await, StageStatus::Skipped);
    assert!(f.alias(ResourceKind::Model, "production").await.is_none());
    let skipped = f
        .recorded_events()
        .into_iter()
        .any(|e| {
            matches!(
                e,
                ControllerEvent::StageSkipped { stage: Stage::Staging, ref revision, .. }
                    if revision == &old
            )
        });
    assert!(skipped);
}
