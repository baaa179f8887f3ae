//! Test: Gate Failure - a rejected candidate never reaches validation

use crate::helpers::*;
use stagegate::core::{PipelineError, ResourceKind, Stage, StageStatus};
use stagegate::ControllerEvent;
use std::sync::atomic::Ordering;

/// Accuracy below threshold fails delivery before the suite runs
#[tokio::test]
async fn test_low_accuracy_fails_before_validation() {
    let f = fixture().metrics(failing_metrics()).build();
    let r = rev("abc123");

    let build = f.controller.on_push(r.clone()).await.unwrap();
    let err = f
        .controller
        .handle_event(&build.downstream_event().unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Delivery);
    assert_eq!(err.revision, Some(r.clone()));
    match &err.source {
        PipelineError::QualityGate { version, summary, .. } => {
            assert_eq!(*version, 1);
            assert!(summary.contains("accuracy"));
            assert!(!summary.contains("precision"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(f.suite.runs.load(Ordering::SeqCst), 0);
    assert_eq!(f.launcher.starts.load(Ordering::SeqCst), 0);
    assert!(f.alias(ResourceKind::Model, "staging").await.is_none());
    assert!(f.alias(SERVING, "staging").await.is_none());
    assert_eq!(f.status(&r, Stage::Delivery).await, StageStatus::Failed);
}

/// The failure message names the stage and the revision
#[tokio::test]
async fn test_gate_failure_reports_stage_and_revision() {
    let f = fixture().metrics(failing_metrics()).build();
    let r = rev("abc123");

    let err = f.controller.run_revision(r.clone()).await.unwrap_err();

    let message = err.to_string();
    assert!(message.contains("delivery"));
    assert!(message.contains("abc123"));

    let attempt = &f.attempts(&r, Stage::Delivery).await[0];
    assert!(attempt.detail.as_deref().unwrap_or_default().contains("quality gate"));
    assert_eq!(attempt.versions.get("model").map(String::as_str), Some("1"));
}

/// A metric that was never logged fails the gate
#[tokio::test]
async fn test_missing_metric_fails_gate() {
    let f = fixture().metrics(metrics(&[("accuracy", 0.99)])).build();
    let r = rev("abc123");

    let err = f.controller.run_revision(r.clone()).await.unwrap_err();

    match &err.source {
        PipelineError::QualityGate { summary, .. } => {
            assert!(summary.contains("precision missing"))
        }
        other => panic!("unexpected error: {other}"),
    }
    let evaluated = f.recorded_events().into_iter().find_map(|e| match e {
        ControllerEvent::GateEvaluated { result, .. } => Some(result),
        _ => None,
    });
    let result = evaluated.unwrap();
    assert!(!result.passed);
    assert_eq!(result.missing_metrics(), vec!["precision"]);
}

/// A failing suite blocks promotion and the instance is still stopped
#[tokio::test]
async fn test_validation_failure_blocks_promotion() {
    let f = fixture().suite_failures(&["GET /predict returned 500"]).build();
    let r = rev("abc123");

    let err = f.controller.run_revision(r.clone()).await.unwrap_err();

    assert_eq!(err.stage, Stage::Delivery);
    match &err.source {
        PipelineError::ValidationFailed { suite, failures, .. } => {
            assert_eq!(suite, "smoke");
            assert_eq!(failures, &vec!["GET /predict returned 500".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(f.suite.runs.load(Ordering::SeqCst), 1);
    assert_eq!(f.launcher.running(), 0);
    assert!(f.alias(ResourceKind::Model, "staging").await.is_none());
}
