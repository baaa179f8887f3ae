//! Quality gate evaluation
//!
//! The gate compares the metrics recorded for one immutable model version
//! against configured minimums. Evaluation is pure: the only I/O is the
//! single registry read in [`QualityGate::check`] that fetches the version.

use crate::core::{PipelineError, Revision};
use crate::registry::{Metrics, ModelRegistry, ModelVersion, RegistryResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Minimum value per metric name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityThresholds(BTreeMap<String, f64>);

impl QualityThresholds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `metric >= minimum`
    pub fn require(mut self, metric: impl Into<String>, minimum: f64) -> Self {
        self.set(metric, minimum);
        self
    }

    pub fn set(&mut self, metric: impl Into<String>, minimum: f64) {
        self.0.insert(metric.into(), minimum);
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        self.0.get(metric).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, minimum)| (name.as_str(), *minimum))
    }
}

impl FromIterator<(String, f64)> for QualityThresholds {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Outcome for a single configured metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricOutcome {
    Passed,
    BelowThreshold,
    /// The metric was never recorded; a hard failure, not a skip
    Missing,
    /// The recorded value is NaN or infinite
    NotFinite,
}

/// One metric compared against its threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCheck {
    pub metric: String,
    pub threshold: f64,
    pub value: Option<f64>,
    pub outcome: MetricOutcome,
}

impl MetricCheck {
    pub fn passed(&self) -> bool {
        self.outcome == MetricOutcome::Passed
    }
}

/// Derived pass/fail decision for one model version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub model_version: u64,
    pub revision: Revision,
    pub passed: bool,
    pub checks: Vec<MetricCheck>,
}

impl QualityGateResult {
    /// Metrics that were required but never recorded
    pub fn missing_metrics(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| c.outcome == MetricOutcome::Missing)
            .map(|c| c.metric.as_str())
            .collect()
    }

    /// Human-readable list of failed checks
    pub fn summary(&self) -> String {
        let failed: Vec<String> = self
            .checks
            .iter()
            .filter(|c| !c.passed())
            .map(|c| match (&c.outcome, c.value) {
                (MetricOutcome::Missing, _) => {
                    format!("{} missing (required >= {})", c.metric, c.threshold)
                }
                (_, Some(value)) => format!("{} = {} < {}", c.metric, value, c.threshold),
                (_, None) => format!("{} invalid", c.metric),
            })
            .collect();
        if failed.is_empty() {
            "all metrics passed".to_string()
        } else {
            failed.join(", ")
        }
    }

    /// Convert a failing result into the stage error
    pub fn into_result(self) -> Result<Self, PipelineError> {
        if self.passed {
            Ok(self)
        } else {
            Err(PipelineError::QualityGate {
                version: self.model_version,
                revision: self.revision.clone(),
                summary: self.summary(),
            })
        }
    }
}

fn check_metric(metrics: &Metrics, metric: &str, threshold: f64) -> MetricCheck {
    let value = metrics.get(metric).copied();
    let outcome = match value {
        None => MetricOutcome::Missing,
        Some(v) if !v.is_finite() => MetricOutcome::NotFinite,
        Some(v) if v >= threshold => MetricOutcome::Passed,
        Some(_) => MetricOutcome::BelowThreshold,
    };
    MetricCheck {
        metric: metric.to_string(),
        threshold,
        value,
        outcome,
    }
}

/// Evaluate a model version against thresholds
///
/// Passes iff every configured metric is present, finite and at least its
/// threshold. An empty threshold set never passes.
pub fn evaluate(model: &ModelVersion, thresholds: &QualityThresholds) -> QualityGateResult {
    let checks: Vec<MetricCheck> = thresholds
        .iter()
        .map(|(metric, threshold)| check_metric(&model.metrics, metric, threshold))
        .collect();
    let passed = !checks.is_empty() && checks.iter().all(MetricCheck::passed);

    QualityGateResult {
        model_version: model.version,
        revision: model.revision.clone(),
        passed,
        checks,
    }
}

/// The gate as configured for a pipeline
#[derive(Debug, Clone)]
pub struct QualityGate {
    thresholds: QualityThresholds,
}

impl QualityGate {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    pub fn evaluate(&self, model: &ModelVersion) -> QualityGateResult {
        evaluate(model, &self.thresholds)
    }

    /// Fetch an immutable model version and evaluate it
    pub async fn check<M: ModelRegistry + ?Sized>(
        &self,
        registry: &M,
        model_name: &str,
        version: u64,
    ) -> RegistryResult<QualityGateResult> {
        let model = registry.get_version(model_name, version).await?;
        let result = self.evaluate(&model);

        if result.passed {
            info!("Quality gate passed for {} version {}", model_name, version);
        } else {
            warn!(
                "Quality gate failed for {} version {} (revision {}): {}",
                model_name,
                version,
                model.revision,
                result.summary()
            );
        }
        Ok(result)
    }
}
