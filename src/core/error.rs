//! Pipeline error taxonomy

use crate::core::{Environment, ResourceKind, Revision, Stage};
use crate::registry::RegistryError;
use thiserror::Error;

/// Errors raised while dispatching or running a stage
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No valid revision or version to act on
    #[error("cannot resolve context for {stage}: {reason}")]
    ContextResolution { stage: Stage, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The quality gate rejected a model version
    #[error("quality gate rejected model version {version} (revision {revision}): {summary}")]
    QualityGate {
        version: u64,
        revision: Revision,
        summary: String,
    },

    /// The validation suite reported failures
    #[error("validation suite '{suite}' failed against {target}: {}", failures.join("; "))]
    ValidationFailed {
        suite: String,
        target: String,
        failures: Vec<String>,
    },

    /// The service under test never became ready
    #[error("service {target} not ready after {timeout_secs}s")]
    ReadinessTimeout { target: String, timeout_secs: u64 },

    /// A promotion that does not move exactly one environment forward
    #[error("cannot promote from {from} to {to}")]
    InvalidPromotion { from: String, to: Environment },

    /// Resources selected for one promotion came from different revisions
    #[error("lineage mismatch promoting to '{alias}': {}", describe_lineage(found))]
    LineageMismatch {
        alias: String,
        found: Vec<(ResourceKind, String, Revision)>,
    },

    /// A tag failed and every completed tag was rolled back
    #[error("promotion to '{alias}' failed on {kind} and was rolled back: {cause}")]
    PromotionRolledBack {
        alias: String,
        kind: ResourceKind,
        cause: RegistryError,
    },

    /// A tag failed and the rollback failed too; needs an operator
    #[error(
        "PARTIAL PROMOTION to '{alias}' (revision {revision}): {} now inconsistent; \
         tag of {failed_kind} failed: {cause}; rollback errors: {}",
        kinds(inconsistent),
        rollback_errors.join("; ")
    )]
    PartialPromotion {
        alias: String,
        revision: Revision,
        failed_kind: ResourceKind,
        inconsistent: Vec<ResourceKind>,
        cause: RegistryError,
        rollback_errors: Vec<String>,
    },

    /// The same (stage, revision) is already executing
    #[error("{stage} is already running for revision {revision}")]
    AlreadyRunning { stage: Stage, revision: Revision },

    /// An earlier stage of the run failed or was cancelled
    #[error("{stage} blocked for revision {revision}: {blocking} did not succeed")]
    StageBlocked {
        stage: Stage,
        revision: Revision,
        blocking: Stage,
    },

    /// An external collaborator (build, training, launcher, harness) failed
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    #[error("cancelled before promotion")]
    Cancelled,

    #[error("audit log error: {0}")]
    Audit(String),
}

impl PipelineError {
    pub fn collaborator(collaborator: &'static str, message: impl ToString) -> Self {
        PipelineError::Collaborator {
            collaborator,
            message: message.to_string(),
        }
    }

    /// Whether this failure needs manual remediation
    pub fn requires_operator(&self) -> bool {
        matches!(self, PipelineError::PartialPromotion { .. })
    }
}

fn kinds(kinds: &[ResourceKind]) -> String {
    kinds.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", ")
}

fn describe_lineage(found: &[(ResourceKind, String, Revision)]) -> String {
    found
        .iter()
        .map(|(kind, version, revision)| format!("{} {} from {}", kind, version, revision))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A stage failure, always naming the stage and revision involved
#[derive(Debug, Error)]
#[error("stage {stage} failed for revision {}: {source}", revision_or_unresolved(revision))]
pub struct StageError {
    pub stage: Stage,
    /// None when a manual dispatch could not resolve any revision
    pub revision: Option<Revision>,
    #[source]
    pub source: PipelineError,
}

fn revision_or_unresolved(revision: &Option<Revision>) -> String {
    match revision {
        Some(revision) => revision.to_string(),
        None => "(unresolved)".to_string(),
    }
}

impl StageError {
    pub fn new(stage: Stage, revision: Revision, source: PipelineError) -> Self {
        Self {
            stage,
            revision: Some(revision),
            source,
        }
    }

    pub fn unresolved(stage: Stage, source: PipelineError) -> Self {
        Self {
            stage,
            revision: None,
            source,
        }
    }

    pub fn requires_operator(&self) -> bool {
        self.source.requires_operator()
    }
}
