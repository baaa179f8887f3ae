//! Stage context - the resolved inputs of one stage invocation

use crate::core::{PipelineError, ResourceKind, Revision, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Revision and immutable versions a stage invocation operates on
///
/// Stages never act on a moving alias directly. Aliases are resolved once,
/// at dispatch time, and the concrete versions are carried here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageContext {
    pub stage: Stage,

    pub revision: Revision,

    /// Immutable version per resource kind
    pub versions: BTreeMap<ResourceKind, String>,

    /// When the context was resolved
    pub resolved_at: DateTime<Utc>,
}

impl StageContext {
    pub fn new(stage: Stage, revision: Revision) -> Self {
        Self {
            stage,
            revision,
            versions: BTreeMap::new(),
            resolved_at: Utc::now(),
        }
    }

    pub fn with_version(mut self, kind: ResourceKind, version: impl Into<String>) -> Self {
        self.versions.insert(kind, version.into());
        self
    }

    pub fn version(&self, kind: ResourceKind) -> Option<&str> {
        self.versions.get(&kind).map(String::as_str)
    }

    /// Version for `kind`, or a context resolution error naming the stage
    pub fn require(&self, kind: ResourceKind) -> Result<&str, PipelineError> {
        self.version(kind).ok_or_else(|| PipelineError::ContextResolution {
            stage: self.stage,
            reason: format!("no {} version resolved for revision {}", kind, self.revision),
        })
    }

    /// Versions keyed by display name, as stored in the audit log
    pub fn audit_versions(&self) -> BTreeMap<String, String> {
        self.versions
            .iter()
            .map(|(kind, version)| (kind.to_string(), version.clone()))
            .collect()
    }
}
