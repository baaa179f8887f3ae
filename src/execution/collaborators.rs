//! Interfaces of the external collaborators a stage drives

use crate::core::{ArtifactKind, PipelineError, Revision};
use crate::registry::{ImageManifest, Metrics, ModelVersion};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Builds a container image for a revision
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn build(
        &self,
        revision: &Revision,
        kind: ArtifactKind,
    ) -> Result<ImageManifest, PipelineError>;
}

/// Trains a model inside the training image and reports its metrics
#[async_trait]
pub trait ModelTrainer: Send + Sync {
    async fn train(
        &self,
        revision: &Revision,
        training_image: &ImageManifest,
        experiment: &str,
    ) -> Result<Metrics, PipelineError>;
}

/// What to run when instantiating a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Image version or alias the instance was resolved from
    pub artifact: String,
    pub image: ImageManifest,
    pub model: Option<ModelVersion>,
    pub port: u16,
    pub env: BTreeMap<String, String>,
    /// Leave the instance running after the controller exits
    pub keep_running: bool,
}

impl LaunchSpec {
    /// Human-readable name of the instance, used in errors
    pub fn target(&self) -> String {
        match &self.model {
            Some(model) => {
                format!("{}@{}+model/{}", self.image.revision, self.artifact, model.version)
            }
            None => format!("{}@{}", self.image.revision, self.artifact),
        }
    }
}

/// A running service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub id: String,
    pub endpoint: String,
}

/// Starts and stops service instances
#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    async fn start(&self, spec: &LaunchSpec) -> Result<ServiceHandle, PipelineError>;

    /// One readiness check; never blocks for long
    async fn is_ready(&self, handle: &ServiceHandle) -> bool;

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), PipelineError>;
}

/// Verdict of a functional test suite
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SuiteReport {
    pub passed: bool,
    pub failures: Vec<String>,
}

impl SuiteReport {
    pub fn passed() -> Self {
        Self {
            passed: true,
            failures: Vec::new(),
        }
    }

    pub fn failed(failures: Vec<String>) -> Self {
        Self {
            passed: false,
            failures,
        }
    }
}

/// Runs an external functional test suite against an endpoint
#[async_trait]
pub trait ValidationHarness: Send + Sync {
    async fn run_suite(&self, endpoint: &str, suite: &str) -> Result<SuiteReport, PipelineError>;
}
