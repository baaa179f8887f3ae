//! stagegate - a staged release pipeline controller
//!
//! Moves a revision's container images and trained model through
//! `commit -> staging -> production`, gated by a metric quality gate and a
//! functional validation suite, with both resources promoted together.

pub mod cli;
pub mod core;
pub mod execution;
pub mod gate;
pub mod persistence;
pub mod promotion;
pub mod registry;

// Re-export commonly used types
pub use crate::core::{
    ArtifactKind, ControllerConfig, Environment, PipelineError, ResourceKind, Revision, Stage,
    StageError,
};
pub use execution::{Conclusion, ControllerEvent, PipelineController, StageOutcome, UpstreamEvent};
pub use gate::{QualityGate, QualityGateResult, QualityThresholds};
pub use promotion::{PromotionEngine, PromotionResult, PromotionSource};
pub use registry::{AliasRegistry, ModelRegistry, RegistryClient, RegistryError, RegistrySet};
