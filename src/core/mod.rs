//! Core domain models
//!
//! Revisions, stages, environments and the state records that describe how
//! a revision moves through them.

pub mod config;
pub mod context;
pub mod error;
pub mod revision;
pub mod stage;
pub mod state;

pub use config::ControllerConfig;
pub use context::StageContext;
pub use error::{PipelineError, StageError};
pub use revision::{ArtifactKind, Environment, InvalidRevision, ResourceKind, Revision};
pub use stage::Stage;
pub use state::*;
