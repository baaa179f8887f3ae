//! Registry clients for images and models
//!
//! Both registries expose the same alias contract through [`AliasRegistry`],
//! which is what the promotion engine and the dispatcher talk to. Payload
//! level operations (push/pull) live on [`RegistryClient`], parameterized by
//! the payload type of each resource kind.

pub mod image;
pub mod locks;
pub mod model;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use image::{image_version, ImageManifest, MemoryImageRegistry};
pub use locks::AliasLocks;
pub use model::{Metrics, MemoryModelRegistry, ModelRegistry, ModelRegistryClient, ModelVersion};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteImageRegistry, SqliteModelRegistry};

use crate::core::{ArtifactKind, ResourceKind, Revision};
use crate::promotion::PromotionEngine;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Error types for registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{kind} '{reference}' not found")]
    NotFound {
        kind: ResourceKind,
        reference: String,
    },

    #[error("{kind} version '{version}' already exists with a different payload")]
    DuplicateVersion {
        kind: ResourceKind,
        version: String,
    },

    #[error("invalid {kind} version '{version}'")]
    InvalidVersion {
        kind: ResourceKind,
        version: String,
    },

    #[error("{kind} registry backend error: {message}")]
    Backend {
        kind: ResourceKind,
        message: String,
    },
}

impl RegistryError {
    pub fn not_found(kind: ResourceKind, reference: impl Into<String>) -> Self {
        RegistryError::NotFound {
            kind,
            reference: reference.into(),
        }
    }

    pub fn backend(kind: ResourceKind, message: impl ToString) -> Self {
        RegistryError::Backend {
            kind,
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Alias operations shared by every resource kind
///
/// Versions are passed around as strings so that image versions (revision
/// ids) and model versions (registry-assigned numbers) share one contract.
#[async_trait]
pub trait AliasRegistry: Send + Sync {
    /// The resource kind this registry holds
    fn kind(&self) -> ResourceKind;

    /// Point `alias` at `version`, returning the previous holder
    ///
    /// The reassignment is atomic to readers and serialized per alias.
    async fn tag_alias(&self, version: &str, alias: &str) -> RegistryResult<Option<String>>;

    /// Drop an alias entirely (used to undo a first-time tag)
    async fn remove_alias(&self, alias: &str) -> RegistryResult<()>;

    /// Version currently holding `alias`
    async fn resolve_alias(&self, alias: &str) -> RegistryResult<Option<String>>;

    /// Revision that produced `version`
    async fn lineage(&self, version: &str) -> RegistryResult<Revision>;

    /// Newest version produced by `revision`
    async fn find_by_revision(&self, revision: &Revision) -> RegistryResult<Option<String>>;

    /// Most recently registered version
    async fn latest(&self) -> RegistryResult<Option<String>>;
}

/// Payload level registry operations
#[async_trait]
pub trait RegistryClient: AliasRegistry {
    type Payload: Clone + Send + Sync + 'static;

    /// Register an immutable version
    ///
    /// Pushing the same payload twice is a no-op; pushing a different
    /// payload under an existing version is a [`RegistryError::DuplicateVersion`].
    async fn push(&self, version: &str, payload: Self::Payload) -> RegistryResult<()>;

    /// Fetch the payload for a version id, or failing that, an alias
    async fn pull(&self, version_or_alias: &str) -> RegistryResult<Self::Payload>;
}

/// Registry client for one image kind
pub type ImageRegistry = dyn RegistryClient<Payload = ImageManifest>;

/// The registries a pipeline works against
///
/// Holds each registry both as its payload client and as an
/// [`AliasRegistry`] view, so the dispatcher and the promotion engine can
/// address every kind through one contract.
#[derive(Clone)]
pub struct RegistrySet {
    training: Arc<ImageRegistry>,
    serving: Arc<ImageRegistry>,
    models: Arc<dyn ModelRegistry>,
    model_name: String,
    training_aliases: Arc<dyn AliasRegistry>,
    serving_aliases: Arc<dyn AliasRegistry>,
    model_aliases: Arc<dyn AliasRegistry>,
}

impl RegistrySet {
    pub fn new<T, S, M>(
        training: Arc<T>,
        serving: Arc<S>,
        models: Arc<M>,
        model_name: impl Into<String>,
    ) -> Self
    where
        T: RegistryClient<Payload = ImageManifest> + 'static,
        S: RegistryClient<Payload = ImageManifest> + 'static,
        M: ModelRegistry + 'static,
    {
        let model_name = model_name.into();
        let models: Arc<dyn ModelRegistry> = models;
        let model_aliases: Arc<dyn AliasRegistry> =
            Arc::new(ModelRegistryClient::new(models.clone(), model_name.clone()));
        Self {
            training_aliases: training.clone(),
            serving_aliases: serving.clone(),
            training,
            serving,
            models,
            model_name,
            model_aliases,
        }
    }

    /// In-memory registries, for tests and dry runs
    pub fn in_memory(repository: &str, model_name: impl Into<String>) -> Self {
        Self::new(
            Arc::new(MemoryImageRegistry::new(repository, ArtifactKind::Training)),
            Arc::new(MemoryImageRegistry::new(repository, ArtifactKind::Serving)),
            Arc::new(MemoryModelRegistry::new()),
            model_name,
        )
    }

    pub fn images(&self, kind: ArtifactKind) -> &Arc<ImageRegistry> {
        match kind {
            ArtifactKind::Training => &self.training,
            ArtifactKind::Serving => &self.serving,
        }
    }

    pub fn models(&self) -> &Arc<dyn ModelRegistry> {
        &self.models
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Alias view of the registry holding `kind`
    pub fn aliases(&self, kind: ResourceKind) -> &Arc<dyn AliasRegistry> {
        match kind {
            ResourceKind::Model => &self.model_aliases,
            ResourceKind::Artifact(ArtifactKind::Training) => &self.training_aliases,
            ResourceKind::Artifact(ArtifactKind::Serving) => &self.serving_aliases,
        }
    }

    /// A promotion engine over the release resources
    pub fn promotion_engine(&self) -> PromotionEngine {
        ResourceKind::release_set()
            .into_iter()
            .fold(PromotionEngine::new(), |engine, kind| {
                engine.with_registry(self.aliases(kind).clone())
            })
    }
}
