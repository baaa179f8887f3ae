//! Model registry and its adapter onto the uniform alias contract

use crate::core::{ResourceKind, Revision};
use crate::registry::{AliasLocks, AliasRegistry, RegistryClient, RegistryError, RegistryResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Metric name -> value, recorded once at registration
pub type Metrics = BTreeMap<String, f64>;

/// A registered, trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    /// Registered model name
    pub name: String,

    /// Registry-assigned version, increasing per model name
    pub version: u64,

    /// Revision whose training run produced this model
    pub revision: Revision,

    /// Metrics logged by the training run
    pub metrics: Metrics,

    /// When the version was registered
    pub registered_at: DateTime<Utc>,

    /// Aliases currently pointing at this version
    #[serde(default)]
    pub aliases: BTreeSet<String>,
}

impl ModelVersion {
    pub fn new(name: impl Into<String>, version: u64, revision: Revision) -> Self {
        Self {
            name: name.into(),
            version,
            revision,
            metrics: Metrics::new(),
            registered_at: Utc::now(),
            aliases: BTreeSet::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Whether two records describe the same immutable version
    ///
    /// Registration time and aliases are not part of a version's identity.
    pub fn same_content(&self, other: &ModelVersion) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.revision == other.revision
            && self.metrics == other.metrics
    }
}

/// Model registry operations, keyed by model name
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Register a new version; the registry assigns the version number
    async fn register(
        &self,
        model_name: &str,
        revision: &Revision,
        metrics: Metrics,
    ) -> RegistryResult<ModelVersion>;

    /// Store a version whose number is already known
    ///
    /// Re-importing an identical version is a no-op. A new version must be
    /// numbered above every existing one, so versions stay increasing in
    /// registration order.
    async fn import(&self, model: ModelVersion) -> RegistryResult<()>;

    async fn get_version(&self, model_name: &str, version: u64) -> RegistryResult<ModelVersion>;

    async fn get_metrics(&self, model_name: &str, version: u64) -> RegistryResult<Metrics> {
        Ok(self.get_version(model_name, version).await?.metrics)
    }

    /// Point `alias` at `version`, returning the previous holder
    async fn set_alias(
        &self,
        model_name: &str,
        version: u64,
        alias: &str,
    ) -> RegistryResult<Option<u64>>;

    async fn delete_alias(&self, model_name: &str, alias: &str) -> RegistryResult<()>;

    async fn resolve_alias(&self, model_name: &str, alias: &str) -> RegistryResult<Option<u64>>;

    /// Newest version registered for `revision`
    async fn latest_for_revision(
        &self,
        model_name: &str,
        revision: &Revision,
    ) -> RegistryResult<Option<u64>>;

    async fn latest_version(&self, model_name: &str) -> RegistryResult<Option<u64>>;
}

#[derive(Debug, Default)]
struct ModelEntry {
    versions: BTreeMap<u64, ModelVersion>,
    aliases: HashMap<String, u64>,
}

impl ModelEntry {
    fn with_aliases(&self, mut model: ModelVersion) -> ModelVersion {
        model.aliases = self
            .aliases
            .iter()
            .filter(|(_, v)| **v == model.version)
            .map(|(alias, _)| alias.clone())
            .collect();
        model
    }
}

/// In-memory model registry
#[derive(Debug, Default)]
pub struct MemoryModelRegistry {
    models: RwLock<HashMap<String, ModelEntry>>,
    locks: AliasLocks,
}

impl MemoryModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn out_of_order(model: &ModelVersion, latest: u64) -> RegistryError {
    debug!(
        "Refusing to import {} version {} behind latest {}",
        model.name, model.version, latest
    );
    RegistryError::InvalidVersion {
        kind: ResourceKind::Model,
        version: format!("{}/{} (latest is {})", model.name, model.version, latest),
    }
}

fn version_not_found(model_name: &str, version: u64) -> RegistryError {
    RegistryError::not_found(ResourceKind::Model, format!("{}/{}", model_name, version))
}

#[async_trait]
impl ModelRegistry for MemoryModelRegistry {
    async fn register(
        &self,
        model_name: &str,
        revision: &Revision,
        metrics: Metrics,
    ) -> RegistryResult<ModelVersion> {
        let mut models = self.models.write().await;
        let entry = models.entry(model_name.to_string()).or_default();
        let version = entry.versions.keys().next_back().copied().unwrap_or(0) + 1;

        let mut model = ModelVersion::new(model_name, version, revision.clone());
        model.metrics = metrics;
        entry.versions.insert(version, model.clone());

        info!("Registered {} version {} from revision {}", model_name, version, revision);
        Ok(model)
    }

    async fn import(&self, model: ModelVersion) -> RegistryResult<()> {
        let mut models = self.models.write().await;
        let entry = models.entry(model.name.clone()).or_default();
        match entry.versions.get(&model.version) {
            Some(existing) if existing.same_content(&model) => Ok(()),
            Some(_) => Err(RegistryError::DuplicateVersion {
                kind: ResourceKind::Model,
                version: model.version.to_string(),
            }),
            None => {
                if let Some(latest) = entry.versions.keys().next_back() {
                    if model.version <= *latest {
                        return Err(out_of_order(&model, *latest));
                    }
                }
                let mut model = model;
                model.aliases.clear();
                entry.versions.insert(model.version, model);
                Ok(())
            }
        }
    }

    async fn get_version(&self, model_name: &str, version: u64) -> RegistryResult<ModelVersion> {
        let models = self.models.read().await;
        models
            .get(model_name)
            .and_then(|entry| {
                entry
                    .versions
                    .get(&version)
                    .map(|model| entry.with_aliases(model.clone()))
            })
            .ok_or_else(|| version_not_found(model_name, version))
    }

    async fn set_alias(
        &self,
        model_name: &str,
        version: u64,
        alias: &str,
    ) -> RegistryResult<Option<u64>> {
        let _guard = self.locks.acquire(&format!("{}/{}", model_name, alias)).await;
        let mut models = self.models.write().await;
        let entry = models
            .get_mut(model_name)
            .filter(|entry| entry.versions.contains_key(&version))
            .ok_or_else(|| version_not_found(model_name, version))?;

        let previous = entry.aliases.insert(alias.to_string(), version);
        debug!("{}: alias '{}' -> {} (was {:?})", model_name, alias, version, previous);
        Ok(previous)
    }

    async fn delete_alias(&self, model_name: &str, alias: &str) -> RegistryResult<()> {
        let _guard = self.locks.acquire(&format!("{}/{}", model_name, alias)).await;
        if let Some(entry) = self.models.write().await.get_mut(model_name) {
            entry.aliases.remove(alias);
        }
        Ok(())
    }

    async fn resolve_alias(&self, model_name: &str, alias: &str) -> RegistryResult<Option<u64>> {
        let models = self.models.read().await;
        Ok(models
            .get(model_name)
            .and_then(|entry| entry.aliases.get(alias).copied()))
    }

    async fn latest_for_revision(
        &self,
        model_name: &str,
        revision: &Revision,
    ) -> RegistryResult<Option<u64>> {
        let models = self.models.read().await;
        Ok(models.get(model_name).and_then(|entry| {
            entry
                .versions
                .values()
                .rev()
                .find(|model| &model.revision == revision)
                .map(|model| model.version)
        }))
    }

    async fn latest_version(&self, model_name: &str) -> RegistryResult<Option<u64>> {
        let models = self.models.read().await;
        Ok(models
            .get(model_name)
            .and_then(|entry| entry.versions.keys().next_back().copied()))
    }
}

/// Binds a model name so a [`ModelRegistry`] can be driven through the
/// uniform [`RegistryClient`] contract
pub struct ModelRegistryClient<M: ?Sized> {
    registry: Arc<M>,
    model_name: String,
}

impl<M: ModelRegistry + ?Sized> ModelRegistryClient<M> {
    pub fn new(registry: Arc<M>, model_name: impl Into<String>) -> Self {
        Self {
            registry,
            model_name: model_name.into(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn registry(&self) -> &Arc<M> {
        &self.registry
    }

    fn parse_version(&self, version: &str) -> RegistryResult<u64> {
        version.parse().map_err(|_| RegistryError::InvalidVersion {
            kind: ResourceKind::Model,
            version: version.to_string(),
        })
    }
}

#[async_trait]
impl<M: ModelRegistry + ?Sized> AliasRegistry for ModelRegistryClient<M> {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Model
    }

    async fn tag_alias(&self, version: &str, alias: &str) -> RegistryResult<Option<String>> {
        let version = self.parse_version(version)?;
        let previous = self.registry.set_alias(&self.model_name, version, alias).await?;
        Ok(previous.map(|v| v.to_string()))
    }

    async fn remove_alias(&self, alias: &str) -> RegistryResult<()> {
        self.registry.delete_alias(&self.model_name, alias).await
    }

    async fn resolve_alias(&self, alias: &str) -> RegistryResult<Option<String>> {
        let version = self.registry.resolve_alias(&self.model_name, alias).await?;
        Ok(version.map(|v| v.to_string()))
    }

    async fn lineage(&self, version: &str) -> RegistryResult<Revision> {
        let version = self.parse_version(version)?;
        Ok(self.registry.get_version(&self.model_name, version).await?.revision)
    }

    async fn find_by_revision(&self, revision: &Revision) -> RegistryResult<Option<String>> {
        let version = self.registry.latest_for_revision(&self.model_name, revision).await?;
        Ok(version.map(|v| v.to_string()))
    }

    async fn latest(&self) -> RegistryResult<Option<String>> {
        let version = self.registry.latest_version(&self.model_name).await?;
        Ok(version.map(|v| v.to_string()))
    }
}

#[async_trait]
impl<M: ModelRegistry + ?Sized> RegistryClient for ModelRegistryClient<M> {
    type Payload = ModelVersion;

    async fn push(&self, version: &str, payload: ModelVersion) -> RegistryResult<()> {
        let version = self.parse_version(version)?;
        if payload.version != version || payload.name != self.model_name {
            return Err(RegistryError::InvalidVersion {
                kind: ResourceKind::Model,
                version: format!("{}/{}", payload.name, payload.version),
            });
        }
        self.registry.import(payload).await
    }

    async fn pull(&self, version_or_alias: &str) -> RegistryResult<ModelVersion> {
        if let Ok(version) = version_or_alias.parse::<u64>() {
            match self.registry.get_version(&self.model_name, version).await {
                Err(err) if err.is_not_found() => {}
                other => return other,
            }
        }
        match self.registry.resolve_alias(&self.model_name, version_or_alias).await? {
            Some(version) => self.registry.get_version(&self.model_name, version).await,
            None => Err(RegistryError::not_found(
                ResourceKind::Model,
                format!("{}/{}", self.model_name, version_or_alias),
            )),
        }
    }
}
