//! Container image registry

use crate::core::{ArtifactKind, ResourceKind, Revision};
use crate::registry::{AliasLocks, AliasRegistry, RegistryClient, RegistryError, RegistryResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

/// Payload stored for one image version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Revision the image was built from
    pub revision: Revision,

    /// Content digest reported by the build
    pub digest: String,

    /// Free-form build labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ImageManifest {
    pub fn new(revision: Revision, digest: impl Into<String>) -> Self {
        Self {
            revision,
            digest: digest.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Image version derived from the revision that produced it
pub fn image_version(revision: &Revision) -> String {
    revision.as_str().to_string()
}

#[derive(Debug, Default)]
struct ImageState {
    images: HashMap<String, ImageManifest>,
    /// Push order, oldest first
    pushed: Vec<String>,
    aliases: HashMap<String, String>,
}

/// In-memory image registry for one (repository, kind) pair
#[derive(Debug)]
pub struct MemoryImageRegistry {
    repository: String,
    kind: ArtifactKind,
    state: RwLock<ImageState>,
    locks: AliasLocks,
}

impl MemoryImageRegistry {
    pub fn new(repository: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            repository: repository.into(),
            kind,
            state: RwLock::new(ImageState::default()),
            locks: AliasLocks::new(),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Aliases currently pointing at `version`
    pub async fn aliases_of(&self, version: &str) -> Vec<String> {
        let state = self.state.read().await;
        let mut aliases: Vec<String> = state
            .aliases
            .iter()
            .filter(|(_, v)| v.as_str() == version)
            .map(|(alias, _)| alias.clone())
            .collect();
        aliases.sort();
        aliases
    }
}

#[async_trait]
impl AliasRegistry for MemoryImageRegistry {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Artifact(self.kind)
    }

    async fn tag_alias(&self, version: &str, alias: &str) -> RegistryResult<Option<String>> {
        let _guard = self.locks.acquire(alias).await;
        let mut state = self.state.write().await;
        if !state.images.contains_key(version) {
            return Err(RegistryError::not_found(self.kind(), version));
        }
        let previous = state.aliases.insert(alias.to_string(), version.to_string());
        debug!(
            "{}/{}: alias '{}' -> {} (was {:?})",
            self.repository, self.kind, alias, version, previous
        );
        Ok(previous)
    }

    async fn remove_alias(&self, alias: &str) -> RegistryResult<()> {
        let _guard = self.locks.acquire(alias).await;
        self.state.write().await.aliases.remove(alias);
        Ok(())
    }

    async fn resolve_alias(&self, alias: &str) -> RegistryResult<Option<String>> {
        Ok(self.state.read().await.aliases.get(alias).cloned())
    }

    async fn lineage(&self, version: &str) -> RegistryResult<Revision> {
        self.state
            .read()
            .await
            .images
            .get(version)
            .map(|manifest| manifest.revision.clone())
            .ok_or_else(|| RegistryError::not_found(self.kind(), version))
    }

    async fn find_by_revision(&self, revision: &Revision) -> RegistryResult<Option<String>> {
        let state = self.state.read().await;
        Ok(state
            .pushed
            .iter()
            .rev()
            .find(|version| {
                state
                    .images
                    .get(*version)
                    .is_some_and(|manifest| &manifest.revision == revision)
            })
            .cloned())
    }

    async fn latest(&self) -> RegistryResult<Option<String>> {
        Ok(self.state.read().await.pushed.last().cloned())
    }
}

#[async_trait]
impl RegistryClient for MemoryImageRegistry {
    type Payload = ImageManifest;

    async fn push(&self, version: &str, payload: ImageManifest) -> RegistryResult<()> {
        let mut state = self.state.write().await;
        match state.images.get(version) {
            Some(existing) if existing == &payload => {
                debug!("{}/{}: {} already pushed, skipping", self.repository, self.kind, version);
                Ok(())
            }
            Some(_) => Err(RegistryError::DuplicateVersion {
                kind: self.kind(),
                version: version.to_string(),
            }),
            None => {
                state.images.insert(version.to_string(), payload);
                state.pushed.push(version.to_string());
                Ok(())
            }
        }
    }

    async fn pull(&self, version_or_alias: &str) -> RegistryResult<ImageManifest> {
        let state = self.state.read().await;
        if let Some(manifest) = state.images.get(version_or_alias) {
            return Ok(manifest.clone());
        }
        state
            .aliases
            .get(version_or_alias)
            .and_then(|version| state.images.get(version))
            .cloned()
            .ok_or_else(|| RegistryError::not_found(self.kind(), version_or_alias))
    }
}
