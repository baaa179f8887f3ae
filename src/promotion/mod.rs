//! Promotion engine - moves an environment alias across resource kinds
//!
//! A promotion resolves its source to one immutable version per resource
//! kind, checks that every version traces to the same revision, then tags
//! them in [`ResourceKind`] order (model first). If a tag fails, tags that
//! already landed are moved back to their previous holder. A failed
//! rollback is reported as [`PipelineError::PartialPromotion`].

use crate::core::{Environment, PipelineError, ResourceKind, Revision};
use crate::registry::{AliasLocks, AliasRegistry, RegistryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Where the versions being promoted come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionSource {
    /// Versions produced by a revision (images tagged with it, newest model trained from it)
    Revision(Revision),
    /// Whatever currently holds an environment's alias
    Alias(Environment),
    /// Explicit immutable versions per resource kind, currently in `from`
    ///
    /// When `from` has an alias, every pinned version must still hold it.
    Versions {
        from: Environment,
        versions: BTreeMap<ResourceKind, String>,
    },
}

impl PromotionSource {
    /// Environment the source versions currently sit in
    pub fn environment(&self) -> Environment {
        match self {
            PromotionSource::Revision(_) => Environment::Commit,
            PromotionSource::Alias(env) => *env,
            PromotionSource::Versions { from, .. } => *from,
        }
    }
}

impl fmt::Display for PromotionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromotionSource::Revision(revision) => write!(f, "revision {}", revision),
            PromotionSource::Alias(env) => write!(f, "alias {}", env),
            PromotionSource::Versions { from, versions } => {
                let pinned: Vec<String> = versions
                    .iter()
                    .map(|(kind, version)| format!("{}={}", kind, version))
                    .collect();
                write!(f, "{} versions [{}]", from, pinned.join(", "))
            }
        }
    }
}

/// One alias reassignment performed by a promotion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasMove {
    pub kind: ResourceKind,
    pub version: String,
    pub previous: Option<String>,
}

/// Outcome of a successful promotion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionResult {
    pub environment: Environment,
    pub alias: String,
    pub revision: Revision,
    /// Moves in the order they were applied
    pub moves: Vec<AliasMove>,
    pub promoted_at: DateTime<Utc>,
}

impl PromotionResult {
    pub fn version_of(&self, kind: ResourceKind) -> Option<&str> {
        self.moves
            .iter()
            .find(|m| m.kind == kind)
            .map(|m| m.version.as_str())
    }
}

/// A version holding an environment's alias, with its lineage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasHolder {
    pub version: String,
    pub revision: Revision,
}

/// The sole writer of environment aliases
pub struct PromotionEngine {
    registries: BTreeMap<ResourceKind, Arc<dyn AliasRegistry>>,
    locks: AliasLocks,
}

impl PromotionEngine {
    pub fn new() -> Self {
        Self {
            registries: BTreeMap::new(),
            locks: AliasLocks::new(),
        }
    }

    /// Register the registry that holds one resource kind
    pub fn with_registry(mut self, registry: Arc<dyn AliasRegistry>) -> Self {
        self.registries.insert(registry.kind(), registry);
        self
    }

    pub fn registry(&self, kind: ResourceKind) -> Result<&Arc<dyn AliasRegistry>, PipelineError> {
        self.registries
            .get(&kind)
            .ok_or_else(|| {
                let reason = format!("no registry configured for {}", kind);
                PipelineError::collaborator("promotion", reason)
            })
    }

    /// Move `to`'s alias onto the source versions for every kind in `kinds`
    pub async fn promote(
        &self,
        source: &PromotionSource,
        to: Environment,
        kinds: &BTreeSet<ResourceKind>,
    ) -> Result<PromotionResult, PipelineError> {
        let alias = match (source.environment().next(), to.alias()) {
            (Some(next), Some(alias)) if next == to && !kinds.is_empty() => alias,
            _ => {
                return Err(PipelineError::InvalidPromotion {
                    from: source.to_string(),
                    to,
                })
            }
        };

        // Two-resource promotions to the same alias must not interleave.
        let _guard = self.locks.acquire(alias).await;

        let mut resolved = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let registry = self.registry(*kind)?;
            let version = self.resolve_source(registry.as_ref(), source, to).await?;
            let revision = registry.lineage(&version).await?;
            resolved.push((*kind, version, revision));
        }

        let revision = match source {
            PromotionSource::Revision(revision) => revision.clone(),
            _ => resolved[0].2.clone(),
        };
        if resolved.iter().any(|(_, _, r)| r != &revision) {
            return Err(PipelineError::LineageMismatch {
                alias: alias.to_string(),
                found: resolved,
            });
        }

        info!("Promoting {} to '{}' (revision {})", source, alias, revision);

        let mut applied: Vec<AliasMove> = Vec::with_capacity(resolved.len());
        for (kind, version, _) in resolved {
            let registry = self.registry(kind)?;
            match registry.tag_alias(&version, alias).await {
                Ok(previous) => {
                    info!("{} '{}' -> {} (was {:?})", kind, alias, version, previous);
                    applied.push(AliasMove {
                        kind,
                        version,
                        previous,
                    });
                }
                Err(cause) => {
                    return Err(self.roll_back(alias, &revision, kind, cause, &applied).await);
                }
            }
        }

        Ok(PromotionResult {
            environment: to,
            alias: alias.to_string(),
            revision,
            moves: applied,
            promoted_at: Utc::now(),
        })
    }

    async fn resolve_source(
        &self,
        registry: &dyn AliasRegistry,
        source: &PromotionSource,
        to: Environment,
    ) -> Result<String, PipelineError> {
        let kind = registry.kind();
        match source {
            PromotionSource::Revision(revision) => registry
                .find_by_revision(revision)
                .await?
                .ok_or_else(|| {
                    RegistryError::not_found(kind, format!("revision {}", revision)).into()
                }),
            PromotionSource::Alias(env) => {
                let alias = env.alias().ok_or_else(|| PipelineError::InvalidPromotion {
                    from: source.to_string(),
                    to,
                })?;
                registry
                    .resolve_alias(alias)
                    .await?
                    .ok_or_else(|| RegistryError::not_found(kind, alias).into())
            }
            PromotionSource::Versions { from, versions } => {
                let version = versions.get(&kind).ok_or_else(|| PipelineError::InvalidPromotion {
                    from: format!("{} (no {} version pinned)", source, kind),
                    to,
                })?;
                if let Some(alias) = from.alias() {
                    let holder = registry.resolve_alias(alias).await?;
                    if holder.as_deref() != Some(version.as_str()) {
                        return Err(PipelineError::InvalidPromotion {
                            from: format!(
                                "{} ({} {} no longer holds '{}')",
                                source, kind, version, alias
                            ),
                            to,
                        });
                    }
                }
                Ok(version.clone())
            }
        }
    }

    /// Undo completed tags in reverse order
    async fn roll_back(
        &self,
        alias: &str,
        revision: &Revision,
        failed_kind: ResourceKind,
        cause: RegistryError,
        applied: &[AliasMove],
    ) -> PipelineError {
        warn!(
            "Tagging {} as '{}' failed: {}; rolling back {} completed tag(s)",
            failed_kind,
            alias,
            cause,
            applied.len()
        );

        let mut inconsistent = Vec::new();
        let mut rollback_errors = Vec::new();
        for mv in applied.iter().rev() {
            let result = match self.registry(mv.kind) {
                Ok(registry) => match &mv.previous {
                    Some(previous) => registry.tag_alias(previous, alias).await.map(|_| ()),
                    None => registry.remove_alias(alias).await,
                },
                Err(e) => Err(RegistryError::backend(mv.kind, e)),
            };
            match result {
                Ok(()) => info!("Rolled back {} '{}' to {:?}", mv.kind, alias, mv.previous),
                Err(e) => {
                    inconsistent.push(mv.kind);
                    rollback_errors.push(format!("{}: {}", mv.kind, e));
                }
            }
        }

        if inconsistent.is_empty() {
            return PipelineError::PromotionRolledBack {
                alias: alias.to_string(),
                kind: failed_kind,
                cause,
            };
        }

        let err = PipelineError::PartialPromotion {
            alias: alias.to_string(),
            revision: revision.clone(),
            failed_kind,
            inconsistent,
            cause,
            rollback_errors,
        };
        error!("{}", err);
        err
    }

    /// Current holder of an environment's alias for each registered kind
    pub async fn environment_view(
        &self,
        env: Environment,
    ) -> Result<BTreeMap<ResourceKind, Option<AliasHolder>>, PipelineError> {
        let mut view = BTreeMap::new();
        let Some(alias) = env.alias() else {
            return Ok(view);
        };
        for (kind, registry) in &self.registries {
            let holder = match registry.resolve_alias(alias).await? {
                Some(version) => Some(AliasHolder {
                    revision: registry.lineage(&version).await?,
                    version,
                }),
                None => None,
            };
            view.insert(*kind, holder);
        }
        Ok(view)
    }
}

impl Default for PromotionEngine {
    fn default() -> Self {
        Self::new()
    }
}
