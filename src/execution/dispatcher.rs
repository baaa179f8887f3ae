//! Stage trigger dispatcher
//!
//! Turns upstream completion events and manual requests into stage
//! invocations. Each invocation carries a resolved [`StageContext`] and a
//! lease on its (stage, revision) key, and starts a Running attempt.

use crate::core::{
    ArtifactKind, Environment, PipelineError, ResourceKind, Revision, Stage, StageAttempt,
    StageContext, TriggerSource,
};
use crate::execution::machine::PipelineStateMachine;
use crate::registry::RegistrySet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// How an upstream stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conclusion {
    Success,
    Failure,
    Cancelled,
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conclusion::Success => f.write_str("success"),
            Conclusion::Failure => f.write_str("failure"),
            Conclusion::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Completion notice from the CI platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamEvent {
    pub upstream_stage: Stage,
    pub conclusion: Conclusion,
    pub revision: Revision,
}

impl UpstreamEvent {
    pub fn success(upstream_stage: Stage, revision: Revision) -> Self {
        Self {
            upstream_stage,
            conclusion: Conclusion::Success,
            revision,
        }
    }
}

type LeaseSet = Arc<Mutex<HashSet<(Stage, Revision)>>>;

/// Exclusive claim on one (stage, revision); released on drop
#[derive(Debug)]
pub struct StageLease {
    key: (Stage, Revision),
    held: LeaseSet,
}

impl Drop for StageLease {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
    }
}

/// A stage that is cleared to run
#[derive(Debug)]
pub struct StageInvocation {
    pub context: StageContext,
    pub trigger: TriggerSource,
    pub attempt: StageAttempt,
    _lease: StageLease,
}

impl StageInvocation {
    pub fn stage(&self) -> Stage {
        self.context.stage
    }

    pub fn revision(&self) -> &Revision {
        &self.context.revision
    }
}

/// Outcome of resolving a stage's inputs
enum Resolution {
    Ready(StageContext),
    /// The environment alias now belongs to another revision
    Superseded { alias: &'static str, current: Revision },
}

pub struct StageDispatcher {
    registries: RegistrySet,
    machine: Arc<PipelineStateMachine>,
    leases: LeaseSet,
}

impl StageDispatcher {
    pub fn new(registries: RegistrySet, machine: Arc<PipelineStateMachine>) -> Self {
        Self {
            registries,
            machine,
            leases: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Decide whether the successor of `event.upstream_stage` runs
    ///
    /// Returns `None` for a non-successful conclusion, for the last stage,
    /// and when the candidate has been superseded (recorded as Skipped).
    pub async fn on_upstream_event(
        &self,
        event: &UpstreamEvent,
    ) -> Result<Option<StageInvocation>, PipelineError> {
        if event.conclusion != Conclusion::Success {
            info!(
                "{} concluded {} for {}; not triggering downstream",
                event.upstream_stage, event.conclusion, event.revision
            );
            return Ok(None);
        }
        let Some(stage) = event.upstream_stage.successor() else {
            debug!("{} is the last stage", event.upstream_stage);
            return Ok(None);
        };

        let lease = self.acquire(stage, &event.revision)?;
        match self.resolve(stage, Some(&event.revision)).await? {
            Resolution::Ready(context) => {
                let attempt = self
                    .machine
                    .begin(stage, &event.revision, TriggerSource::UpstreamCompletion)
                    .await?;
                Ok(Some(StageInvocation {
                    context,
                    trigger: TriggerSource::UpstreamCompletion,
                    attempt,
                    _lease: lease,
                }))
            }
            Resolution::Superseded { alias, current } => {
                let reason = format!("'{}' alias has moved on to revision {}", alias, current);
                warn!("{} for {} superseded: {}", stage, event.revision, reason);
                self.machine
                    .skip(stage, &event.revision, TriggerSource::UpstreamCompletion, reason)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Operator-requested run of any stage
    ///
    /// Without an explicit revision the most recent valid one is used.
    pub async fn dispatch_manual(
        &self,
        stage: Stage,
        revision: Option<Revision>,
    ) -> Result<StageInvocation, PipelineError> {
        let context = match self.resolve(stage, revision.as_ref()).await? {
            Resolution::Ready(context) => context,
            Resolution::Superseded { alias, current } => {
                return Err(PipelineError::ContextResolution {
                    stage,
                    reason: format!(
                        "'{}' alias holds revision {}, not the requested one",
                        alias, current
                    ),
                });
            }
        };

        let lease = self.acquire(stage, &context.revision)?;
        let attempt = self
            .machine
            .begin(stage, &context.revision, TriggerSource::ManualDispatch)
            .await?;
        info!("Manual dispatch of {} for {}", stage, context.revision);
        Ok(StageInvocation {
            context,
            trigger: TriggerSource::ManualDispatch,
            attempt,
            _lease: lease,
        })
    }

    /// Record a push and hand back the build invocation
    pub async fn on_push(&self, revision: Revision) -> Result<StageInvocation, PipelineError> {
        let lease = self.acquire(Stage::Build, &revision)?;
        let attempt = self.machine.begin(Stage::Build, &revision, TriggerSource::Push).await?;
        Ok(StageInvocation {
            context: StageContext::new(Stage::Build, revision),
            trigger: TriggerSource::Push,
            attempt,
            _lease: lease,
        })
    }

    fn acquire(&self, stage: Stage, revision: &Revision) -> Result<StageLease, PipelineError> {
        let key = (stage, revision.clone());
        let mut held = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(key.clone()) {
            return Err(PipelineError::AlreadyRunning {
                stage,
                revision: revision.clone(),
            });
        }
        Ok(StageLease {
            key,
            held: self.leases.clone(),
        })
    }

    async fn resolve(
        &self,
        stage: Stage,
        revision: Option<&Revision>,
    ) -> Result<Resolution, PipelineError> {
        match stage.source_environment() {
            None => match revision {
                Some(revision) => Ok(Resolution::Ready(StageContext::new(stage, revision.clone()))),
                None => Err(PipelineError::ContextResolution {
                    stage,
                    reason: "build requires an explicit revision".to_string(),
                }),
            },
            Some(Environment::Commit) => {
                self.resolve_commit(stage, revision).await.map(Resolution::Ready)
            }
            Some(env) => self.resolve_alias(stage, env, revision).await,
        }
    }

    /// Images built from the revision (or the most recently pushed one)
    async fn resolve_commit(
        &self,
        stage: Stage,
        revision: Option<&Revision>,
    ) -> Result<StageContext, PipelineError> {
        let revision = match revision {
            Some(revision) => revision.clone(),
            None => {
                let serving = self
                    .registries
                    .aliases(ResourceKind::Artifact(ArtifactKind::Serving));
                let latest =
                    serving
                        .latest()
                        .await?
                        .ok_or_else(|| PipelineError::ContextResolution {
                            stage,
                            reason: "no serving image has been pushed".to_string(),
                        })?;
                serving.lineage(&latest).await?
            }
        };

        let mut context = StageContext::new(stage, revision);
        for kind in ArtifactKind::ALL {
            let kind = ResourceKind::Artifact(kind);
            let version = self
                .registries
                .aliases(kind)
                .find_by_revision(&context.revision)
                .await?
                .ok_or_else(|| PipelineError::ContextResolution {
                    stage,
                    reason: format!("no {} built for revision {}", kind, context.revision),
                })?;
            context.versions.insert(kind, version);
        }
        Ok(context)
    }

    /// Versions currently holding an environment alias
    async fn resolve_alias(
        &self,
        stage: Stage,
        env: Environment,
        revision: Option<&Revision>,
    ) -> Result<Resolution, PipelineError> {
        let alias = env.alias().ok_or_else(|| PipelineError::ContextResolution {
            stage,
            reason: format!("{} has no alias", env),
        })?;

        let mut held = Vec::new();
        for kind in ResourceKind::release_set() {
            let registry = self.registries.aliases(kind);
            let version = registry
                .resolve_alias(alias)
                .await?
                .ok_or_else(|| PipelineError::ContextResolution {
                    stage,
                    reason: format!("'{}' alias is not set for {}", alias, kind),
                })?;
            let lineage = registry.lineage(&version).await?;
            held.push((kind, version, lineage));
        }

        let current = held[0].2.clone();
        if held.iter().any(|(_, _, lineage)| lineage != &current) {
            return Err(PipelineError::ContextResolution {
                stage,
                reason: format!("'{}' alias points at more than one revision", alias),
            });
        }
        if let Some(requested) = revision {
            if requested != &current {
                return Ok(Resolution::Superseded { alias, current });
            }
        }

        let context = held
            .into_iter()
            .fold(StageContext::new(stage, current), |ctx, (kind, version, _)| {
                ctx.with_version(kind, version)
            });
        Ok(Resolution::Ready(context))
    }
}
