//! Pipeline controller - runs stage bodies and chains completions
//!
//! Every stage reaches the controller as a [`StageInvocation`] from the
//! dispatcher. The controller runs the stage body, records the outcome
//! through the state machine and hands back the completion event that may
//! trigger the next stage.

use crate::core::config::ControllerConfig;
use crate::core::{
    ArtifactKind, Environment, PipelineError, ResourceKind, Revision, Stage, StageAttempt,
    StageContext, StageError, StageStatus, TriggerSource,
};
use crate::execution::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::execution::collaborators::{
    ArtifactBuilder, LaunchSpec, ModelTrainer, ServiceHandle, ServiceLauncher, ValidationHarness,
};
use crate::execution::dispatcher::{Conclusion, StageDispatcher, StageInvocation, UpstreamEvent};
use crate::execution::events::{ControllerEvent, EventBus};
use crate::execution::machine::{CancelRequest, PipelineStateMachine, DEFAULT_LEASE_TIMEOUT};
use crate::execution::validation::{wait_until_ready, ValidationRunner, ValidationSettings};
use crate::gate::{QualityGate, QualityGateResult, QualityThresholds};
use crate::persistence::AuditLog;
use crate::promotion::{PromotionEngine, PromotionResult, PromotionSource};
use crate::registry::{image_version, ModelVersion, RegistryError, RegistrySet};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The external collaborators a controller drives
#[derive(Clone)]
pub struct Collaborators {
    pub builder: Arc<dyn ArtifactBuilder>,
    pub trainer: Arc<dyn ModelTrainer>,
    pub launcher: Arc<dyn ServiceLauncher>,
    pub harness: Arc<dyn ValidationHarness>,
}

/// Controller parameters taken from configuration
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub experiment: String,
    pub thresholds: QualityThresholds,
    pub validation: ValidationSettings,
    pub deployment_port: u16,
    pub deployment_env: BTreeMap<String, String>,
    pub lease: LeaseSettings,
}

impl From<&ControllerConfig> for ControllerSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            experiment: config.experiment.clone(),
            thresholds: config.quality_gate.clone(),
            validation: ValidationSettings::from(&config.validation),
            deployment_port: config.deployment.port,
            deployment_env: config.deployment.env.clone(),
            lease: LeaseSettings {
                heartbeat_interval: Duration::from_millis(config.lease.heartbeat_interval_ms),
                timeout: Duration::from_secs(config.lease.timeout_secs),
            },
        }
    }
}

/// Heartbeat cadence for owned attempts
#[derive(Debug, Clone, Copy)]
pub struct LeaseSettings {
    pub heartbeat_interval: Duration,
    pub timeout: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }
}

/// What a completed stage attempt produced
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub context: StageContext,
    pub attempt: StageAttempt,
    pub gate: Option<QualityGateResult>,
    pub promotion: Option<PromotionResult>,
    /// Instance left running by the deployment stage
    pub service: Option<ServiceHandle>,
}

impl StageOutcome {
    pub fn stage(&self) -> Stage {
        self.context.stage
    }

    pub fn revision(&self) -> &Revision {
        &self.context.revision
    }

    pub fn succeeded(&self) -> bool {
        self.attempt.status == StageStatus::Succeeded
    }

    /// Completion notice describing this attempt
    pub fn completion_event(&self) -> UpstreamEvent {
        let conclusion = match self.attempt.status {
            StageStatus::Succeeded => Conclusion::Success,
            StageStatus::Cancelled => Conclusion::Cancelled,
            _ => Conclusion::Failure,
        };
        UpstreamEvent {
            upstream_stage: self.stage(),
            conclusion,
            revision: self.revision().clone(),
        }
    }

    /// Event that triggers the next stage
    ///
    /// Manual dispatches never re-trigger downstream stages on their own.
    pub fn downstream_event(&self) -> Option<UpstreamEvent> {
        if self.succeeded() && self.attempt.trigger != TriggerSource::ManualDispatch {
            Some(self.completion_event())
        } else {
            None
        }
    }
}

#[derive(Default)]
struct StageWork {
    versions: BTreeMap<ResourceKind, String>,
    gate: Option<QualityGateResult>,
    promotion: Option<PromotionResult>,
    service: Option<ServiceHandle>,
}

/// Run `work` unless cancellation arrives first
async fn guarded<T, F>(cancel: &CancelSignal, work: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    let mut cancel = cancel.clone();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = work => result,
    }
}

fn check_cancelled(cancel: &CancelSignal) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

fn parse_model_version(version: &str) -> Result<u64, PipelineError> {
    version.parse().map_err(|_| {
        PipelineError::Registry(RegistryError::InvalidVersion {
            kind: ResourceKind::Model,
            version: version.to_string(),
        })
    })
}

const SERVING: ResourceKind = ResourceKind::Artifact(ArtifactKind::Serving);

pub struct PipelineController {
    registries: RegistrySet,
    promotion: PromotionEngine,
    gate: QualityGate,
    machine: Arc<PipelineStateMachine>,
    dispatcher: StageDispatcher,
    collaborators: Collaborators,
    validation: ValidationRunner,
    settings: ControllerSettings,
    events: EventBus,
    cancels: Mutex<HashMap<Uuid, Arc<CancelHandle>>>,
}

impl PipelineController {
    pub fn new(
        settings: ControllerSettings,
        registries: RegistrySet,
        collaborators: Collaborators,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        let machine =
            Arc::new(PipelineStateMachine::new(audit).with_lease_timeout(settings.lease.timeout));
        let validation = ValidationRunner::new(
            collaborators.launcher.clone(),
            collaborators.harness.clone(),
            settings.validation.clone(),
        );
        Self {
            promotion: registries.promotion_engine(),
            gate: QualityGate::new(settings.thresholds.clone()),
            dispatcher: StageDispatcher::new(registries.clone(), machine.clone()),
            registries,
            machine,
            collaborators,
            validation,
            settings,
            events: EventBus::new(),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(ControllerEvent) + Send + Sync + 'static,
    {
        self.events.add_handler(handler);
    }

    pub fn machine(&self) -> &Arc<PipelineStateMachine> {
        &self.machine
    }

    pub fn promotion(&self) -> &PromotionEngine {
        &self.promotion
    }

    pub fn registries(&self) -> &RegistrySet {
        &self.registries
    }

    /// A source push: run the build stage
    pub async fn on_push(&self, revision: Revision) -> Result<StageOutcome, StageError> {
        let invocation = self
            .dispatcher
            .on_push(revision.clone())
            .await
            .map_err(|e| StageError::new(Stage::Build, revision, e))?;
        self.execute(invocation).await
    }

    /// An upstream completion; runs the successor stage if one is due
    pub async fn handle_event(
        &self,
        event: &UpstreamEvent,
    ) -> Result<Option<StageOutcome>, StageError> {
        let stage = event.upstream_stage.successor().unwrap_or(event.upstream_stage);
        let invocation = self
            .dispatcher
            .on_upstream_event(event)
            .await
            .map_err(|e| StageError::new(stage, event.revision.clone(), e))?;

        match invocation {
            Some(invocation) => self.execute(invocation).await.map(Some),
            None => {
                let succeeded = event.conclusion == Conclusion::Success;
                if succeeded && event.upstream_stage.successor().is_some() {
                    self.events.emit(ControllerEvent::StageSkipped {
                        stage,
                        revision: event.revision.clone(),
                        reason: "candidate superseded".to_string(),
                    });
                }
                Ok(None)
            }
        }
    }

    /// Operator-requested run of one stage
    pub async fn dispatch_manual(
        &self,
        stage: Stage,
        revision: Option<Revision>,
    ) -> Result<StageOutcome, StageError> {
        let invocation = self
            .dispatcher
            .dispatch_manual(stage, revision.clone())
            .await
            .map_err(|e| match revision {
                Some(revision) => StageError::new(stage, revision, e),
                None => StageError::unresolved(stage, e),
            })?;
        self.execute(invocation).await
    }

    /// Keep handling completions until the chain stops
    pub async fn follow(&self, event: UpstreamEvent) -> Result<Vec<StageOutcome>, StageError> {
        let mut outcomes = Vec::new();
        let mut next = Some(event);
        while let Some(event) = next.take() {
            if let Some(outcome) = self.handle_event(&event).await? {
                next = outcome.downstream_event();
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    /// Build a revision and carry it as far down the chain as it goes
    pub async fn run_revision(&self, revision: Revision) -> Result<Vec<StageOutcome>, StageError> {
        let build = self.on_push(revision).await?;
        let next = build.downstream_event();
        let mut outcomes = vec![build];
        if let Some(event) = next {
            outcomes.extend(self.follow(event).await?);
        }
        Ok(outcomes)
    }

    /// Cancel a Running attempt
    ///
    /// An attempt running in this process is signalled directly. For one
    /// owned elsewhere a cancel request is recorded, which the owner picks
    /// up on its next heartbeat. Either way the owner records its own
    /// Cancelled status, and only before promotion. An attempt whose owner
    /// stopped heartbeating is marked Cancelled outright.
    pub async fn cancel(&self, attempt_id: Uuid) -> Result<CancelRequest, PipelineError> {
        let local = {
            let cancels = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
            cancels.get(&attempt_id).map(|handle| handle.cancel()).is_some()
        };
        if local {
            info!("Cancellation requested for attempt {}", attempt_id);
            return Ok(CancelRequest::Requested);
        }
        self.machine.cancel(attempt_id).await
    }

    /// Run the stage body, heartbeating its attempt until it returns
    async fn run_owned(
        &self,
        attempt_id: Uuid,
        ctx: &StageContext,
        handle: &CancelHandle,
        signal: &CancelSignal,
        work: &mut StageWork,
    ) -> Result<(), PipelineError> {
        let body = self.run_stage(ctx, signal, work);
        tokio::pin!(body);
        let mut ticker = tokio::time::interval(self.settings.lease.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut body => return result,
                _ = ticker.tick() => match self.machine.heartbeat(attempt_id).await {
                    Ok(true) if !signal.is_cancelled() => {
                        info!("{} for {}: cancel requested by operator", ctx.stage, ctx.revision);
                        handle.cancel();
                    }
                    Ok(_) => debug!("heartbeat for attempt {}", attempt_id),
                    Err(e) => warn!("Heartbeat for attempt {} failed: {}", attempt_id, e),
                },
            }
        }
    }

    async fn execute(&self, invocation: StageInvocation) -> Result<StageOutcome, StageError> {
        let mut invocation = invocation;
        let stage = invocation.stage();
        let revision = invocation.revision().clone();
        let attempt_id = invocation.attempt.id;

        let (handle, signal) = cancel_pair();
        let handle = Arc::new(handle);
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(attempt_id, handle.clone());

        self.events.emit(ControllerEvent::StageStarted {
            stage,
            revision: revision.clone(),
            attempt: invocation.attempt.attempt,
            trigger: invocation.trigger,
        });

        let mut work = StageWork::default();
        let result = self
            .run_owned(attempt_id, &invocation.context, &handle, &signal, &mut work)
            .await;

        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&attempt_id);

        let (status, detail) = match &result {
            Ok(()) => (StageStatus::Succeeded, None),
            Err(PipelineError::Cancelled) => {
                (StageStatus::Cancelled, Some(PipelineError::Cancelled.to_string()))
            }
            Err(e) => (StageStatus::Failed, Some(e.to_string())),
        };

        let mut versions = invocation.context.versions.clone();
        versions.extend(work.versions);
        invocation.attempt.versions = versions
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.machine
            .finish(&mut invocation.attempt, status, detail)
            .await
            .map_err(|e| StageError::new(stage, revision.clone(), e))?;

        if let Err(e) = result {
            match &e {
                PipelineError::Cancelled => {
                    warn!("{} cancelled for {}", stage, revision);
                    self.events.emit(ControllerEvent::StageCancelled {
                        stage,
                        revision: revision.clone(),
                    });
                }
                _ => {
                    if e.requires_operator() {
                        error!("{} for {} needs manual remediation: {}", stage, revision, e);
                    } else {
                        warn!("{} failed for {}: {}", stage, revision, e);
                    }
                    self.events.emit(ControllerEvent::StageFailed {
                        stage,
                        revision: revision.clone(),
                        error: e.to_string(),
                        requires_operator: e.requires_operator(),
                    });
                }
            }
            return Err(StageError::new(stage, revision, e));
        }

        let outcome = StageOutcome {
            context: invocation.context.clone(),
            attempt: invocation.attempt.clone(),
            gate: work.gate,
            promotion: work.promotion,
            service: work.service,
        };
        if outcome.succeeded() {
            info!("{} succeeded for {}", stage, revision);
            self.events.emit(ControllerEvent::StageSucceeded {
                stage,
                revision,
                next_stage: outcome.downstream_event().and_then(|e| e.upstream_stage.successor()),
            });
        }
        Ok(outcome)
    }

    async fn run_stage(
        &self,
        ctx: &StageContext,
        cancel: &CancelSignal,
        work: &mut StageWork,
    ) -> Result<(), PipelineError> {
        match ctx.stage {
            Stage::Build => self.build(ctx, cancel, work).await,
            Stage::Delivery => self.deliver(ctx, cancel, work).await,
            Stage::Staging => self.stage_release(ctx, cancel, work).await,
            Stage::Deployment => self.deploy(ctx, cancel, work).await,
        }
    }

    fn step(&self, stage: Stage, step: impl Into<String>) {
        self.events.emit(ControllerEvent::StepStarted {
            stage,
            step: step.into(),
        });
    }

    /// Build and push both images for the revision
    async fn build(
        &self,
        ctx: &StageContext,
        cancel: &CancelSignal,
        work: &mut StageWork,
    ) -> Result<(), PipelineError> {
        let version = image_version(&ctx.revision);
        for kind in ArtifactKind::ALL {
            self.step(ctx.stage, format!("build {} image", kind));
            let manifest =
                guarded(cancel, self.collaborators.builder.build(&ctx.revision, kind)).await?;
            check_cancelled(cancel)?;
            self.registries.images(kind).push(&version, manifest).await?;
            work.versions.insert(ResourceKind::Artifact(kind), version.clone());
        }
        Ok(())
    }

    /// Train, gate, validate, promote to staging
    async fn deliver(
        &self,
        ctx: &StageContext,
        cancel: &CancelSignal,
        work: &mut StageWork,
    ) -> Result<(), PipelineError> {
        let training_version = ctx.require(ResourceKind::Artifact(ArtifactKind::Training))?;
        let serving_version = ctx.require(SERVING)?;

        self.step(ctx.stage, "train model");
        let training_image = self
            .registries
            .images(ArtifactKind::Training)
            .pull(training_version)
            .await?;
        let metrics = guarded(
            cancel,
            self.collaborators
                .trainer
                .train(&ctx.revision, &training_image, &self.settings.experiment),
        )
        .await?;
        check_cancelled(cancel)?;

        let model = self
            .registries
            .models()
            .register(self.registries.model_name(), &ctx.revision, metrics)
            .await?;
        info!(
            "Registered {} version {} for {}",
            model.name, model.version, ctx.revision
        );
        work.versions.insert(ResourceKind::Model, model.version.to_string());

        self.check_gate(ctx.stage, model.version, work).await?;
        self.validate_candidate(ctx.stage, serving_version, &model, cancel).await?;
        check_cancelled(cancel)?;

        let versions: BTreeMap<ResourceKind, String> = [
            (ResourceKind::Model, model.version.to_string()),
            (SERVING, serving_version.to_string()),
        ]
        .into_iter()
        .collect();
        self.promote(
            ctx.stage,
            PromotionSource::Versions {
                from: Environment::Commit,
                versions,
            },
            Environment::Staging,
            work,
        )
        .await
    }

    /// Re-gate and re-validate what staging holds, promote it to production
    async fn stage_release(
        &self,
        ctx: &StageContext,
        cancel: &CancelSignal,
        work: &mut StageWork,
    ) -> Result<(), PipelineError> {
        let model_version = parse_model_version(ctx.require(ResourceKind::Model)?)?;
        let serving_version = ctx.require(SERVING)?;

        self.check_gate(ctx.stage, model_version, work).await?;
        let model = self
            .registries
            .models()
            .get_version(self.registries.model_name(), model_version)
            .await?;
        self.validate_candidate(ctx.stage, serving_version, &model, cancel).await?;
        check_cancelled(cancel)?;

        self.promote(
            ctx.stage,
            PromotionSource::Versions {
                from: Environment::Staging,
                versions: ctx.versions.clone(),
            },
            Environment::Production,
            work,
        )
        .await
    }

    /// Instantiate what production holds and leave it running
    async fn deploy(
        &self,
        ctx: &StageContext,
        cancel: &CancelSignal,
        work: &mut StageWork,
    ) -> Result<(), PipelineError> {
        let model_version = parse_model_version(ctx.require(ResourceKind::Model)?)?;
        let serving_version = ctx.require(SERVING)?;

        self.step(ctx.stage, "start production service");
        let image = self.registries.images(ArtifactKind::Serving).pull(serving_version).await?;
        let model = self
            .registries
            .models()
            .get_version(self.registries.model_name(), model_version)
            .await?;
        check_cancelled(cancel)?;

        let spec = LaunchSpec {
            artifact: serving_version.to_string(),
            image,
            model: Some(model),
            port: self.settings.deployment_port,
            env: self.settings.deployment_env.clone(),
            keep_running: true,
        };
        let launcher = self.collaborators.launcher.as_ref();
        let handle = launcher.start(&spec).await?;
        let ready = wait_until_ready(
            launcher,
            &handle,
            self.settings.validation.readiness_timeout,
            self.settings.validation.poll_interval,
        )
        .await;
        if !ready {
            if let Err(e) = launcher.stop(&handle).await {
                warn!("Failed to stop {}: {}", handle.id, e);
            }
            return Err(PipelineError::ReadinessTimeout {
                target: spec.target(),
                timeout_secs: self.settings.validation.readiness_timeout.as_secs(),
            });
        }

        info!("{} serving at {}", spec.target(), handle.endpoint);
        work.service = Some(handle);
        Ok(())
    }

    async fn check_gate(
        &self,
        stage: Stage,
        version: u64,
        work: &mut StageWork,
    ) -> Result<(), PipelineError> {
        self.step(stage, "quality gate");
        let result = self
            .gate
            .check(self.registries.models().as_ref(), self.registries.model_name(), version)
            .await?;
        self.events.emit(ControllerEvent::GateEvaluated {
            stage,
            result: result.clone(),
        });
        work.gate = Some(result.clone());
        result.into_result().map(|_| ())
    }

    async fn validate_candidate(
        &self,
        stage: Stage,
        serving_version: &str,
        model: &ModelVersion,
        cancel: &CancelSignal,
    ) -> Result<(), PipelineError> {
        self.step(stage, format!("validation suite '{}'", self.validation.settings().suite));
        let image = self
            .registries
            .images(ArtifactKind::Serving)
            .pull(serving_version)
            .await?;
        let spec = LaunchSpec {
            artifact: serving_version.to_string(),
            image,
            model: Some(model.clone()),
            port: self.validation.settings().port,
            env: self.validation.settings().env.clone(),
            keep_running: false,
        };

        let result = self.validation.validate(&spec, cancel).await;
        let failures = match &result {
            Ok(report) => Some(report.failures.clone()),
            Err(PipelineError::ValidationFailed { failures, .. }) => Some(failures.clone()),
            Err(_) => None,
        };
        if let Some(failures) = failures {
            self.events.emit(ControllerEvent::ValidationFinished {
                stage,
                target: spec.target(),
                passed: result.is_ok(),
                failures,
            });
        }
        result.map(|_| ())
    }

    /// The promotion step runs to completion once started
    async fn promote(
        &self,
        stage: Stage,
        source: PromotionSource,
        to: Environment,
        work: &mut StageWork,
    ) -> Result<(), PipelineError> {
        self.step(stage, format!("promote to {}", to));
        let result = self
            .promotion
            .promote(&source, to, &ResourceKind::release_set())
            .await?;
        self.events.emit(ControllerEvent::Promoted {
            stage,
            result: result.clone(),
        });
        work.promotion = Some(result);
        Ok(())
    }
}
