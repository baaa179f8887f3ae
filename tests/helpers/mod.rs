//! Test fixtures for stagegate scenarios
//!
//! Mock collaborators return scripted results and count their calls. The
//! flaky registries wrap the in-memory ones and fail alias writes on demand.

#![allow(dead_code)]

use async_trait::async_trait;
use stagegate::core::{
    ArtifactKind, PipelineError, ResourceKind, Revision, Stage, StageAttempt, StageStatus,
};
use stagegate::execution::{
    ArtifactBuilder, Collaborators, ControllerSettings, LaunchSpec, LeaseSettings, ModelTrainer,
    ServiceHandle, ServiceLauncher, SuiteReport, ValidationHarness, ValidationSettings,
};
use stagegate::persistence::{AuditLog, InMemoryAuditLog};
use stagegate::registry::{
    AliasRegistry, ImageManifest, MemoryImageRegistry, MemoryModelRegistry, Metrics, ModelRegistry,
    ModelVersion, RegistryClient, RegistryError, RegistryResult, RegistrySet,
};
use stagegate::{ControllerEvent, PipelineController, QualityThresholds};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const REPOSITORY: &str = "churn";
pub const MODEL_NAME: &str = "churn-classifier";

pub fn rev(id: &str) -> Revision {
    Revision::new(id).unwrap()
}

pub fn metrics(values: &[(&str, f64)]) -> Metrics {
    values.iter().map(|(name, value)| (name.to_string(), *value)).collect()
}

/// Scenario A metrics: clear both thresholds
pub fn passing_metrics() -> Metrics {
    metrics(&[("accuracy", 0.95), ("precision", 0.93)])
}

/// Scenario B metrics: accuracy below threshold
pub fn failing_metrics() -> Metrics {
    metrics(&[("accuracy", 0.85), ("precision", 0.88)])
}

pub fn thresholds() -> QualityThresholds {
    QualityThresholds::new()
        .require("accuracy", 0.90)
        .require("precision", 0.85)
}

pub const SERVING: ResourceKind = ResourceKind::Artifact(ArtifactKind::Serving);

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Builder that returns a digest derived from the revision
#[derive(Default)]
pub struct MockBuilder {
    pub calls: AtomicUsize,
    delay: Option<Duration>,
}

#[async_trait]
impl ArtifactBuilder for MockBuilder {
    async fn build(
        &self,
        revision: &Revision,
        kind: ArtifactKind,
    ) -> Result<ImageManifest, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ImageManifest::new(revision.clone(), format!("sha256:{}-{}", kind, revision)))
    }
}

/// Trainer that reports the same metrics for every run
pub struct MockTrainer {
    pub calls: AtomicUsize,
    metrics: Metrics,
}

#[async_trait]
impl ModelTrainer for MockTrainer {
    async fn train(
        &self,
        _revision: &Revision,
        _training_image: &ImageManifest,
        _experiment: &str,
    ) -> Result<Metrics, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.metrics.clone())
    }
}

/// Launcher whose instances are ready immediately
#[derive(Default)]
pub struct MockLauncher {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub launched: Mutex<Vec<LaunchSpec>>,
}

impl MockLauncher {
    pub fn running(&self) -> usize {
        self.starts.load(Ordering::SeqCst) - self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceLauncher for MockLauncher {
    async fn start(&self, spec: &LaunchSpec) -> Result<ServiceHandle, PipelineError> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        self.launched.lock().unwrap().push(spec.clone());
        Ok(ServiceHandle {
            id: format!("svc-{}", n),
            endpoint: format!("http://127.0.0.1:{}", spec.port),
        })
    }

    async fn is_ready(&self, _handle: &ServiceHandle) -> bool {
        true
    }

    async fn stop(&self, _handle: &ServiceHandle) -> Result<(), PipelineError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Validation suite with a scripted verdict
pub struct MockSuite {
    pub runs: AtomicUsize,
    report: SuiteReport,
    delay: Option<Duration>,
}

#[async_trait]
impl ValidationHarness for MockSuite {
    async fn run_suite(&self, _endpoint: &str, _suite: &str) -> Result<SuiteReport, PipelineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.report.clone())
    }
}

// ---------------------------------------------------------------------------
// Flaky registries
// ---------------------------------------------------------------------------

/// Order in which aliases were written, as "kind:alias"
pub type TagLog = Arc<Mutex<Vec<String>>>;

/// Image registry whose alias tags can be made to fail
pub struct FlakyImageRegistry {
    inner: MemoryImageRegistry,
    log: TagLog,
    pub fail_tags: AtomicBool,
}

impl FlakyImageRegistry {
    pub fn new(kind: ArtifactKind, log: TagLog) -> Self {
        Self {
            inner: MemoryImageRegistry::new(REPOSITORY, kind),
            log,
            fail_tags: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl AliasRegistry for FlakyImageRegistry {
    fn kind(&self) -> ResourceKind {
        self.inner.kind()
    }

    async fn tag_alias(&self, version: &str, alias: &str) -> RegistryResult<Option<String>> {
        if self.fail_tags.load(Ordering::SeqCst) {
            return Err(RegistryError::backend(self.kind(), "registry unavailable"));
        }
        self.log.lock().unwrap().push(format!("{}:{}", self.kind(), alias));
        self.inner.tag_alias(version, alias).await
    }

    async fn remove_alias(&self, alias: &str) -> RegistryResult<()> {
        self.inner.remove_alias(alias).await
    }

    async fn resolve_alias(&self, alias: &str) -> RegistryResult<Option<String>> {
        self.inner.resolve_alias(alias).await
    }

    async fn lineage(&self, version: &str) -> RegistryResult<Revision> {
        self.inner.lineage(version).await
    }

    async fn find_by_revision(&self, revision: &Revision) -> RegistryResult<Option<String>> {
        self.inner.find_by_revision(revision).await
    }

    async fn latest(&self) -> RegistryResult<Option<String>> {
        self.inner.latest().await
    }
}

#[async_trait]
impl RegistryClient for FlakyImageRegistry {
    type Payload = ImageManifest;

    async fn push(&self, version: &str, payload: ImageManifest) -> RegistryResult<()> {
        self.inner.push(version, payload).await
    }

    async fn pull(&self, version_or_alias: &str) -> RegistryResult<ImageManifest> {
        self.inner.pull(version_or_alias).await
    }
}

/// Model registry whose alias writes can be made to fail
pub struct FlakyModelRegistry {
    inner: MemoryModelRegistry,
    log: TagLog,
    pub fail_alias_writes: AtomicBool,
    pub fail_alias_deletes: AtomicBool,
}

impl FlakyModelRegistry {
    pub fn new(log: TagLog) -> Self {
        Self {
            inner: MemoryModelRegistry::new(),
            log,
            fail_alias_writes: AtomicBool::new(false),
            fail_alias_deletes: AtomicBool::new(false),
        }
    }

    fn unavailable() -> RegistryError {
        RegistryError::backend(ResourceKind::Model, "model registry unavailable")
    }
}

#[async_trait]
impl ModelRegistry for FlakyModelRegistry {
    async fn register(
        &self,
        model_name: &str,
        revision: &Revision,
        metrics: Metrics,
    ) -> RegistryResult<ModelVersion> {
        self.inner.register(model_name, revision, metrics).await
    }

    async fn import(&self, model: ModelVersion) -> RegistryResult<()> {
        self.inner.import(model).await
    }

    async fn get_version(&self, model_name: &str, version: u64) -> RegistryResult<ModelVersion> {
        self.inner.get_version(model_name, version).await
    }

    async fn set_alias(
        &self,
        model_name: &str,
        version: u64,
        alias: &str,
    ) -> RegistryResult<Option<u64>> {
        if self.fail_alias_writes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.log.lock().unwrap().push(format!("model:{}", alias));
        self.inner.set_alias(model_name, version, alias).await
    }

    async fn delete_alias(&self, model_name: &str, alias: &str) -> RegistryResult<()> {
        if self.fail_alias_deletes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.delete_alias(model_name, alias).await
    }

    async fn resolve_alias(&self, model_name: &str, alias: &str) -> RegistryResult<Option<u64>> {
        self.inner.resolve_alias(model_name, alias).await
    }

    async fn latest_for_revision(
        &self,
        model_name: &str,
        revision: &Revision,
    ) -> RegistryResult<Option<u64>> {
        self.inner.latest_for_revision(model_name, revision).await
    }

    async fn latest_version(&self, model_name: &str) -> RegistryResult<Option<u64>> {
        self.inner.latest_version(model_name).await
    }
}

/// Registries with failure injection on the serving image and the model
pub struct FlakyRegistries {
    pub set: RegistrySet,
    pub serving: Arc<FlakyImageRegistry>,
    pub models: Arc<FlakyModelRegistry>,
    pub log: TagLog,
}

pub fn flaky_registries() -> FlakyRegistries {
    let log: TagLog = Arc::new(Mutex::new(Vec::new()));
    let training = Arc::new(FlakyImageRegistry::new(ArtifactKind::Training, log.clone()));
    let serving = Arc::new(FlakyImageRegistry::new(ArtifactKind::Serving, log.clone()));
    let models = Arc::new(FlakyModelRegistry::new(log.clone()));
    let set = RegistrySet::new(training, serving.clone(), models.clone(), MODEL_NAME);
    FlakyRegistries {
        set,
        serving,
        models,
        log,
    }
}

// ---------------------------------------------------------------------------
// Controller fixture
// ---------------------------------------------------------------------------

/// A controller over in-memory state with mock collaborators
pub struct Fixture {
    pub controller: PipelineController,
    pub registries: RegistrySet,
    pub audit: Arc<InMemoryAuditLog>,
    pub builder: Arc<MockBuilder>,
    pub trainer: Arc<MockTrainer>,
    pub launcher: Arc<MockLauncher>,
    pub suite: Arc<MockSuite>,
    pub events: Arc<Mutex<Vec<ControllerEvent>>>,
}

pub struct FixtureBuilder {
    metrics: Metrics,
    report: SuiteReport,
    build_delay: Option<Duration>,
    suite_delay: Option<Duration>,
    registries: Option<RegistrySet>,
    audit: Option<Arc<InMemoryAuditLog>>,
    heartbeat: Duration,
}

impl FixtureBuilder {
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn suite_failures(mut self, failures: &[&str]) -> Self {
        self.report = SuiteReport::failed(failures.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    pub fn suite_delay(mut self, delay: Duration) -> Self {
        self.suite_delay = Some(delay);
        self
    }

    pub fn registries(mut self, registries: RegistrySet) -> Self {
        self.registries = Some(registries);
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    /// Share an audit log with another controller, as two processes would
    pub fn audit(mut self, audit: Arc<InMemoryAuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> Fixture {
        let registries = self
            .registries
            .unwrap_or_else(|| RegistrySet::in_memory(REPOSITORY, MODEL_NAME));
        let audit = self.audit.unwrap_or_else(|| Arc::new(InMemoryAuditLog::new()));
        let builder = Arc::new(MockBuilder {
            calls: AtomicUsize::new(0),
            delay: self.build_delay,
        });
        let trainer = Arc::new(MockTrainer {
            calls: AtomicUsize::new(0),
            metrics: self.metrics,
        });
        let launcher = Arc::new(MockLauncher::default());
        let suite = Arc::new(MockSuite {
            runs: AtomicUsize::new(0),
            report: self.report,
            delay: self.suite_delay,
        });

        let collaborators = Collaborators {
            builder: builder.clone(),
            trainer: trainer.clone(),
            launcher: launcher.clone(),
            harness: suite.clone(),
        };
        let audit_log: Arc<dyn AuditLog> = audit.clone();
        let mut controller = PipelineController::new(
            ControllerSettings {
                lease: LeaseSettings {
                    heartbeat_interval: self.heartbeat,
                    ..settings().lease
                },
                ..settings()
            },
            registries.clone(),
            collaborators,
            audit_log,
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        controller.add_event_handler(move |event| sink.lock().unwrap().push(event));

        Fixture {
            controller,
            registries,
            audit,
            builder,
            trainer,
            launcher,
            suite,
            events,
        }
    }
}

pub fn fixture() -> FixtureBuilder {
    FixtureBuilder {
        metrics: passing_metrics(),
        report: SuiteReport::passed(),
        build_delay: None,
        suite_delay: None,
        registries: None,
        audit: None,
        heartbeat: settings().lease.heartbeat_interval,
    }
}

pub fn settings() -> ControllerSettings {
    ControllerSettings {
        experiment: "churn-exp".to_string(),
        thresholds: thresholds(),
        validation: ValidationSettings {
            suite: "smoke".to_string(),
            port: 9000,
            readiness_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(5),
            env: BTreeMap::new(),
        },
        deployment_port: 8080,
        deployment_env: BTreeMap::new(),
        lease: LeaseSettings {
            heartbeat_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(30),
        },
    }
}

impl Fixture {
    /// Version currently holding `alias` for `kind`
    pub async fn alias(&self, kind: ResourceKind, alias: &str) -> Option<String> {
        self.registries.aliases(kind).resolve_alias(alias).await.unwrap()
    }

    /// Revision currently holding `alias` for `kind`
    pub async fn alias_lineage(&self, kind: ResourceKind, alias: &str) -> Option<Revision> {
        let registry = self.registries.aliases(kind);
        match registry.resolve_alias(alias).await.unwrap() {
            Some(version) => Some(registry.lineage(&version).await.unwrap()),
            None => None,
        }
    }

    pub async fn attempts(&self, revision: &Revision, stage: Stage) -> Vec<StageAttempt> {
        self.audit
            .attempts_for_revision(revision)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.stage == stage)
            .collect()
    }

    pub async fn status(&self, revision: &Revision, stage: Stage) -> StageStatus {
        self.controller
            .machine()
            .run(revision)
            .await
            .unwrap()
            .stage_status(stage)
    }

    pub fn recorded_events(&self) -> Vec<ControllerEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until the validation suite is running for `stage`, returning its attempt
    pub async fn running_in_validation(&self, stage: Stage) -> StageAttempt {
        let wait = async {
            loop {
                if self.suite.runs.load(Ordering::SeqCst) > 0 {
                    let running = self.audit.running_attempts().await.unwrap();
                    if let Some(attempt) = running.into_iter().find(|a| a.stage == stage) {
                        return attempt;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("validation never started")
    }
}
