//! Controller configuration from YAML

use crate::gate::QualityThresholds;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "STAGEGATE_";

/// A credential that never shows up in logs or debug output
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Top-level controller configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Pipeline name, used in logs and history
    pub name: String,

    /// Image registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Model registry settings
    #[serde(default)]
    pub model_registry: ModelRegistryConfig,

    /// Registered model name
    pub model_name: String,

    /// Experiment (namespace) the training runs are logged under
    #[serde(default = "default_experiment")]
    pub experiment: String,

    /// Minimum value per metric; every metric listed is required
    pub quality_gate: QualityThresholds,

    /// Functional validation settings
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Settings for the deployment stage
    #[serde(default)]
    pub deployment: DeploymentConfig,

    /// Shell commands standing in for the external collaborators
    #[serde(default)]
    pub commands: CommandsConfig,

    /// Ownership of running attempts across processes
    #[serde(default)]
    pub lease: LeaseConfig,
}

/// Image registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry endpoint; for the local backend this is a SQLite path
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Image repository name
    #[serde(default = "default_repository")]
    pub repository: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            repository: default_repository(),
        }
    }
}

/// Model registry settings
///
/// The controller keeps model versions and aliases in SQLite: in the state
/// database, or in a separate file when `endpoint` is set. The credentials
/// are handed to the `train` command, which logs its run to the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRegistryConfig {
    /// `sqlite:<path>` or a plain file path
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub token: Option<Secret>,
}

/// Heartbeat settings for Running attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// How often the owning controller refreshes its heartbeat
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which `cancel` may expire an attempt outright
    #[serde(default = "default_lease_timeout")]
    pub timeout_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            timeout_secs: default_lease_timeout(),
        }
    }
}

/// Functional validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Name of the suite passed to the harness
    #[serde(default = "default_suite")]
    pub suite: String,

    /// Port the service under test listens on
    #[serde(default = "default_validation_port")]
    pub port: u16,

    /// Upper bound on waiting for the service to become ready
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    /// Delay between readiness checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Extra environment passed to the service under test
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            suite: default_suite(),
            port: default_validation_port(),
            readiness_timeout_secs: default_readiness_timeout(),
            poll_interval_ms: default_poll_interval(),
            env: BTreeMap::new(),
        }
    }
}

/// Settings for the deployment stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default = "default_deployment_port")]
    pub port: u16,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            port: default_deployment_port(),
            env: BTreeMap::new(),
        }
    }
}

/// Shell commands for the external collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Builds an image; prints its digest
    #[serde(default)]
    pub build: Option<String>,

    /// Trains a model; prints a JSON object of metrics
    #[serde(default)]
    pub train: Option<String>,

    /// Starts the service; runs until killed
    #[serde(default)]
    pub serve: Option<String>,

    /// Runs the validation suite; exit status is the verdict
    #[serde(default)]
    pub suite: Option<String>,

    /// Per-command timeout in seconds
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_experiment() -> String {
    "default".to_string()
}

fn default_repository() -> String {
    "app".to_string()
}

fn default_suite() -> String {
    "smoke".to_string()
}

fn default_validation_port() -> u16 {
    8080
}

fn default_deployment_port() -> u16 {
    80
}

fn default_readiness_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    500
}

fn default_command_timeout() -> u64 {
    3600
}

fn default_heartbeat_interval() -> u64 {
    2000
}

fn default_lease_timeout() -> u64 {
    30
}

/// File path named by a `sqlite:` endpoint or a bare path
fn sqlite_path(endpoint: &str) -> Option<PathBuf> {
    match endpoint.strip_prefix("sqlite:") {
        Some(path) => Some(PathBuf::from(path.trim_start_matches("//"))),
        None if endpoint.contains("://") => None,
        None => Some(PathBuf::from(endpoint)),
    }
}

impl ControllerConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ControllerConfig =
            serde_yaml::from_str(yaml).context("Failed to parse controller config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STAGEGATE_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup, then re-validate
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(endpoint) = var("REGISTRY_ENDPOINT") {
            self.registry.endpoint = Some(endpoint);
        }
        if let Some(endpoint) = var("MODEL_REGISTRY_ENDPOINT") {
            self.model_registry.endpoint = Some(endpoint);
        }
        if let Some(username) = var("MODEL_REGISTRY_USERNAME") {
            self.model_registry.username = Some(username);
        }
        if let Some(token) = var("MODEL_REGISTRY_TOKEN") {
            self.model_registry.token = Some(Secret::new(token));
        }
        if let Some(model_name) = var("MODEL_NAME") {
            self.model_name = model_name;
        }
        if let Some(experiment) = var("EXPERIMENT") {
            self.experiment = experiment;
        }
        for (metric, name) in [("accuracy", "MIN_ACCURACY"), ("precision", "MIN_PRECISION")] {
            if let Some(raw) = var(name) {
                let minimum: f64 = raw
                    .parse()
                    .with_context(|| format!("{}{} is not a number: {}", ENV_PREFIX, name, raw))?;
                self.quality_gate.set(metric, minimum);
            }
        }

        self.validate()
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            bail!("model_name must not be empty");
        }
        if self.quality_gate.is_empty() {
            bail!("quality_gate must configure at least one metric threshold");
        }
        for (metric, minimum) in self.quality_gate.iter() {
            if !minimum.is_finite() || minimum < 0.0 {
                bail!("quality_gate.{} must be a finite, non-negative number", metric);
            }
        }
        if self.validation.readiness_timeout_secs == 0 {
            bail!("validation.readiness_timeout_secs must be greater than zero");
        }
        if self.validation.poll_interval_ms == 0 {
            bail!("validation.poll_interval_ms must be greater than zero");
        }
        if let Some(endpoint) = &self.model_registry.endpoint {
            if sqlite_path(endpoint).is_none() {
                bail!(
                    "model_registry.endpoint '{}' is not supported: \
                     use sqlite:<path> or a file path",
                    endpoint
                );
            }
        }
        if self.lease.heartbeat_interval_ms == 0 {
            bail!("lease.heartbeat_interval_ms must be greater than zero");
        }
        let timeout_ms = self.lease.timeout_secs.saturating_mul(1000);
        if timeout_ms <= self.lease.heartbeat_interval_ms.saturating_mul(2) {
            bail!("lease.timeout_secs must cover at least two heartbeat intervals");
        }
        Ok(())
    }

    /// Separate model registry database, if one is configured
    pub fn model_db_path(&self) -> Option<PathBuf> {
        self.model_registry.endpoint.as_deref().and_then(sqlite_path)
    }

    /// Path of the local state database
    ///
    /// Uses the registry endpoint when it names a SQLite file, otherwise a
    /// file under the user's data directory.
    pub fn state_db_path(&self) -> Result<PathBuf> {
        if let Some(endpoint) = &self.registry.endpoint {
            let path = endpoint.strip_prefix("sqlite:").unwrap_or(endpoint);
            return Ok(PathBuf::from(path));
        }
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        let db_dir = data_dir.join("stagegate");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("Failed to create {}", db_dir.display()))?;
        Ok(db_dir.join(format!("{}.db", self.name)))
    }
}
