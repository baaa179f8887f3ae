//! Shell command collaborators
//!
//! Each collaborator runs a command from the `commands` config section
//! through `sh -c`, passing its inputs as `STAGEGATE_*` environment
//! variables:
//!
//! - build: prints the image digest on its last stdout line
//! - train: prints a JSON object of metric name to value; receives the
//!   model registry endpoint and credentials
//! - serve: runs until killed; ready once the port accepts connections
//! - suite: exit status is the verdict, stderr lines are the failures

use crate::core::config::{CommandsConfig, ModelRegistryConfig};
use crate::core::{ArtifactKind, PipelineError, Revision};
use crate::execution::collaborators::{
    ArtifactBuilder, LaunchSpec, ModelTrainer, ServiceHandle, ServiceLauncher, SuiteReport,
    ValidationHarness,
};
use crate::registry::{ImageManifest, Metrics};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// One configured shell command
#[derive(Debug, Clone)]
pub struct ShellCommand {
    name: &'static str,
    command: Option<String>,
    timeout_secs: u64,
}

impl ShellCommand {
    pub fn new(name: &'static str, command: Option<String>, timeout_secs: u64) -> Self {
        Self {
            name,
            command,
            timeout_secs,
        }
    }

    fn prepare(&self, env: &[(&str, String)]) -> Result<Command, PipelineError> {
        let script = self
            .command
            .as_deref()
            .ok_or_else(|| PipelineError::collaborator(self.name, "no command configured"))?;
        let mut command = Command::new("sh");
        command.arg("-c").arg(script).kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }
        Ok(command)
    }

    /// Run to completion; a non-zero exit is an error
    pub async fn output(&self, env: &[(&str, String)]) -> Result<Output, PipelineError> {
        let output = self.output_unchecked(env).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            warn!("{} exited with code {}: {}", self.name, exit_code, stderr.trim());
            return Err(PipelineError::collaborator(
                self.name,
                format!("exited with code {}: {}", exit_code, stderr.trim()),
            ));
        }
        Ok(output)
    }

    /// Run to completion, leaving the exit status to the caller
    pub async fn output_unchecked(&self, env: &[(&str, String)]) -> Result<Output, PipelineError> {
        let mut command = self.prepare(env)?;
        debug!("Running {} command", self.name);
        timeout(Duration::from_secs(self.timeout_secs), command.output())
            .await
            .map_err(|_| {
                PipelineError::collaborator(
                    self.name,
                    format!("timed out after {}s", self.timeout_secs),
                )
            })?
            .map_err(|e| PipelineError::collaborator(self.name, format!("failed to spawn: {}", e)))
    }

    /// Start without waiting
    ///
    /// With `detached` the child outlives this process.
    pub fn spawn(
        &self,
        env: &[(&str, String)],
        extra_env: &BTreeMap<String, String>,
        detached: bool,
    ) -> Result<Child, PipelineError> {
        let mut command = self.prepare(env)?;
        command
            .envs(extra_env)
            .kill_on_drop(!detached)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        command
            .spawn()
            .map_err(|e| PipelineError::collaborator(self.name, format!("failed to spawn: {}", e)))
    }
}

fn stdout_text(name: &'static str, output: Output) -> Result<String, PipelineError> {
    String::from_utf8(output.stdout)
        .map_err(|e| PipelineError::collaborator(name, format!("output is not UTF-8: {}", e)))
}

/// Builds images with the `build` command
pub struct CommandBuilder {
    command: ShellCommand,
    repository: String,
}

impl CommandBuilder {
    pub fn new(command: ShellCommand, repository: impl Into<String>) -> Self {
        Self {
            command,
            repository: repository.into(),
        }
    }
}

#[async_trait]
impl ArtifactBuilder for CommandBuilder {
    async fn build(
        &self,
        revision: &Revision,
        kind: ArtifactKind,
    ) -> Result<ImageManifest, PipelineError> {
        let output = self
            .command
            .output(&[
                ("STAGEGATE_REVISION", revision.to_string()),
                ("STAGEGATE_IMAGE_KIND", kind.to_string()),
                ("STAGEGATE_REPOSITORY", self.repository.clone()),
            ])
            .await?;
        let stdout = stdout_text("build", output)?;
        let digest = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .ok_or_else(|| PipelineError::collaborator("build", "printed no digest"))?;

        Ok(ImageManifest::new(revision.clone(), digest)
            .with_label("kind", kind.as_str())
            .with_label("repository", self.repository.as_str()))
    }
}

/// Trains models with the `train` command
pub struct CommandTrainer {
    command: ShellCommand,
    registry: ModelRegistryConfig,
}

impl CommandTrainer {
    pub fn new(command: ShellCommand) -> Self {
        Self {
            command,
            registry: ModelRegistryConfig::default(),
        }
    }

    /// Model registry the training run logs to
    pub fn with_registry(mut self, registry: ModelRegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    fn env(
        &self,
        revision: &Revision,
        training_image: &ImageManifest,
        experiment: &str,
    ) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("STAGEGATE_REVISION", revision.to_string()),
            ("STAGEGATE_TRAINING_IMAGE", training_image.digest.clone()),
            ("STAGEGATE_EXPERIMENT", experiment.to_string()),
        ];
        if let Some(endpoint) = &self.registry.endpoint {
            env.push(("STAGEGATE_MODEL_REGISTRY_ENDPOINT", endpoint.clone()));
        }
        if let Some(username) = &self.registry.username {
            env.push(("STAGEGATE_MODEL_REGISTRY_USERNAME", username.clone()));
        }
        if let Some(token) = &self.registry.token {
            env.push(("STAGEGATE_MODEL_REGISTRY_TOKEN", token.expose().to_string()));
        }
        env
    }
}

#[async_trait]
impl ModelTrainer for CommandTrainer {
    async fn train(
        &self,
        revision: &Revision,
        training_image: &ImageManifest,
        experiment: &str,
    ) -> Result<Metrics, PipelineError> {
        let env = self.env(revision, training_image, experiment);
        let output = self.command.output(&env).await?;
        let stdout = stdout_text("train", output)?;

        // Training logs may precede the metrics; the last line carries them.
        let metrics_line = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("");
        serde_json::from_str::<Metrics>(metrics_line)
            .map_err(|e| {
                PipelineError::collaborator(
                    "train",
                    format!("metrics are not a JSON object of numbers: {}", e),
                )
            })
    }
}

/// Starts services with the `serve` command
pub struct CommandLauncher {
    command: ShellCommand,
    running: Mutex<HashMap<String, (Child, u16)>>,
}

impl CommandLauncher {
    pub fn new(command: ShellCommand) -> Self {
        Self {
            command,
            running: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ServiceLauncher for CommandLauncher {
    async fn start(&self, spec: &LaunchSpec) -> Result<ServiceHandle, PipelineError> {
        let mut env = vec![
            ("STAGEGATE_REVISION", spec.image.revision.to_string()),
            ("STAGEGATE_ARTIFACT", spec.artifact.clone()),
            ("STAGEGATE_IMAGE_DIGEST", spec.image.digest.clone()),
            ("PORT", spec.port.to_string()),
        ];
        if let Some(model) = &spec.model {
            env.push(("STAGEGATE_MODEL_NAME", model.name.clone()));
            env.push(("STAGEGATE_MODEL_VERSION", model.version.to_string()));
        }
        let child = self.command.spawn(&env, &spec.env, spec.keep_running)?;
        debug!("Spawned serve for {} on port {}", spec.target(), spec.port);

        let id = format!("serve-{}", Uuid::new_v4());
        self.running.lock().await.insert(id.clone(), (child, spec.port));
        Ok(ServiceHandle {
            id,
            endpoint: format!("http://127.0.0.1:{}", spec.port),
        })
    }

    async fn is_ready(&self, handle: &ServiceHandle) -> bool {
        let port = {
            let mut running = self.running.lock().await;
            match running.get_mut(&handle.id) {
                Some((child, port)) => {
                    if let Ok(Some(status)) = child.try_wait() {
                        warn!("{} exited early with {}", handle.id, status);
                        return false;
                    }
                    *port
                }
                None => return false,
            }
        };
        matches!(
            timeout(Duration::from_secs(1), TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), PipelineError> {
        let entry = self.running.lock().await.remove(&handle.id);
        match entry {
            Some((mut child, _)) => child
                .kill()
                .await
                .map_err(|e| {
                    let reason = format!("failed to stop {}: {}", handle.id, e);
                    PipelineError::collaborator("serve", reason)
                }),
            None => Ok(()),
        }
    }
}

/// Runs the `suite` command
pub struct CommandHarness {
    command: ShellCommand,
}

impl CommandHarness {
    pub fn new(command: ShellCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl ValidationHarness for CommandHarness {
    async fn run_suite(&self, endpoint: &str, suite: &str) -> Result<SuiteReport, PipelineError> {
        let output = self
            .command
            .output_unchecked(&[
                ("STAGEGATE_ENDPOINT", endpoint.to_string()),
                ("STAGEGATE_SUITE", suite.to_string()),
            ])
            .await?;
        if output.status.success() {
            return Ok(SuiteReport::passed());
        }

        let mut failures: Vec<String> = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        if failures.is_empty() {
            failures.push(format!("suite exited with code {}", output.status.code().unwrap_or(-1)));
        }
        Ok(SuiteReport::failed(failures))
    }
}

/// All four shell collaborators built from config
pub struct ShellCollaborators {
    pub builder: CommandBuilder,
    pub trainer: CommandTrainer,
    pub launcher: CommandLauncher,
    pub harness: CommandHarness,
}

impl ShellCollaborators {
    pub fn from_config(
        commands: &CommandsConfig,
        repository: &str,
        model_registry: &ModelRegistryConfig,
    ) -> Self {
        let command = |name, script: &Option<String>| {
            ShellCommand::new(name, script.clone(), commands.timeout_secs)
        };
        Self {
            builder: CommandBuilder::new(command("build", &commands.build), repository),
            trainer: CommandTrainer::new(command("train", &commands.train))
                .with_registry(model_registry.clone()),
            launcher: CommandLauncher::new(command("serve", &commands.serve)),
            harness: CommandHarness::new(command("suite", &commands.suite)),
        }
    }
}
