//! Functional validation of a candidate service

use crate::core::config::ValidationConfig;
use crate::core::PipelineError;
use crate::execution::cancel::CancelSignal;
use crate::execution::collaborators::{
    LaunchSpec, ServiceHandle, ServiceLauncher, SuiteReport, ValidationHarness,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Validation parameters
#[derive(Debug, Clone)]
pub struct ValidationSettings {
    pub suite: String,
    pub port: u16,
    pub readiness_timeout: Duration,
    pub poll_interval: Duration,
    pub env: BTreeMap<String, String>,
}

impl From<&ValidationConfig> for ValidationSettings {
    fn from(config: &ValidationConfig) -> Self {
        Self {
            suite: config.suite.clone(),
            port: config.port,
            readiness_timeout: Duration::from_secs(config.readiness_timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            env: config.env.clone(),
        }
    }
}

/// Poll `is_ready` until it succeeds or `timeout` elapses
pub async fn wait_until_ready(
    launcher: &dyn ServiceLauncher,
    handle: &ServiceHandle,
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let ready = async {
        loop {
            if launcher.is_ready(handle).await {
                return;
            }
            tokio::time::sleep(poll_interval).await;
        }
    };
    tokio::time::timeout(timeout, ready).await.is_ok()
}

/// Instantiates a candidate, waits for readiness, runs the suite, stops it
pub struct ValidationRunner {
    launcher: Arc<dyn ServiceLauncher>,
    harness: Arc<dyn ValidationHarness>,
    settings: ValidationSettings,
}

impl ValidationRunner {
    pub fn new(
        launcher: Arc<dyn ServiceLauncher>,
        harness: Arc<dyn ValidationHarness>,
        settings: ValidationSettings,
    ) -> Self {
        Self {
            launcher,
            harness,
            settings,
        }
    }

    pub fn settings(&self) -> &ValidationSettings {
        &self.settings
    }

    /// Validate one candidate; a failed suite is an error
    ///
    /// The instance is stopped on every path, including cancellation.
    pub async fn validate(
        &self,
        spec: &LaunchSpec,
        cancel: &CancelSignal,
    ) -> Result<SuiteReport, PipelineError> {
        let target = spec.target();
        info!("Starting {} for suite '{}'", target, self.settings.suite);
        let handle = self.launcher.start(spec).await?;

        let mut cancel = cancel.clone();
        let outcome = tokio::select! {
            outcome = self.ready_then_run(&handle, &target) => outcome,
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        };

        if let Err(e) = self.launcher.stop(&handle).await {
            warn!("Failed to stop {} ({}): {}", target, handle.id, e);
        } else {
            debug!("Stopped {}", handle.id);
        }

        let report = outcome?;
        if !report.passed {
            return Err(PipelineError::ValidationFailed {
                suite: self.settings.suite.clone(),
                target,
                failures: report.failures,
            });
        }
        Ok(report)
    }

    async fn ready_then_run(
        &self,
        handle: &ServiceHandle,
        target: &str,
    ) -> Result<SuiteReport, PipelineError> {
        let ready = wait_until_ready(
            self.launcher.as_ref(),
            handle,
            self.settings.readiness_timeout,
            self.settings.poll_interval,
        )
        .await;
        if !ready {
            return Err(PipelineError::ReadinessTimeout {
                target: target.to_string(),
                timeout_secs: self.settings.readiness_timeout.as_secs(),
            });
        }

        debug!("{} ready at {}", target, handle.endpoint);
        let report = self.harness.run_suite(&handle.endpoint, &self.settings.suite).await?;
        info!(
            "Suite '{}' against {}: {} ({} failure(s))",
            self.settings.suite,
            target,
            if report.passed { "passed" } else { "failed" },
            report.failures.len()
        );
        Ok(report)
    }
}
