//! Pipeline state machine - the only writer of stage statuses
//!
//! The audit log is the source of truth. Every transition is read-check-write
//! against it under one lock, so a restarted controller sees exactly what
//! was recorded before.

use crate::core::{
    PipelineError, PipelineRun, Revision, Stage, StageAttempt, StageStatus, TriggerSource,
};
use crate::persistence::AuditLog;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// How long an owner may go without a heartbeat before its attempt can be expired
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30);

fn audit_error(e: anyhow::Error) -> PipelineError {
    PipelineError::Audit(format!("{:#}", e))
}

/// Result of an operator cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRequest {
    /// The owning controller is alive and will stop before promotion
    Requested,
    /// The owner stopped heartbeating; the attempt is now Cancelled
    Expired,
}

pub struct PipelineStateMachine {
    audit: Arc<dyn AuditLog>,
    transitions: Mutex<()>,
    lease_timeout: Duration,
}

impl PipelineStateMachine {
    pub fn new(audit: Arc<dyn AuditLog>) -> Self {
        Self {
            audit,
            transitions: Mutex::new(()),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    /// Current view of a revision's run
    pub async fn run(&self, revision: &Revision) -> Result<PipelineRun, PipelineError> {
        let attempts = self
            .audit
            .attempts_for_revision(revision)
            .await
            .map_err(audit_error)?;
        Ok(PipelineRun::from_attempts(revision.clone(), attempts))
    }

    /// Record a new Running attempt
    ///
    /// Refused while the same (stage, revision) is Running, and for
    /// non-manual triggers while an earlier stage is Failed or Cancelled.
    pub async fn begin(
        &self,
        stage: Stage,
        revision: &Revision,
        trigger: TriggerSource,
    ) -> Result<StageAttempt, PipelineError> {
        let _guard = self.transitions.lock().await;
        let run = self.run(revision).await?;

        if run.stage_status(stage) == StageStatus::Running {
            return Err(PipelineError::AlreadyRunning {
                stage,
                revision: revision.clone(),
            });
        }
        if trigger != TriggerSource::ManualDispatch {
            if let Some(blocking) = run.blocking_stage(stage) {
                return Err(PipelineError::StageBlocked {
                    stage,
                    revision: revision.clone(),
                    blocking,
                });
            }
        }

        let number = run.attempt_count(stage) + 1;
        let attempt = StageAttempt::start(stage, revision.clone(), number, trigger);
        self.audit.record_attempt(&attempt).await.map_err(audit_error)?;
        info!(
            "{} attempt {} started for {} ({})",
            stage, attempt.attempt, revision, trigger
        );
        Ok(attempt)
    }

    /// Move a Running attempt to the terminal status its owner observed
    ///
    /// The owner's outcome is always recorded, even over an expiry written by
    /// another process: the audit trail must match what the stage did to the
    /// registries.
    pub async fn finish(
        &self,
        attempt: &mut StageAttempt,
        status: StageStatus,
        detail: Option<String>,
    ) -> Result<(), PipelineError> {
        if !status.is_terminal() {
            return Err(PipelineError::Audit(format!("{} is not a terminal status", status)));
        }
        let _guard = self.transitions.lock().await;

        if let Some(stored) = self.audit.load_attempt(attempt.id).await.map_err(audit_error)? {
            if stored.status.is_terminal() && stored.status != status {
                warn!(
                    "{} attempt {} for {} was marked {} while still running; recording {}",
                    attempt.stage, attempt.attempt, attempt.revision, stored.status, status
                );
            }
            attempt.cancel_requested = stored.cancel_requested;
            attempt.heartbeat_at = stored.heartbeat_at;
        }

        attempt.finish(status, detail);
        self.audit.record_attempt(attempt).await.map_err(audit_error)
    }

    /// Owner heartbeat for a Running attempt
    ///
    /// Returns true when an operator has asked for cancellation.
    pub async fn heartbeat(&self, attempt_id: Uuid) -> Result<bool, PipelineError> {
        let requested = self
            .audit
            .heartbeat(attempt_id, Utc::now())
            .await
            .map_err(audit_error)?;
        Ok(requested.unwrap_or(false))
    }

    /// Record that a stage was not executed for a revision
    pub async fn skip(
        &self,
        stage: Stage,
        revision: &Revision,
        trigger: TriggerSource,
        reason: impl Into<String>,
    ) -> Result<StageAttempt, PipelineError> {
        let _guard = self.transitions.lock().await;
        let run = self.run(revision).await?;

        let number = run.attempt_count(stage) + 1;
        let mut attempt = StageAttempt::start(stage, revision.clone(), number, trigger);
        attempt.finish(StageStatus::Skipped, Some(reason.into()));
        self.audit.record_attempt(&attempt).await.map_err(audit_error)?;
        info!("{} skipped for {}", stage, revision);
        Ok(attempt)
    }

    /// Operator cancel of a Running attempt
    ///
    /// A live owner gets a cancel request and stops on its own before
    /// promotion; the attempt stays Running until it does. An attempt whose
    /// owner has not heartbeated within the lease timeout (a crashed
    /// process) is marked Cancelled directly.
    pub async fn cancel(&self, attempt_id: Uuid) -> Result<CancelRequest, PipelineError> {
        let _guard = self.transitions.lock().await;
        let attempt = self
            .audit
            .load_attempt(attempt_id)
            .await
            .map_err(audit_error)?
            .ok_or_else(|| PipelineError::Audit(format!("attempt {} not found", attempt_id)))?;
        let not_running = |status: StageStatus| {
            PipelineError::Audit(format!("attempt {} is {}, not Running", attempt_id, status))
        };

        if attempt.status != StageStatus::Running {
            return Err(not_running(attempt.status));
        }

        let lease = chrono::Duration::from_std(self.lease_timeout)
            .map_err(|e| PipelineError::Audit(format!("invalid lease timeout: {}", e)))?;
        let cutoff = Utc::now() - lease;
        if attempt.owner_silent_since(cutoff) {
            let expired = self
                .audit
                .expire_attempt(attempt_id, cutoff, "cancelled by operator; owner unresponsive")
                .await
                .map_err(audit_error)?;
            if expired {
                warn!(
                    "{} attempt {} for {} expired and cancelled",
                    attempt.stage, attempt.attempt, attempt.revision
                );
                return Ok(CancelRequest::Expired);
            }
        }

        if self.audit.request_cancel(attempt_id).await.map_err(audit_error)? {
            info!(
                "Cancellation requested for {} attempt {} of {}",
                attempt.stage, attempt.attempt, attempt.revision
            );
            Ok(CancelRequest::Requested)
        } else {
            Err(PipelineError::Audit(format!(
                "attempt {} finished before it could be cancelled",
                attempt_id
            )))
        }
    }

    /// Attempts recorded as Running, e.g. after a restart
    pub async fn running(&self) -> Result<Vec<StageAttempt>, PipelineError> {
        self.audit.running_attempts().await.map_err(audit_error)
    }

    /// Runs for the most recently active revisions
    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<PipelineRun>, PipelineError> {
        let revisions = self.audit.list_revisions().await.map_err(audit_error)?;
        let mut runs = Vec::new();
        for revision in revisions.into_iter().take(limit) {
            runs.push(self.run(&revision).await?);
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryAuditLog;

    fn rev() -> Revision {
        Revision::new("abc123").unwrap()
    }

    fn machine() -> PipelineStateMachine {
        PipelineStateMachine::new(Arc::new(InMemoryAuditLog::new()))
    }

    #[tokio::test]
    async fn test_begin_rejects_concurrent_attempt() {
        let machine = machine();
        machine.begin(Stage::Build, &rev(), TriggerSource::Push).await.unwrap();

        let err = machine
            .begin(Stage::Build, &rev(), TriggerSource::ManualDispatch)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRunning { stage: Stage::Build, .. }));
    }

    #[tokio::test]
    async fn test_failed_stage_blocks_downstream_but_not_manual_retry() {
        let machine = machine();
        let mut build = machine.begin(Stage::Build, &rev(), TriggerSource::Push).await.unwrap();
        machine.finish(&mut build, StageStatus::Failed, Some("boom".into())).await.unwrap();

        let err = machine
            .begin(Stage::Delivery, &rev(), TriggerSource::UpstreamCompletion)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StageBlocked { blocking: Stage::Build, .. }));

        let retry = machine
            .begin(Stage::Build, &rev(), TriggerSource::ManualDispatch)
            .await
            .unwrap();
        assert_eq!(retry.attempt, 2);
    }

    #[tokio::test]
    async fn test_run_rebuilt_from_audit() {
        let audit: Arc<dyn AuditLog> = Arc::new(InMemoryAuditLog::new());
        {
            let machine = PipelineStateMachine::new(audit.clone());
            let mut build = machine.begin(Stage::Build, &rev(), TriggerSource::Push).await.unwrap();
            machine.finish(&mut build, StageStatus::Succeeded, None).await.unwrap();
            machine
                .begin(Stage::Delivery, &rev(), TriggerSource::UpstreamCompletion)
                .await
                .unwrap();
        }

        let restarted = PipelineStateMachine::new(audit);
        let run = restarted.run(&rev()).await.unwrap();
        assert_eq!(run.stage_status(Stage::Build), StageStatus::Succeeded);
        assert_eq!(run.stage_status(Stage::Delivery), StageStatus::Running);
        assert_eq!(restarted.running().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_of_live_attempt_is_a_request() {
        let machine = machine();
        let mut attempt =
            machine.begin(Stage::Delivery, &rev(), TriggerSource::Push).await.unwrap();

        assert_eq!(machine.cancel(attempt.id).await.unwrap(), CancelRequest::Requested);

        // Still owned and running: nobody else may start the stage
        let run = machine.run(&rev()).await.unwrap();
        assert_eq!(run.stage_status(Stage::Delivery), StageStatus::Running);
        let err = machine
            .begin(Stage::Delivery, &rev(), TriggerSource::ManualDispatch)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRunning { .. }));

        assert!(machine.heartbeat(attempt.id).await.unwrap());
        machine.finish(&mut attempt, StageStatus::Cancelled, None).await.unwrap();
        assert!(attempt.cancel_requested);
        assert!(!machine.heartbeat(attempt.id).await.unwrap());
        assert!(machine.cancel(attempt.id).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_of_silent_attempt_expires_it() {
        let audit = Arc::new(InMemoryAuditLog::new());
        let machine =
            PipelineStateMachine::new(audit.clone()).with_lease_timeout(Duration::from_secs(60));
        let mut stale = StageAttempt::start(Stage::Build, rev(), 1, TriggerSource::Push);
        stale.heartbeat_at = Some(Utc::now() - chrono::Duration::minutes(10));
        audit.record_attempt(&stale).await.unwrap();

        assert_eq!(machine.cancel(stale.id).await.unwrap(), CancelRequest::Expired);
        let run = machine.run(&rev()).await.unwrap();
        assert_eq!(run.stage_status(Stage::Build), StageStatus::Cancelled);

        // An owner that was only slow still records what it actually did
        machine.finish(&mut stale, StageStatus::Succeeded, None).await.unwrap();
        let run = machine.run(&rev()).await.unwrap();
        assert_eq!(run.stage_status(Stage::Build), StageStatus::Succeeded);
    }
}
