//! Persistence layer for the stage audit trail

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::{open_pool, SqliteAuditStore};

use crate::core::{Revision, StageAttempt, StageStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Trait for audit log backends
///
/// Every stage attempt is written here when it starts and again when it
/// finishes. Records are keyed by attempt id, so writing an attempt twice
/// updates it in place.
///
/// The cancel flag and the heartbeat are shared between processes and are
/// only changed through the conditional updates below; `record_attempt`
/// leaves them alone on an existing record.
#[async_trait::async_trait]
pub trait AuditLog: Send + Sync {
    /// Insert or update an attempt
    async fn record_attempt(&self, attempt: &StageAttempt) -> Result<()>;

    /// Flag a Running attempt for cancellation; false if it is not Running
    async fn request_cancel(&self, attempt_id: Uuid) -> Result<bool>;

    /// Refresh a Running attempt's heartbeat
    ///
    /// Returns whether cancellation was requested, or `None` once the
    /// attempt is no longer Running.
    async fn heartbeat(&self, attempt_id: Uuid, at: DateTime<Utc>) -> Result<Option<bool>>;

    /// Mark a Running attempt Cancelled if its owner has been silent since `cutoff`
    async fn expire_attempt(
        &self,
        attempt_id: Uuid,
        cutoff: DateTime<Utc>,
        detail: &str,
    ) -> Result<bool>;

    /// Load an attempt by ID
    async fn load_attempt(&self, attempt_id: Uuid) -> Result<Option<StageAttempt>>;

    /// All attempts for a revision, oldest first
    async fn attempts_for_revision(&self, revision: &Revision) -> Result<Vec<StageAttempt>>;

    /// Attempts still marked Running
    async fn running_attempts(&self) -> Result<Vec<StageAttempt>>;

    /// Revisions with at least one attempt, most recently started first
    async fn list_revisions(&self) -> Result<Vec<Revision>>;

    /// The newest attempts across all revisions, newest first
    async fn recent(&self, limit: usize) -> Result<Vec<StageAttempt>>;
}

/// In-memory audit log (for testing or ephemeral use)
pub struct InMemoryAuditLog {
    attempts: RwLock<Vec<StageAttempt>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self {
            attempts: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn record_attempt(&self, attempt: &StageAttempt) -> Result<()> {
        let mut attempts = self.attempts.write().await;
        match attempts.iter_mut().find(|a| a.id == attempt.id) {
            Some(existing) => {
                let cancel_requested = existing.cancel_requested;
                let heartbeat_at = existing.heartbeat_at;
                *existing = attempt.clone();
                existing.cancel_requested = cancel_requested;
                existing.heartbeat_at = heartbeat_at;
            }
            None => attempts.push(attempt.clone()),
        }
        Ok(())
    }

    async fn request_cancel(&self, attempt_id: Uuid) -> Result<bool> {
        let mut attempts = self.attempts.write().await;
        match attempts
            .iter_mut()
            .find(|a| a.id == attempt_id && a.status == StageStatus::Running)
        {
            Some(attempt) => {
                attempt.cancel_requested = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn heartbeat(&self, attempt_id: Uuid, at: DateTime<Utc>) -> Result<Option<bool>> {
        let mut attempts = self.attempts.write().await;
        Ok(attempts
            .iter_mut()
            .find(|a| a.id == attempt_id && a.status == StageStatus::Running)
            .map(|attempt| {
                attempt.heartbeat_at = Some(at);
                attempt.cancel_requested
            }))
    }

    async fn expire_attempt(
        &self,
        attempt_id: Uuid,
        cutoff: DateTime<Utc>,
        detail: &str,
    ) -> Result<bool> {
        let mut attempts = self.attempts.write().await;
        match attempts.iter_mut().find(|a| {
            a.id == attempt_id && a.status == StageStatus::Running && a.owner_silent_since(cutoff)
        }) {
            Some(attempt) => {
                attempt.finish(StageStatus::Cancelled, Some(detail.to_string()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_attempt(&self, attempt_id: Uuid) -> Result<Option<StageAttempt>> {
        let attempts = self.attempts.read().await;
        Ok(attempts.iter().find(|a| a.id == attempt_id).cloned())
    }

    async fn attempts_for_revision(&self, revision: &Revision) -> Result<Vec<StageAttempt>> {
        let attempts = self.attempts.read().await;
        Ok(attempts
            .iter()
            .filter(|a| &a.revision == revision)
            .cloned()
            .collect())
    }

    async fn running_attempts(&self) -> Result<Vec<StageAttempt>> {
        let attempts = self.attempts.read().await;
        Ok(attempts
            .iter()
            .filter(|a| a.status == StageStatus::Running)
            .cloned()
            .collect())
    }

    async fn list_revisions(&self) -> Result<Vec<Revision>> {
        let attempts = self.attempts.read().await;
        let mut revisions: Vec<Revision> = Vec::new();
        for attempt in attempts.iter().rev() {
            if !revisions.contains(&attempt.revision) {
                revisions.push(attempt.revision.clone());
            }
        }
        Ok(revisions)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StageAttempt>> {
        let attempts = self.attempts.read().await;
        Ok(attempts.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Stage, TriggerSource};

    fn rev(id: &str) -> Revision {
        Revision::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_record_updates_in_place() {
        let log = InMemoryAuditLog::new();
        let mut attempt = StageAttempt::start(Stage::Build, rev("r1"), 1, TriggerSource::Push);
        log.record_attempt(&attempt).await.unwrap();
        assert_eq!(log.running_attempts().await.unwrap().len(), 1);

        attempt.finish(StageStatus::Succeeded, None);
        log.record_attempt(&attempt).await.unwrap();

        assert!(log.running_attempts().await.unwrap().is_empty());
        let loaded = log.load_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, StageStatus::Succeeded);
        assert_eq!(log.attempts_for_revision(&rev("r1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revisions_newest_first() {
        let log = InMemoryAuditLog::new();
        for id in ["r1", "r2", "r1"] {
            let attempt = StageAttempt::start(Stage::Build, rev(id), 1, TriggerSource::Push);
            log.record_attempt(&attempt).await.unwrap();
        }
        assert_eq!(log.list_revisions().await.unwrap(), vec![rev("r1"), rev("r2")]);
        assert_eq!(log.recent(2).await.unwrap()[1].revision, rev("r2"));
    }

    #[tokio::test]
    async fn test_cancel_flag_survives_owner_writes() {
        let log = InMemoryAuditLog::new();
        let mut attempt = StageAttempt::start(Stage::Delivery, rev("r1"), 1, TriggerSource::Push);
        log.record_attempt(&attempt).await.unwrap();

        assert!(log.request_cancel(attempt.id).await.unwrap());
        attempt.versions.insert("model".to_string(), "1".to_string());
        log.record_attempt(&attempt).await.unwrap();
        assert_eq!(log.heartbeat(attempt.id, Utc::now()).await.unwrap(), Some(true));

        attempt.finish(StageStatus::Cancelled, None);
        log.record_attempt(&attempt).await.unwrap();
        assert_eq!(log.heartbeat(attempt.id, Utc::now()).await.unwrap(), None);
        assert!(!log.request_cancel(attempt.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_expire_only_silent_attempts() {
        let log = InMemoryAuditLog::new();
        let attempt = StageAttempt::start(Stage::Build, rev("r1"), 1, TriggerSource::Push);
        log.record_attempt(&attempt).await.unwrap();

        let before_start = attempt.started_at - chrono::Duration::seconds(1);
        assert!(!log.expire_attempt(attempt.id, before_start, "owner gone").await.unwrap());

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert!(log.expire_attempt(attempt.id, later, "owner gone").await.unwrap());
        let loaded = log.load_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, StageStatus::Cancelled);
        assert_eq!(loaded.detail.as_deref(), Some("owner gone"));
    }
}
