//! SQLite-based audit store

use crate::core::{Revision, Stage, StageAttempt, StageStatus, TriggerSource};
use crate::persistence::AuditLog;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

/// Open (creating if needed) the state database
///
/// `:memory:` gives a private in-memory database held by a single
/// connection.
pub async fn open_pool(db_path: &str) -> Result<SqlitePool> {
    let (options, max_connections) = if db_path == ":memory:" {
        (SqliteConnectOptions::from_str("sqlite::memory:")?, 1)
    } else {
        (
            SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true),
            4,
        )
    };

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", db_path))
}

const ATTEMPT_COLUMNS: &str = "id, revision, stage, attempt, trigger_source, status, started_at, \
     finished_at, detail, versions, cancel_requested, heartbeat_at";

/// SQLite audit store
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    /// Create the store on an open pool, initializing the schema
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// The underlying pool, shared with the SQLite registries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stage_attempts (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                revision TEXT NOT NULL,
                stage TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                trigger_source TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                detail TEXT,
                versions TEXT NOT NULL DEFAULT '{}',
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                heartbeat_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create stage_attempts table")?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_attempts_revision ON stage_attempts(revision)",
            "CREATE INDEX IF NOT EXISTS idx_attempts_status ON stage_attempts(status)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    fn timestamp(dt: DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("Bad timestamp '{}'", raw))?
            .with_timezone(&Utc))
    }

    fn from_row(row: &SqliteRow) -> Result<StageAttempt> {
        let stage: String = row.get("stage");
        let trigger: String = row.get("trigger_source");
        let status: String = row.get("status");
        let versions: String = row.get("versions");
        let finished_at: Option<String> = row.get("finished_at");
        let heartbeat_at: Option<String> = row.get("heartbeat_at");

        Ok(StageAttempt {
            id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            revision: Revision::new(row.get::<String, _>("revision"))?,
            stage: Stage::from_str(&stage).map_err(|e| anyhow!(e))?,
            attempt: row.get::<i64, _>("attempt") as u32,
            trigger: TriggerSource::from_str(&trigger).map_err(|e| anyhow!(e))?,
            status: StageStatus::from_str(&status).map_err(|e| anyhow!(e))?,
            started_at: Self::parse_timestamp(&row.get::<String, _>("started_at"))?,
            finished_at: finished_at.as_deref().map(Self::parse_timestamp).transpose()?,
            detail: row.get("detail"),
            versions: serde_json::from_str::<BTreeMap<String, String>>(&versions)
                .context("Bad versions column")?,
            cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
            heartbeat_at: heartbeat_at.as_deref().map(Self::parse_timestamp).transpose()?,
        })
    }
}

#[async_trait::async_trait]
impl AuditLog for SqliteAuditStore {
    async fn record_attempt(&self, attempt: &StageAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stage_attempts
            (id, revision, stage, attempt, trigger_source, status, started_at, finished_at,
             detail, versions, cancel_requested, heartbeat_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                finished_at = excluded.finished_at,
                detail = excluded.detail,
                versions = excluded.versions
            "#,
        )
        .bind(attempt.id.to_string())
        .bind(attempt.revision.as_str())
        .bind(attempt.stage.as_str())
        .bind(attempt.attempt as i64)
        .bind(attempt.trigger.as_str())
        .bind(attempt.status.as_str())
        .bind(Self::timestamp(attempt.started_at))
        .bind(attempt.finished_at.map(Self::timestamp))
        .bind(attempt.detail.as_deref())
        .bind(serde_json::to_string(&attempt.versions)?)
        .bind(attempt.cancel_requested as i64)
        .bind(attempt.heartbeat_at.map(Self::timestamp))
        .execute(&self.pool)
        .await
        .context("Failed to record stage attempt")?;

        Ok(())
    }

    async fn request_cancel(&self, attempt_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE stage_attempts SET cancel_requested = 1 WHERE id = ?1 AND status = 'Running'",
        )
        .bind(attempt_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to request cancellation")?;

        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat(&self, attempt_id: Uuid, at: DateTime<Utc>) -> Result<Option<bool>> {
        let row = sqlx::query(
            r#"
            UPDATE stage_attempts SET heartbeat_at = ?2
            WHERE id = ?1 AND status = 'Running'
            RETURNING cancel_requested
            "#,
        )
        .bind(attempt_id.to_string())
        .bind(Self::timestamp(at))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to record heartbeat")?;

        Ok(row.map(|row| row.get::<i64, _>("cancel_requested") != 0))
    }

    async fn expire_attempt(
        &self,
        attempt_id: Uuid,
        cutoff: DateTime<Utc>,
        detail: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stage_attempts
            SET status = 'Cancelled', finished_at = ?3, detail = ?4
            WHERE id = ?1 AND status = 'Running'
              AND (heartbeat_at IS NULL OR heartbeat_at < ?2)
            "#,
        )
        .bind(attempt_id.to_string())
        .bind(Self::timestamp(cutoff))
        .bind(Self::timestamp(Utc::now()))
        .bind(detail)
        .execute(&self.pool)
        .await
        .context("Failed to expire stage attempt")?;

        Ok(result.rows_affected() > 0)
    }

    async fn load_attempt(&self, attempt_id: Uuid) -> Result<Option<StageAttempt>> {
        let sql = format!("SELECT {} FROM stage_attempts WHERE id = ?1", ATTEMPT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(attempt_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load stage attempt")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn attempts_for_revision(&self, revision: &Revision) -> Result<Vec<StageAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM stage_attempts WHERE revision = ?1 ORDER BY seq ASC",
            ATTEMPT_COLUMNS
        ))
        .bind(revision.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list stage attempts")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn running_attempts(&self) -> Result<Vec<StageAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM stage_attempts WHERE status = 'Running' ORDER BY seq ASC",
            ATTEMPT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list running attempts")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn list_revisions(&self) -> Result<Vec<Revision>> {
        let rows = sqlx::query(
            r#"
            SELECT revision, MAX(seq) AS last_seq
            FROM stage_attempts
            GROUP BY revision
            ORDER BY last_seq DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list revisions")?;

        rows.iter()
            .map(|row| Ok(Revision::new(row.get::<String, _>("revision"))?))
            .collect()
    }

    async fn recent(&self, limit: usize) -> Result<Vec<StageAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM stage_attempts ORDER BY seq DESC LIMIT ?1",
            ATTEMPT_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list recent attempts")?;

        rows.iter().map(Self::from_row).collect()
    }
}
