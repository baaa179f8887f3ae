//! SQLite-backed image and model registries
//!
//! Both registries share one database. Alias writes are a single upsert
//! inside a transaction, so a reader sees either the old or the new holder.

use crate::core::{ArtifactKind, ResourceKind, Revision};
use crate::registry::model::out_of_order;
use crate::registry::{
    AliasLocks, AliasRegistry, ImageManifest, Metrics, ModelRegistry, ModelVersion, RegistryClient,
    RegistryError, RegistryResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tracing::{debug, info};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS images (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        repository TEXT NOT NULL,
        kind TEXT NOT NULL,
        version TEXT NOT NULL,
        revision TEXT NOT NULL,
        digest TEXT NOT NULL,
        labels TEXT NOT NULL DEFAULT '{}',
        pushed_at TEXT NOT NULL,
        UNIQUE (repository, kind, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS model_versions (
        name TEXT NOT NULL,
        version INTEGER NOT NULL,
        revision TEXT NOT NULL,
        metrics TEXT NOT NULL,
        registered_at TEXT NOT NULL,
        PRIMARY KEY (name, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS aliases (
        scope TEXT NOT NULL,
        alias TEXT NOT NULL,
        version TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (scope, alias)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_images_revision ON images(repository, kind, revision)",
];

/// Create the registry tables if they do not exist yet
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn parse_revision(kind: ResourceKind, raw: String) -> RegistryResult<Revision> {
    Revision::new(raw).map_err(|e| RegistryError::backend(kind, e))
}

fn parse_timestamp(kind: ResourceKind, raw: &str) -> RegistryResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RegistryError::backend(kind, e))
}

/// Read the current holder of an alias and replace it in one transaction
async fn swap_alias(
    pool: &SqlitePool,
    kind: ResourceKind,
    scope: &str,
    alias: &str,
    version: &str,
) -> RegistryResult<Option<String>> {
    let mut tx = pool.begin().await.map_err(|e| RegistryError::backend(kind, e))?;

    let previous: Option<String> =
        sqlx::query_scalar("SELECT version FROM aliases WHERE scope = ?1 AND alias = ?2")
            .bind(scope)
            .bind(alias)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| RegistryError::backend(kind, e))?;

    sqlx::query(
        r#"
        INSERT INTO aliases (scope, alias, version, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (scope, alias) DO UPDATE SET
            version = excluded.version,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(scope)
    .bind(alias)
    .bind(version)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *tx)
    .await
    .map_err(|e| RegistryError::backend(kind, e))?;

    tx.commit().await.map_err(|e| RegistryError::backend(kind, e))?;
    Ok(previous)
}

async fn delete_alias_row(
    pool: &SqlitePool,
    kind: ResourceKind,
    scope: &str,
    alias: &str,
) -> RegistryResult<()> {
    sqlx::query("DELETE FROM aliases WHERE scope = ?1 AND alias = ?2")
        .bind(scope)
        .bind(alias)
        .execute(pool)
        .await
        .map_err(|e| RegistryError::backend(kind, e))?;
    Ok(())
}

async fn read_alias(
    pool: &SqlitePool,
    kind: ResourceKind,
    scope: &str,
    alias: &str,
) -> RegistryResult<Option<String>> {
    sqlx::query_scalar("SELECT version FROM aliases WHERE scope = ?1 AND alias = ?2")
        .bind(scope)
        .bind(alias)
        .fetch_optional(pool)
        .await
        .map_err(|e| RegistryError::backend(kind, e))
}

/// SQLite image registry for one (repository, kind) pair
#[derive(Debug, Clone)]
pub struct SqliteImageRegistry {
    pool: SqlitePool,
    repository: String,
    kind: ArtifactKind,
    locks: std::sync::Arc<AliasLocks>,
}

impl SqliteImageRegistry {
    pub fn new(pool: SqlitePool, repository: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            pool,
            repository: repository.into(),
            kind,
            locks: std::sync::Arc::new(AliasLocks::new()),
        }
    }

    fn scope(&self) -> String {
        format!("image:{}:{}", self.repository, self.kind)
    }

    async fn fetch(&self, version: &str) -> RegistryResult<Option<ImageManifest>> {
        let row = sqlx::query(
            r#"
            SELECT revision, digest, labels FROM images
            WHERE repository = ?1 AND kind = ?2 AND version = ?3
            "#,
        )
        .bind(&self.repository)
        .bind(self.kind.as_str())
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RegistryError::backend(self.kind(), e))?;

        row.map(|row| -> RegistryResult<ImageManifest> {
            let labels: BTreeMap<String, String> =
                serde_json::from_str(&row.get::<String, _>("labels"))
                    .map_err(|e| RegistryError::backend(self.kind(), e))?;
            Ok(ImageManifest {
                revision: parse_revision(self.kind(), row.get("revision"))?,
                digest: row.get("digest"),
                labels,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl AliasRegistry for SqliteImageRegistry {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Artifact(self.kind)
    }

    async fn tag_alias(&self, version: &str, alias: &str) -> RegistryResult<Option<String>> {
        let _guard = self.locks.acquire(alias).await;
        if self.fetch(version).await?.is_none() {
            return Err(RegistryError::not_found(self.kind(), version));
        }
        let previous = swap_alias(&self.pool, self.kind(), &self.scope(), alias, version).await?;
        debug!("{}: alias '{}' -> {} (was {:?})", self.scope(), alias, version, previous);
        Ok(previous)
    }

    async fn remove_alias(&self, alias: &str) -> RegistryResult<()> {
        let _guard = self.locks.acquire(alias).await;
        delete_alias_row(&self.pool, self.kind(), &self.scope(), alias).await
    }

    async fn resolve_alias(&self, alias: &str) -> RegistryResult<Option<String>> {
        read_alias(&self.pool, self.kind(), &self.scope(), alias).await
    }

    async fn lineage(&self, version: &str) -> RegistryResult<Revision> {
        self.fetch(version)
            .await?
            .map(|manifest| manifest.revision)
            .ok_or_else(|| RegistryError::not_found(self.kind(), version))
    }

    async fn find_by_revision(&self, revision: &Revision) -> RegistryResult<Option<String>> {
        sqlx::query_scalar(
            r#"
            SELECT version FROM images
            WHERE repository = ?1 AND kind = ?2 AND revision = ?3
            ORDER BY seq DESC LIMIT 1
            "#,
        )
        .bind(&self.repository)
        .bind(self.kind.as_str())
        .bind(revision.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RegistryError::backend(self.kind(), e))
    }

    async fn latest(&self) -> RegistryResult<Option<String>> {
        sqlx::query_scalar(
            r#"
            SELECT version FROM images
            WHERE repository = ?1 AND kind = ?2
            ORDER BY seq DESC LIMIT 1
            "#,
        )
        .bind(&self.repository)
        .bind(self.kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RegistryError::backend(self.kind(), e))
    }
}

#[async_trait]
impl RegistryClient for SqliteImageRegistry {
    type Payload = ImageManifest;

    async fn push(&self, version: &str, payload: ImageManifest) -> RegistryResult<()> {
        if let Some(existing) = self.fetch(version).await? {
            if existing == payload {
                debug!("{}: {} already pushed, skipping", self.scope(), version);
                return Ok(());
            }
            return Err(RegistryError::DuplicateVersion {
                kind: self.kind(),
                version: version.to_string(),
            });
        }

        let labels = serde_json::to_string(&payload.labels)
            .map_err(|e| RegistryError::backend(self.kind(), e))?;
        sqlx::query(
            r#"
            INSERT INTO images (repository, kind, version, revision, digest, labels, pushed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&self.repository)
        .bind(self.kind.as_str())
        .bind(version)
        .bind(payload.revision.as_str())
        .bind(&payload.digest)
        .bind(labels)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| RegistryError::backend(self.kind(), e))?;

        Ok(())
    }

    async fn pull(&self, version_or_alias: &str) -> RegistryResult<ImageManifest> {
        if let Some(manifest) = self.fetch(version_or_alias).await? {
            return Ok(manifest);
        }
        match self.resolve_alias(version_or_alias).await? {
            Some(version) => self
                .fetch(&version)
                .await?
                .ok_or_else(|| RegistryError::not_found(self.kind(), version_or_alias)),
            None => Err(RegistryError::not_found(self.kind(), version_or_alias)),
        }
    }
}

/// SQLite model registry
#[derive(Debug, Clone)]
pub struct SqliteModelRegistry {
    pool: SqlitePool,
    locks: std::sync::Arc<AliasLocks>,
}

impl SqliteModelRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: std::sync::Arc::new(AliasLocks::new()),
        }
    }

    fn scope(model_name: &str) -> String {
        format!("model:{}", model_name)
    }

    fn backend(e: impl ToString) -> RegistryError {
        RegistryError::backend(ResourceKind::Model, e)
    }

    async fn aliases_for(&self, model_name: &str, version: u64) -> RegistryResult<Vec<String>> {
        sqlx::query_scalar(
            "SELECT alias FROM aliases WHERE scope = ?1 AND version = ?2 ORDER BY alias",
        )
        .bind(Self::scope(model_name))
        .bind(version.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(Self::backend)
    }
}

#[async_trait]
impl ModelRegistry for SqliteModelRegistry {
    async fn register(
        &self,
        model_name: &str,
        revision: &Revision,
        metrics: Metrics,
    ) -> RegistryResult<ModelVersion> {
        let encoded = serde_json::to_string(&metrics).map_err(Self::backend)?;
        let registered_at = Utc::now();

        // Version assignment and insert happen in one statement.
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO model_versions (name, version, revision, metrics, registered_at)
            SELECT ?1, COALESCE(MAX(version), 0) + 1, ?2, ?3, ?4
            FROM model_versions WHERE name = ?1
            RETURNING version
            "#,
        )
        .bind(model_name)
        .bind(revision.as_str())
        .bind(encoded)
        .bind(registered_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .map_err(Self::backend)?;

        info!("Registered {} version {} from revision {}", model_name, version, revision);

        let mut model = ModelVersion::new(model_name, version as u64, revision.clone());
        model.metrics = metrics;
        model.registered_at = registered_at;
        Ok(model)
    }

    async fn import(&self, model: ModelVersion) -> RegistryResult<()> {
        match self.get_version(&model.name, model.version).await {
            Ok(existing) if existing.same_content(&model) => return Ok(()),
            Ok(_) => {
                return Err(RegistryError::DuplicateVersion {
                    kind: ResourceKind::Model,
                    version: model.version.to_string(),
                })
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let encoded = serde_json::to_string(&model.metrics).map_err(Self::backend)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO model_versions (name, version, revision, metrics, registered_at)
            SELECT ?1, ?2, ?3, ?4, ?5
            WHERE ?2 > (SELECT COALESCE(MAX(version), 0) FROM model_versions WHERE name = ?1)
            "#,
        )
        .bind(&model.name)
        .bind(model.version as i64)
        .bind(model.revision.as_str())
        .bind(encoded)
        .bind(model.registered_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(Self::backend)?;

        if inserted.rows_affected() == 0 {
            let latest = self.latest_version(&model.name).await?.unwrap_or(0);
            return Err(out_of_order(&model, latest));
        }
        Ok(())
    }

    async fn get_version(&self, model_name: &str, version: u64) -> RegistryResult<ModelVersion> {
        let row = sqlx::query(
            r#"
            SELECT revision, metrics, registered_at FROM model_versions
            WHERE name = ?1 AND version = ?2
            "#,
        )
        .bind(model_name)
        .bind(version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::backend)?
        .ok_or_else(|| {
            RegistryError::not_found(ResourceKind::Model, format!("{}/{}", model_name, version))
        })?;

        let metrics: Metrics =
            serde_json::from_str(&row.get::<String, _>("metrics")).map_err(Self::backend)?;
        let mut model = ModelVersion::new(
            model_name,
            version,
            parse_revision(ResourceKind::Model, row.get("revision"))?,
        );
        model.metrics = metrics;
        let registered_at = row.get::<String, _>("registered_at");
        model.registered_at = parse_timestamp(ResourceKind::Model, &registered_at)?;
        model.aliases = self.aliases_for(model_name, version).await?.into_iter().collect();
        Ok(model)
    }

    async fn set_alias(
        &self,
        model_name: &str,
        version: u64,
        alias: &str,
    ) -> RegistryResult<Option<u64>> {
        let scope = Self::scope(model_name);
        let _guard = self.locks.acquire(&format!("{}/{}", scope, alias)).await;

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM model_versions WHERE name = ?1 AND version = ?2",
        )
        .bind(model_name)
        .bind(version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::backend)?;
        if exists.is_none() {
            return Err(RegistryError::not_found(
                ResourceKind::Model,
                format!("{}/{}", model_name, version),
            ));
        }

        let previous =
            swap_alias(&self.pool, ResourceKind::Model, &scope, alias, &version.to_string()).await?;
        debug!("{}: alias '{}' -> {} (was {:?})", scope, alias, version, previous);
        Ok(previous.and_then(|v| v.parse().ok()))
    }

    async fn delete_alias(&self, model_name: &str, alias: &str) -> RegistryResult<()> {
        let scope = Self::scope(model_name);
        let _guard = self.locks.acquire(&format!("{}/{}", scope, alias)).await;
        delete_alias_row(&self.pool, ResourceKind::Model, &scope, alias).await
    }

    async fn resolve_alias(&self, model_name: &str, alias: &str) -> RegistryResult<Option<u64>> {
        let scope = Self::scope(model_name);
        let version = read_alias(&self.pool, ResourceKind::Model, &scope, alias).await?;
        Ok(version.and_then(|v| v.parse().ok()))
    }

    async fn latest_for_revision(
        &self,
        model_name: &str,
        revision: &Revision,
    ) -> RegistryResult<Option<u64>> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM model_versions WHERE name = ?1 AND revision = ?2",
        )
        .bind(model_name)
        .bind(revision.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(Self::backend)?;
        Ok(version.map(|v| v as u64))
    }

    async fn latest_version(&self, model_name: &str) -> RegistryResult<Option<u64>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM model_versions WHERE name = ?1")
                .bind(model_name)
                .fetch_one(&self.pool)
                .await
                .map_err(Self::backend)?;
        Ok(version.map(|v| v as u64))
    }
}
