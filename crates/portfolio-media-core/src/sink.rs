//! Result sinks record where optimized variants were written
//!
//! The worker pool only acknowledges a task after its sink confirmed the
//! outcome, so a sink failure means the task is retried.

use crate::config::ImageFormat;
use crate::error::{PipelineError, Result};
use crate::models::{rebase_path, EntityRef, ImageAsset, ImageRole, TaskOutcome};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Destination for completed task outcomes
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Record the variants of a processed task
    async fn persist(&self, outcome: &TaskOutcome) -> Result<()>;

    /// The entity tree moved from `old_dir` to `new_dir`
    async fn entity_relocated(&self, entity: EntityRef, old_dir: &Path, new_dir: &Path)
        -> Result<()>;

    /// The entity and its folder are gone
    async fn entity_removed(&self, entity: EntityRef) -> Result<()>;
}

/// One stored variant row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub source_path: PathBuf,
    pub role: ImageRole,
    pub tier: String,
    pub format: ImageFormat,
    pub variant_path: PathBuf,
}

/// SQLite-backed sink
#[derive(Clone)]
pub struct SqliteResultSink {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteResultSink")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

fn entity_id(entity: EntityRef) -> Result<i64> {
    i64::try_from(entity.id()).map_err(|_| PipelineError::InvalidInput {
        message: format!("Entity id {} does not fit the database", entity.id()),
    })
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_role(value: &str) -> Result<ImageRole> {
    match value {
        "primary" => Ok(ImageRole::Primary),
        "album" => Ok(ImageRole::Album),
        other => Err(PipelineError::InvalidInput {
            message: format!("Unknown image role in database: {}", other),
        }),
    }
}

impl SqliteResultSink {
    /// Open (creating if missing) the database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .foreign_keys(true),
            )
            .await?;

        let sink = Self { pool };
        sink.run_migrations().await?;
        info!(path = %path.display(), "Opened variant database");
        Ok(sink)
    }

    /// Create tables and indexes
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS image_variants (
                entity_type TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                source_path TEXT NOT NULL,
                role TEXT NOT NULL,
                tier TEXT NOT NULL,
                format TEXT NOT NULL,
                variant_path TEXT NOT NULL,
                task_id TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (entity_type, entity_id, source_path, tier, format)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_variants_entity ON image_variants (entity_type, entity_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Variants currently recorded for an entity
    pub async fn variants_for(&self, entity: EntityRef) -> Result<Vec<VariantRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT source_path, role, tier, format, variant_path
            FROM image_variants
            WHERE entity_type = ?1 AND entity_id = ?2
            ORDER BY source_path, tier, format
            "#,
        )
        .bind(entity.entity_type().as_str())
        .bind(entity_id(entity)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let format: String = row.get("format");
                Ok(VariantRecord {
                    source_path: PathBuf::from(row.get::<String, _>("source_path")),
                    role: parse_role(&row.get::<String, _>("role"))?,
                    tier: row.get("tier"),
                    format: ImageFormat::from_extension(&format).ok_or_else(|| {
                        PipelineError::InvalidInput {
                            message: format!("Unknown variant format in database: {}", format),
                        }
                    })?,
                    variant_path: PathBuf::from(row.get::<String, _>("variant_path")),
                })
            })
            .collect()
    }

    async fn insert_records(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        entity: EntityRef,
        task_id: &str,
        records: &[VariantRecord],
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        for record in records {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO image_variants
                    (entity_type, entity_id, source_path, role, tier, format, variant_path, task_id, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(entity.entity_type().as_str())
            .bind(entity_id(entity)?)
            .bind(path_text(&record.source_path))
            .bind(record.role.as_str())
            .bind(&record.tier)
            .bind(record.format.extension())
            .bind(path_text(&record.variant_path))
            .bind(task_id)
            .bind(&now)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn delete_entity_rows(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        entity: EntityRef,
    ) -> Result<u64> {
        let result = sqlx::query("DELETE FROM image_variants WHERE entity_type = ?1 AND entity_id = ?2")
            .bind(entity.entity_type().as_str())
            .bind(entity_id(entity)?)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn records_of(assets: &[ImageAsset]) -> Vec<VariantRecord> {
    assets
        .iter()
        .flat_map(|asset| {
            asset.variants.iter().map(|(key, path)| VariantRecord {
                source_path: asset.source_path.clone(),
                role: asset.role,
                tier: key.tier.clone(),
                format: key.format,
                variant_path: path.clone(),
            })
        })
        .collect()
}

#[async_trait]
impl ResultSink for SqliteResultSink {
    async fn persist(&self, outcome: &TaskOutcome) -> Result<()> {
        if outcome.skipped {
            return Ok(());
        }

        // The task carries the entity's complete image list
        let records = records_of(&outcome.assets);
        let mut tx = self.pool.begin().await?;
        Self::delete_entity_rows(&mut tx, outcome.entity).await?;
        Self::insert_records(&mut tx, outcome.entity, &outcome.task_id.to_string(), &records).await?;
        tx.commit().await?;

        debug!(entity = %outcome.entity, variants = records.len(), "Persisted variants");
        Ok(())
    }

    async fn entity_relocated(
        &self,
        entity: EntityRef,
        old_dir: &Path,
        new_dir: &Path,
    ) -> Result<()> {
        let rows = sqlx::query(
            "SELECT task_id FROM image_variants WHERE entity_type = ?1 AND entity_id = ?2 LIMIT 1",
        )
        .bind(entity.entity_type().as_str())
        .bind(entity_id(entity)?)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = rows else {
            return Ok(());
        };
        let task_id: String = row.get("task_id");

        let records: Vec<VariantRecord> = self
            .variants_for(entity)
            .await?
            .into_iter()
            .map(|mut record| {
                if let Some(path) = rebase_path(&record.source_path, old_dir, new_dir) {
                    record.source_path = path;
                }
                if let Some(path) = rebase_path(&record.variant_path, old_dir, new_dir) {
                    record.variant_path = path;
                }
                record
            })
            .collect();

        let mut tx = self.pool.begin().await?;
        Self::delete_entity_rows(&mut tx, entity).await?;
        Self::insert_records(&mut tx, entity, &task_id, &records).await?;
        tx.commit().await?;

        debug!(entity = %entity, variants = records.len(), "Relocated variant rows");
        Ok(())
    }

    async fn entity_removed(&self, entity: EntityRef) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let removed = Self::delete_entity_rows(&mut tx, entity).await?;
        tx.commit().await?;
        debug!(entity = %entity, removed, "Removed variant rows");
        Ok(())
    }
}

/// In-process sink keeping the latest outcome per entity
#[derive(Debug, Default)]
pub struct MemoryResultSink {
    entities: RwLock<HashMap<EntityRef, Vec<ImageAsset>>>,
    persisted: AtomicUsize,
    failures_pending: AtomicUsize,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assets with variants last recorded for an entity
    pub async fn assets_for(&self, entity: EntityRef) -> Option<Vec<ImageAsset>> {
        self.entities.read().await.get(&entity).cloned()
    }

    /// Number of outcomes accepted so far
    pub fn persisted_count(&self) -> usize {
        self.persisted.load(Ordering::Acquire)
    }

    /// Make the next `count` calls to `persist` fail
    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::Release);
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn persist(&self, outcome: &TaskOutcome) -> Result<()> {
        let injected = self
            .failures_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PipelineError::TransientIo {
                path: PathBuf::new(),
                message: "result sink unavailable".to_string(),
            });
        }

        if !outcome.skipped {
            self.entities
                .write()
                .await
                .insert(outcome.entity, outcome.assets.clone());
        }
        self.persisted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn entity_relocated(
        &self,
        entity: EntityRef,
        old_dir: &Path,
        new_dir: &Path,
    ) -> Result<()> {
        if let Some(assets) = self.entities.write().await.get_mut(&entity) {
            for asset in assets.iter_mut() {
                asset.rebase(old_dir, new_dir);
            }
        }
        Ok(())
    }

    async fn entity_removed(&self, entity: EntityRef) -> Result<()> {
        self.entities.write().await.remove(&entity);
        Ok(())
    }
}
