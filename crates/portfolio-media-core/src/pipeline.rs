//! Pipeline facade used by the CRUD layer
//!
//! Call the `notify_*` methods after the owning record's transaction has
//! committed. They only touch folders and the durable queue; image work
//! happens later on the worker pool.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::folders::{FolderHandle, FolderManager};
use crate::models::{EntityRef, ImageAsset, MediaEntity, OptimizationTask, TaskId};
use crate::queue::{RetryPolicy, TaskQueue};
use crate::sink::{MemoryResultSink, ResultSink, SqliteResultSink};
use crate::status::{StatusReporter, StatusSnapshot, WorkerBoard};
use crate::worker::WorkerPool;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Owns the queue, folder manager, result sink and worker pool
pub struct MediaPipeline {
    config: PipelineConfig,
    queue: Arc<TaskQueue>,
    folders: Arc<FolderManager>,
    sink: Arc<dyn ResultSink>,
    pool: WorkerPool,
    status: StatusReporter,
}

impl MediaPipeline {
    /// Build a pipeline from configuration
    ///
    /// Uses a SQLite sink when `storage.database_path` is set and an
    /// in-memory sink otherwise.
    pub async fn open(config: PipelineConfig) -> Result<Self> {
        let sink: Arc<dyn ResultSink> = match &config.storage.database_path {
            Some(path) => Arc::new(SqliteResultSink::open(path).await?),
            None => Arc::new(MemoryResultSink::new()),
        };
        Self::with_sink(config, sink).await
    }

    /// Build a pipeline around a caller-provided sink
    pub async fn with_sink(config: PipelineConfig, sink: Arc<dyn ResultSink>) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(
            TaskQueue::open(
                &config.storage.queue_dir,
                RetryPolicy::from_config(&config.workers),
            )
            .await?,
        );
        let folders = Arc::new(
            FolderManager::open(
                &config.storage.media_root,
                config.optimization.variant_layout,
                config.folders.clone(),
            )
            .await?,
        );
        let board = Arc::new(WorkerBoard::new(config.workers.count));
        let status = StatusReporter::new(queue.counters(), board.clone());
        let pool = WorkerPool::new(
            queue.clone(),
            folders.clone(),
            sink.clone(),
            config.optimization.clone(),
            config.workers.clone(),
            board,
        );

        Ok(Self {
            config,
            queue,
            folders,
            sink,
            pool,
            status,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn folders(&self) -> &Arc<FolderManager> {
        &self.folders
    }

    pub fn status_reporter(&self) -> StatusReporter {
        self.status.clone()
    }

    /// Start background workers
    pub async fn start(&self) -> Result<()> {
        self.pool.start().await
    }

    /// Process all currently claimable tasks on the calling task
    pub async fn drain(&self) -> Result<usize> {
        self.pool.drain().await
    }

    /// Schedule optimization of an entity's images
    ///
    /// Resolves and creates the entity folder (moving it if the title changed
    /// without a rename notification) and durably enqueues the task.
    #[instrument(skip(self, assets), fields(assets = assets.len()))]
    pub async fn notify_image_changed(
        &self,
        entity: EntityRef,
        title: &str,
        mut assets: Vec<ImageAsset>,
    ) -> Result<TaskId> {
        let guard = self.folders.lock(entity).await;
        let prepared = self.folders.prepare_locked(&guard, title).await?;
        if let Some(old) = &prepared.moved_from {
            let (old_dir, new_dir) = (old.entity_dir(), prepared.handle.entity_dir());
            for asset in &mut assets {
                asset.rebase(&old_dir, &new_dir);
            }
            self.relocated(entity, old, &prepared.handle).await?;
        }
        drop(guard);

        self.queue
            .enqueue(OptimizationTask::new(entity, assets))
            .await
    }

    /// Convenience wrapper taking the CRUD record itself
    pub async fn notify_saved<E: MediaEntity + ?Sized>(&self, record: &E) -> Result<TaskId> {
        let assets = record
            .image_sources()
            .into_iter()
            .map(|(role, path)| ImageAsset::new(path, role))
            .collect();
        self.notify_image_changed(record.entity_ref(), record.title(), assets)
            .await
    }

    /// Move the entity folder after a title change
    ///
    /// When the old tree cannot be fully removed after copying, the move still
    /// takes effect and the `FolderDeleteIncomplete` error is returned.
    #[instrument(skip(self))]
    pub async fn notify_entity_renamed(
        &self,
        entity: EntityRef,
        old_title: &str,
        new_title: &str,
    ) -> Result<FolderHandle> {
        let guard = self.folders.lock(entity).await;
        let old = match self.folders.current(entity).await? {
            Some(handle) => handle,
            None => self.folders.resolve(entity, old_title).await?,
        };
        let new = self.folders.resolve(entity, new_title).await?;
        if old == new {
            self.folders.ensure_locked(&guard, &new).await?;
            return Ok(new);
        }

        match self.folders.rename_locked(&guard, &old, &new).await {
            Ok(()) => {}
            Err(e @ PipelineError::FolderDeleteIncomplete { .. }) => {
                self.relocated(entity, &old, &new).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        self.relocated(entity, &old, &new).await?;
        info!(from = %old.entity_slug, to = %new.entity_slug, "Entity folder renamed");
        Ok(new)
    }

    async fn relocated(&self, entity: EntityRef, old: &FolderHandle, new: &FolderHandle) -> Result<()> {
        let (old_dir, new_dir) = (old.entity_dir(), new.entity_dir());
        self.queue.rebase_entity(entity, &old_dir, &new_dir).await?;
        self.sink.entity_relocated(entity, &old_dir, &new_dir).await
    }

    /// Drop pending work and remove the entity folder
    ///
    /// Safe to call repeatedly.
    #[instrument(skip(self))]
    pub async fn notify_entity_deleted(&self, entity: EntityRef, title: &str) -> Result<()> {
        let cancelled = self.queue.cancel_entity(entity).await?;
        let guard = self.folders.lock(entity).await;
        let handle = match self.folders.current(entity).await? {
            Some(handle) => handle,
            None => self.folders.resolve(entity, title).await?,
        };

        self.folders.delete_locked(&guard, &handle).await?;
        self.sink.entity_removed(entity).await?;
        drop(guard);
        info!(cancelled, "Entity media removed");
        Ok(())
    }

    pub fn get_status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Refuse new tasks; running work continues
    pub fn stop_accepting(&self) {
        self.queue.close();
    }

    /// Stop accepting work and wait for the workers to finish
    pub async fn shutdown(&self) {
        self.stop_accepting();
        self.pool.shutdown().await;
        if self.queue.stats().queued > 0 {
            warn!(
                queued = self.queue.stats().queued,
                "Tasks remain queued and will resume on next start"
            );
        }
    }
}
