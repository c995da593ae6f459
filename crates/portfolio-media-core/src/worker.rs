//! Worker pool executing optimization tasks
//!
//! Each worker is a long-lived tokio task running claim, process, commit.
//! Codec work runs on the blocking pool; folder writes and queue bookkeeping
//! stay async.

use crate::codec::{ImageCodec, VariantSet};
use crate::config::{OptimizationConfig, WorkerConfig};
use crate::error::{PipelineError, Result};
use crate::folders::{EntityGuard, FolderManager, WrittenVariants};
use crate::models::{EntityRef, FailureRecord, ImageAsset, ImageRole, OptimizationTask, TaskOutcome};
use crate::queue::TaskQueue;
use crate::sink::ResultSink;
use crate::status::{WorkerBoard, WorkerState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Shared dependencies of every worker
struct WorkerContext {
    queue: Arc<TaskQueue>,
    folders: Arc<FolderManager>,
    sink: Arc<dyn ResultSink>,
    codec: ImageCodec,
    optimization: OptimizationConfig,
    config: WorkerConfig,
    board: Arc<WorkerBoard>,
}

/// Pool of workers draining the task queue
pub struct WorkerPool {
    context: Arc<WorkerContext>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        folders: Arc<FolderManager>,
        sink: Arc<dyn ResultSink>,
        optimization: OptimizationConfig,
        config: WorkerConfig,
        board: Arc<WorkerBoard>,
    ) -> Self {
        let codec = ImageCodec::from_config(&optimization);
        Self {
            context: Arc::new(WorkerContext {
                queue,
                folders,
                sink,
                codec,
                optimization,
                config,
                board,
            }),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.context.board.is_running()
    }

    /// Recover abandoned claims and spawn the workers
    pub async fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::QueueClosed);
        }

        let recovered = self.context.queue.recover_claims().await?;
        if recovered > 0 {
            info!(recovered, "Requeued tasks left claimed by a previous run");
        }

        let count = self.context.config.count;
        for index in 0..count {
            let context = self.context.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                context.worker_loop(index, cancel).await;
            }));
        }

        let context = self.context.clone();
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            context.maintenance_loop(cancel).await;
        }));

        self.context.board.set_running(true);
        info!(workers = count, "Worker pool started");
        Ok(())
    }

    /// Stop claiming new tasks and wait for in-flight ones to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        self.context.board.set_running(false);
        info!("Worker pool stopped");
    }

    /// Process every task that is claimable right now on the calling task
    ///
    /// Returns the number of tasks handled. Tasks in backoff are left queued.
    pub async fn drain(&self) -> Result<usize> {
        let mut handled = 0;
        while let Some(task) = self.context.queue.dequeue(1).await? {
            self.context.handle_task(0, task).await;
            handled += 1;
        }
        self.context.board.set(0, WorkerState::Idle);
        Ok(handled)
    }
}

impl WorkerContext {
    async fn worker_loop(&self, index: usize, cancel: CancellationToken) {
        self.board.set(index, WorkerState::Idle);
        debug!(worker = index, "Worker started");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.queue.dequeue_wait(self.config.count, self.config.poll_interval()) => next,
            };

            match next {
                Ok(Some(task)) => self.handle_task(index, task).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker = index, error = %e, "Failed to claim task");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
            }
        }

        self.board.set(index, WorkerState::Stopped);
        debug!(worker = index, "Worker stopped");
    }

    /// Pick up other writers' queue changes and release stale claims
    async fn maintenance_loop(&self, cancel: CancellationToken) {
        let mut refresh_interval =
            interval((self.config.poll_interval() * 4).max(Duration::from_millis(10)));
        let mut sweep_interval = interval(
            SWEEP_INTERVAL
                .min(self.config.task_timeout())
                .max(Duration::from_millis(10)),
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = refresh_interval.tick() => {
                    if let Err(e) = self.queue.refresh().await {
                        warn!(error = %e, "Failed to refresh task queue");
                    }
                }
                _ = sweep_interval.tick() => {
                    match self.queue.sweep_stale_claims(self.config.stale_claim_age()).await {
                        Ok(0) => {}
                        Ok(released) => warn!(released, "Released stale claims"),
                        Err(e) => error!(error = %e, "Failed to sweep stale claims"),
                    }
                }
            }
        }
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, entity = %task.entity, attempt = task.attempt_count))]
    async fn handle_task(&self, index: usize, task: OptimizationTask) {
        self.board.set(index, WorkerState::Claimed);

        let processed = match self.process(index, &task).await {
            Ok(processed) => processed,
            Err(e) => return self.retry(index, &task, e).await,
        };

        // Folder moves and deletes wait until the results are stored
        self.board.set(index, WorkerState::Committing);
        let guard = self.folders.lock(task.entity).await;
        let committed = match self.commit(&guard, processed).await {
            Ok(committed) => committed,
            Err(e) => {
                drop(guard);
                return self.retry(index, &task, e).await;
            }
        };
        if let Err(e) = self.sink.persist(&committed.outcome).await {
            drop(guard);
            return self.retry(index, &task, e).await;
        }
        drop(guard);

        if let Err(e) = self.queue.ack(task.id).await {
            error!(error = %e, "Failed to acknowledge task");
        }
        for failure in committed.failures {
            if let Err(e) = self.queue.record_failure(failure).await {
                error!(error = %e, "Failed to record asset failure");
            }
        }
        let outcome = committed.outcome;
        info!(
            assets = outcome.assets.len(),
            failed = outcome.failed_assets.len(),
            skipped = outcome.skipped,
            "Task completed"
        );

        self.board.set(index, WorkerState::Idle);
    }

    async fn retry(&self, index: usize, task: &OptimizationTask, error: PipelineError) {
        self.board.set(index, WorkerState::Retrying);
        match self.queue.nack(task.id, &error).await {
            Ok(outcome) => debug!(?outcome, "Task attempt failed"),
            Err(e) => error!(error = %e, "Failed to report task failure"),
        }
        self.board.set(index, WorkerState::Idle);
    }

    /// Optimize every asset of a task and write its variants
    async fn process(&self, index: usize, task: &OptimizationTask) -> Result<Processed> {
        let mut processed = Processed {
            outcome: TaskOutcome {
                task_id: task.id,
                entity: task.entity,
                assets: task.assets.clone(),
                failed_assets: Vec::new(),
                skipped: false,
            },
            failures: Vec::new(),
            written_in: vec![None; task.assets.len()],
        };

        if self.folders.current(task.entity).await?.is_none() {
            info!("Entity has no folder any more, skipping task");
            processed.outcome.skipped = true;
            return Ok(processed);
        }
        self.board.set(index, WorkerState::Processing);

        let deadline = Instant::now() + self.config.task_timeout();
        let basenames = variant_basenames(&task.assets);

        for (i, basename) in basenames.into_iter().enumerate() {
            let asset = &mut processed.outcome.assets[i];
            asset.variants.clear();

            let encoded = match basename {
                Ok(basename) => self
                    .encode(asset.source_path.clone(), deadline)
                    .await
                    .map(|variants| (basename, variants)),
                Err(e) => Err(e),
            };

            let (basename, variants) = match encoded {
                Ok(encoded) => encoded,
                Err(e) if e.is_asset_fatal() || matches!(e, PipelineError::InvalidInput { .. }) => {
                    warn!(asset = %asset.source_path.display(), error = %e, "Asset cannot be optimized");
                    processed
                        .failures
                        .push(FailureRecord::from_error(task, Some(&asset.source_path), &e));
                    processed.outcome.failed_assets.push(asset.source_path.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.write(task.entity, asset.role, &basename, &variants).await? {
                Some(written) => {
                    asset.variants = written.paths;
                    processed.written_in[i] = Some(written.handle.entity_dir());
                }
                None => {
                    info!("Entity folder removed while processing, skipping task");
                    processed.outcome.skipped = true;
                    processed.failures.clear();
                    break;
                }
            }
        }

        Ok(processed)
    }

    /// Reconcile written paths with the folder the entity owns now
    ///
    /// Runs under the entity guard. A folder renamed since the variants were
    /// written has carried them along, so their paths are rebased; a deleted
    /// folder turns the task into a skip.
    async fn commit(&self, guard: &EntityGuard, processed: Processed) -> Result<Committed> {
        let Processed {
            mut outcome,
            failures,
            written_in,
        } = processed;
        if outcome.skipped {
            return Ok(Committed {
                outcome,
                failures: Vec::new(),
            });
        }

        let current = match self.folders.current(guard.entity()).await? {
            Some(handle) => handle.entity_dir(),
            None => {
                info!("Entity folder removed before commit, skipping task");
                outcome.skipped = true;
                return Ok(Committed {
                    outcome,
                    failures: Vec::new(),
                });
            }
        };

        for (asset, written_in) in outcome.assets.iter_mut().zip(&written_in) {
            let Some(written_in) = written_in else {
                continue;
            };
            if *written_in != current {
                debug!(from = %written_in.display(), to = %current.display(), "Rebasing variants after folder move");
                asset.rebase(written_in, &current);
            }
            if let Some(missing) = asset.variants.values().find(|path| !path.is_file()) {
                return Err(PipelineError::FolderConflict {
                    path: missing.clone(),
                    message: "variant disappeared before commit".to_string(),
                });
            }
        }

        Ok(Committed { outcome, failures })
    }

    /// Run the codec on the blocking pool, bounded by the task deadline
    ///
    /// On timeout the blocking job is awaited before returning so that the
    /// worker slot is only released once the codec has stopped.
    async fn encode(&self, source_path: PathBuf, deadline: Instant) -> Result<VariantSet> {
        let codec = self.codec.clone();
        let format = self.optimization.target_format;
        let quality = self.optimization.quality_tier;
        let tiers = self.optimization.size_tiers.clone();
        let label = source_path.clone();
        let join_error = |e: tokio::task::JoinError| PipelineError::Decode {
            path: label.clone(),
            message: format!("codec task failed: {}", e),
        };

        let mut job =
            tokio::task::spawn_blocking(move || codec.optimize(&source_path, format, quality, &tiers));
        match tokio::time::timeout_at(deadline, &mut job).await {
            Ok(result) => result.map_err(join_error)?,
            Err(_) => {
                warn!(asset = %label.display(), "Codec exceeded the task deadline");
                let _ = job.await;
                Err(PipelineError::Timeout {
                    seconds: self.config.task_timeout_secs,
                })
            }
        }
    }

    /// Write variants, retrying once when the folder moved underneath
    async fn write(
        &self,
        entity: EntityRef,
        role: ImageRole,
        basename: &str,
        variants: &VariantSet,
    ) -> Result<Option<WrittenVariants>> {
        match self
            .folders
            .write_variants(entity, role, basename, variants)
            .await
        {
            Err(PipelineError::FolderConflict { path, message }) => {
                warn!(path = %path.display(), %message, "Folder conflict while writing, retrying");
                self.folders
                    .write_variants(entity, role, basename, variants)
                    .await
            }
            other => other,
        }
    }
}

/// Result of processing, before it is reconciled with the folder registry
struct Processed {
    outcome: TaskOutcome,
    failures: Vec<FailureRecord>,
    /// Entity directory each asset's variants were written into
    written_in: Vec<Option<PathBuf>>,
}

#[derive(Debug)]
struct Committed {
    outcome: TaskOutcome,
    failures: Vec<FailureRecord>,
}

/// Variant basenames for a task's assets
///
/// Sources of the same role whose stems collide (case-insensitively) get a
/// tag from their source path appended, so their variants never overwrite
/// each other.
fn variant_basenames(assets: &[ImageAsset]) -> Vec<Result<String>> {
    let stems: Vec<Result<String>> = assets.iter().map(ImageAsset::basename).collect();

    let mut counts: HashMap<(ImageRole, String), usize> = HashMap::new();
    for (asset, stem) in assets.iter().zip(&stems) {
        if let Ok(stem) = stem {
            *counts.entry((asset.role, stem.to_lowercase())).or_default() += 1;
        }
    }

    assets
        .iter()
        .zip(stems)
        .map(|(asset, stem)| {
            stem.map(|stem| {
                if counts[&(asset.role, stem.to_lowercase())] > 1 {
                    format!("{}-{}", stem, asset.source_tag())
                } else {
                    stem
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FolderConfig, ImageFormat, QualityTier, SizeTier, VariantLayout};
    use crate::models::VariantKey;
    use crate::queue::{QueueStats, RetryPolicy};
    use crate::sink::MemoryResultSink;
    use image::{DynamicImage, ImageBuffer, Rgb};
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        _dir: TempDir,
        media: PathBuf,
        queue: Arc<TaskQueue>,
        folders: Arc<FolderManager>,
        sink: Arc<MemoryResultSink>,
        pool: WorkerPool,
    }

    fn optimization() -> OptimizationConfig {
        OptimizationConfig {
            target_format: ImageFormat::WebP,
            quality_tier: QualityTier::Balanced,
            size_tiers: vec![SizeTier::new("small", 32, 32), SizeTier::new("large", 128, 128)],
            ..Default::default()
        }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            count: 2,
            max_attempts: 2,
            backoff_initial_ms: 0,
            backoff_max_secs: 0,
            poll_interval_ms: 20,
            ..Default::default()
        }
    }

    async fn harness() -> Harness {
        harness_with(worker_config()).await
    }

    async fn harness_with(config: WorkerConfig) -> Harness {
        let dir = tempdir().unwrap();
        let media = dir.path().join("media");
        let queue = Arc::new(
            TaskQueue::open(&dir.path().join("queue"), RetryPolicy::from_config(&config))
                .await
                .unwrap(),
        );
        let folders = Arc::new(
            FolderManager::open(&media, VariantLayout::Suffixed, FolderConfig::default())
                .await
                .unwrap(),
        );
        let sink = Arc::new(MemoryResultSink::new());
        let pool = WorkerPool::new(
            queue.clone(),
            folders.clone(),
            sink.clone(),
            optimization(),
            config.clone(),
            Arc::new(WorkerBoard::new(config.count)),
        );
        Harness {
            _dir: dir,
            media,
            queue,
            folders,
            sink,
            pool,
        }
    }

    fn write_png(path: &Path, width: u32, height: u32) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([x as u8, y as u8, 128])
        }))
        .save_with_format(path, image::ImageFormat::Png)
        .unwrap();
    }

    #[tokio::test]
    async fn test_drain_writes_variants_and_persists() {
        let h = harness().await;
        let entity = EntityRef::Project(1);
        let handle = h.folders.prepare(entity, "Sea View").await.unwrap().handle;
        let source = handle.role_dir(ImageRole::Primary).join("front.png");
        write_png(&source, 300, 200);

        h.queue
            .enqueue(OptimizationTask::new(entity, vec![ImageAsset::primary(&source)]))
            .await
            .unwrap();
        assert_eq!(h.pool.drain().await.unwrap(), 1);

        let small = handle.variant_path(
            ImageRole::Primary,
            "front",
            &VariantKey::new("small", ImageFormat::WebP),
        );
        let decoded = image::open(&small).unwrap();
        assert!(decoded.width() <= 32 && decoded.height() <= 32);

        let assets = h.sink.assets_for(entity).await.unwrap();
        assert_eq!(assets[0].variants.len(), 2);
        assert_eq!(h.queue.stats(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_bad_asset_does_not_block_others() {
        let h = harness().await;
        let entity = EntityRef::Service(2);
        let handle = h.folders.prepare(entity, "Decks").await.unwrap().handle;
        let good = handle.role_dir(ImageRole::Album).join("good.png");
        let bad = handle.role_dir(ImageRole::Album).join("bad.jpg");
        write_png(&good, 64, 64);
        std::fs::write(&bad, b"not an image at all").unwrap();

        h.queue
            .enqueue(OptimizationTask::new(
                entity,
                vec![ImageAsset::album(&bad), ImageAsset::album(&good)],
            ))
            .await
            .unwrap();
        h.pool.drain().await.unwrap();

        let assets = h.sink.assets_for(entity).await.unwrap();
        assert!(assets[0].variants.is_empty());
        assert_eq!(assets[1].variants.len(), 2);

        let failures = h.queue.failures().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].asset.as_deref(), Some(bad.as_path()));
        assert_eq!(h.queue.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_sink_failure_is_retried() {
        let h = harness().await;
        let entity = EntityRef::Project(3);
        let handle = h.folders.prepare(entity, "Retry Me").await.unwrap().handle;
        let source = handle.role_dir(ImageRole::Primary).join("a.png");
        write_png(&source, 40, 40);

        h.sink.fail_next(1);
        h.queue
            .enqueue(OptimizationTask::new(entity, vec![ImageAsset::primary(&source)]))
            .await
            .unwrap();

        // First attempt nacks, immediate retry succeeds
        assert_eq!(h.pool.drain().await.unwrap(), 2);
        assert_eq!(h.sink.persisted_count(), 1);
        assert_eq!(h.queue.stats(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_missing_source_exhausts_retries() {
        let h = harness().await;
        let entity = EntityRef::Project(4);
        h.folders.prepare(entity, "Ghost").await.unwrap();
        let missing = h.media.join("nowhere.png");

        h.queue
            .enqueue(OptimizationTask::new(entity, vec![ImageAsset::primary(&missing)]))
            .await
            .unwrap();
        assert_eq!(h.pool.drain().await.unwrap(), 2);

        let failures = h.queue.failures().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, "transient_io");
        assert_eq!(failures[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_deleted_entity_task_is_skipped() {
        let h = harness().await;
        let entity = EntityRef::Project(5);
        let handle = h.folders.prepare(entity, "Temporary").await.unwrap().handle;
        let source = handle.role_dir(ImageRole::Primary).join("a.png");
        write_png(&source, 40, 40);
        h.queue
            .enqueue(OptimizationTask::new(entity, vec![ImageAsset::primary(&source)]))
            .await
            .unwrap();

        h.folders.delete(&handle).await.unwrap();
        assert_eq!(h.pool.drain().await.unwrap(), 1);

        assert!(!handle.entity_dir().exists());
        assert!(h.sink.assets_for(entity).await.is_none());
        assert_eq!(h.queue.stats(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_pool_processes_in_background() {
        let h = harness().await;
        let entity = EntityRef::Project(6);
        let handle = h.folders.prepare(entity, "Background").await.unwrap().handle;
        let source = handle.role_dir(ImageRole::Primary).join("a.png");
        write_png(&source, 50, 50);

        h.pool.start().await.unwrap();
        assert!(h.pool.is_running());
        h.queue
            .enqueue(OptimizationTask::new(entity, vec![ImageAsset::primary(&source)]))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        while h.sink.persisted_count() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        h.pool.shutdown().await;

        assert_eq!(h.sink.persisted_count(), 1);
        assert!(!h.pool.is_running());
    }

    #[tokio::test]
    async fn test_equal_stems_get_separate_variants() {
        let h = harness().await;
        let entity = EntityRef::Project(7);
        let handle = h.folders.prepare(entity, "Twins").await.unwrap().handle;
        let uploads = h.media.parent().unwrap().join("uploads");
        let wide = uploads.join("a").join("photo.png");
        let tall = uploads.join("b").join("Photo.png");
        write_png(&wide, 40, 30);
        write_png(&tall, 30, 40);

        h.queue
            .enqueue(OptimizationTask::new(
                entity,
                vec![ImageAsset::album(&wide), ImageAsset::album(&tall)],
            ))
            .await
            .unwrap();
        h.pool.drain().await.unwrap();

        let assets = h.sink.assets_for(entity).await.unwrap();
        let key = VariantKey::new("small", ImageFormat::WebP);
        let wide_small = &assets[0].variants[&key];
        let tall_small = &assets[1].variants[&key];
        assert_ne!(wide_small, tall_small);
        assert!(wide_small.starts_with(handle.variant_dir(ImageRole::Album)));

        let (width, height) = image::image_dimensions(wide_small).unwrap();
        assert!(width > height, "wide source keeps its own variant");
        let (width, height) = image::image_dimensions(tall_small).unwrap();
        assert!(height > width, "tall source keeps its own variant");
    }

    #[test]
    fn test_variant_basenames_only_tag_collisions() {
        let assets = vec![
            ImageAsset::primary("/u/a/photo.png"),
            ImageAsset::album("/u/a/photo.png"),
            ImageAsset::album("/u/b/PHOTO.jpg"),
            ImageAsset::album("/u/c/other.png"),
        ];
        let names: Vec<String> = variant_basenames(&assets)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(names[0], "photo");
        assert_eq!(names[1], format!("photo-{}", assets[1].source_tag()));
        assert_eq!(names[2], format!("PHOTO-{}", assets[2].source_tag()));
        assert_eq!(names[3], "other");
    }

    #[tokio::test]
    async fn test_rename_before_commit_rebases_paths() {
        let h = harness().await;
        let entity = EntityRef::Project(8);
        let old = h.folders.prepare(entity, "Old Name").await.unwrap().handle;
        let source = old.role_dir(ImageRole::Primary).join("front.png");
        write_png(&source, 60, 40);
        let task = OptimizationTask::new(entity, vec![ImageAsset::primary(&source)]);

        let context = &h.pool.context;
        let processed = context.process(0, &task).await.unwrap();

        let new = h.folders.resolve(entity, "New Name").await.unwrap();
        h.folders.rename(&old, &new).await.unwrap();

        let guard = h.folders.lock(entity).await;
        let committed = context.commit(&guard, processed).await.unwrap();
        drop(guard);

        let asset = &committed.outcome.assets[0];
        assert!(!committed.outcome.skipped);
        assert!(asset.source_path.starts_with(new.entity_dir()));
        assert_eq!(asset.variants.len(), 2);
        for path in asset.variants.values() {
            assert!(path.starts_with(new.entity_dir()));
            assert!(path.is_file());
        }
    }

    #[tokio::test]
    async fn test_delete_before_commit_skips() {
        let h = harness().await;
        let entity = EntityRef::Service(9);
        let handle = h.folders.prepare(entity, "Brief").await.unwrap().handle;
        let source = handle.role_dir(ImageRole::Album).join("a.png");
        write_png(&source, 40, 40);
        let task = OptimizationTask::new(entity, vec![ImageAsset::album(&source)]);

        let context = &h.pool.context;
        let processed = context.process(0, &task).await.unwrap();
        h.folders.delete(&handle).await.unwrap();

        let guard = h.folders.lock(entity).await;
        let committed = context.commit(&guard, processed).await.unwrap();
        assert!(committed.outcome.skipped);
        assert!(committed.failures.is_empty());
    }

    #[tokio::test]
    async fn test_folder_recreated_before_commit_retries() {
        let h = harness().await;
        let entity = EntityRef::Project(10);
        let handle = h.folders.prepare(entity, "Again").await.unwrap().handle;
        let source = h.media.parent().unwrap().join("uploads").join("a.png");
        write_png(&source, 40, 40);
        let task = OptimizationTask::new(entity, vec![ImageAsset::primary(&source)]);

        let context = &h.pool.context;
        let processed = context.process(0, &task).await.unwrap();
        h.folders.delete(&handle).await.unwrap();
        h.folders.prepare(entity, "Again").await.unwrap();

        let guard = h.folders.lock(entity).await;
        let err = context.commit(&guard, processed).await.unwrap_err();
        assert_eq!(err.error_type(), "folder_conflict");
    }

    #[tokio::test]
    async fn test_codec_past_deadline_times_out_cleanly() {
        let h = harness_with(WorkerConfig {
            max_attempts: 1,
            task_timeout_secs: 0,
            ..worker_config()
        })
        .await;
        let entity = EntityRef::Project(11);
        let handle = h.folders.prepare(entity, "Slow").await.unwrap().handle;
        let source = handle.role_dir(ImageRole::Primary).join("big.png");
        write_png(&source, 1200, 1200);

        h.queue
            .enqueue(OptimizationTask::new(entity, vec![ImageAsset::primary(&source)]))
            .await
            .unwrap();
        assert_eq!(h.pool.drain().await.unwrap(), 1);

        let failures = h.queue.failures().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, "timeout");
        assert!(h.sink.assets_for(entity).await.is_none());

        let leftovers: Vec<_> = walkdir::WalkDir::new(handle.entity_dir())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
        assert!(!handle
            .variant_path(ImageRole::Primary, "big", &VariantKey::new("small", ImageFormat::WebP))
            .exists());
    }
}
