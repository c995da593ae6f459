//! Durable task queue for optimization work
//!
//! Every task lives in its own JSON file under `{dir}/tasks/` until a worker
//! acknowledges it, so a crash never loses queued work. Tasks that exhaust
//! their attempts are appended to `{dir}/failed.jsonl`.

use crate::config::WorkerConfig;
use crate::error::{PipelineError, Result};
use crate::models::{EntityRef, FailureRecord, OptimizationTask, TaskId};
use crate::utils::file;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

const TASKS_DIR: &str = "tasks";
const FAILED_LOG: &str = "failed.jsonl";
const LOCK_FILE: &str = ".lock";
const EVENT_CAPACITY: usize = 256;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.backoff_initial_ms),
            max_delay: Duration::from_secs(config.backoff_max_secs),
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    /// Delay before the next attempt, with exponential backoff
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

/// Claim state of a persisted entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Claimed { claimed_at: DateTime<Utc> },
}

/// One persisted queue entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task: OptimizationTask,
    /// Position in FIFO order, kept across coalescing and retries
    pub seq: u64,
    #[serde(flatten)]
    pub state: EntryState,
    /// Earliest time a retry may be claimed
    pub not_before: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueueEntry {
    fn is_pending(&self) -> bool {
        self.state == EntryState::Pending
    }

    fn is_claimed(&self) -> bool {
        matches!(self.state, EntryState::Claimed { .. })
    }
}

/// Queue lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued { task_id: TaskId, entity: EntityRef },
    Coalesced { task_id: TaskId, entity: EntityRef },
    Claimed { task_id: TaskId, entity: EntityRef, attempt: u32 },
    Acked { task_id: TaskId, entity: EntityRef },
    Requeued { task_id: TaskId, entity: EntityRef, attempt: u32, retry_at: DateTime<Utc> },
    Failed { task_id: TaskId, entity: EntityRef, kind: String },
    Recovered { task_id: TaskId, entity: EntityRef },
    Cancelled { task_id: TaskId, entity: EntityRef },
}

/// What happened to a nacked task
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    Requeued { attempt: u32, retry_at: DateTime<Utc> },
    Failed,
    /// A newer request for the same entity is already pending
    Superseded,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub claimed: usize,
    pub failed: usize,
}

/// Lock-free counters mirrored from the queue state
#[derive(Debug, Default)]
pub struct QueueCounters {
    queued: AtomicUsize,
    claimed: AtomicUsize,
    failed: AtomicUsize,
}

impl QueueCounters {
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn claimed(&self) -> usize {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.queued(),
            claimed: self.claimed(),
            failed: self.failed(),
        }
    }
}

/// Exclusive hold on a queue directory, released on drop
struct DirLock {
    file: std::fs::File,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// On-disk layout of a queue directory
#[derive(Debug)]
struct QueueStorage {
    tasks_dir: PathBuf,
    failed_path: PathBuf,
    lock_path: PathBuf,
}

impl QueueStorage {
    fn new(dir: &Path) -> Self {
        Self {
            tasks_dir: dir.join(TASKS_DIR),
            failed_path: dir.join(FAILED_LOG),
            lock_path: dir.join(LOCK_FILE),
        }
    }

    /// Advisory lock shared by every process using this directory
    ///
    /// Held around read-modify-write of entries another process may also
    /// touch. Always taken after the in-process state lock.
    async fn lock(&self) -> Result<DirLock> {
        let path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<DirLock> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(DirLock { file })
        })
        .await
        .map_err(|e| PipelineError::QueueUnavailable {
            message: format!("Queue lock task failed: {}", e),
        })?
        .map_err(|e| PipelineError::queue_io("Failed to lock queue directory", e))
    }

    fn entry_path(&self, task_id: TaskId) -> PathBuf {
        self.tasks_dir.join(format!("{}.json", task_id))
    }

    async fn save(&self, entry: &QueueEntry) -> Result<()> {
        let json = serde_json::to_vec_pretty(entry)?;
        file::write_atomic(&self.entry_path(entry.task.id), &json, true)
            .await
            .map_err(|e| PipelineError::queue_io("Failed to write task entry", e))
    }

    /// Current on-disk state of one entry; `None` when gone or unreadable
    async fn load(&self, task_id: TaskId) -> Result<Option<QueueEntry>> {
        let path = self.entry_path(task_id);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::queue_io("Failed to read task entry", e)),
        };
        match serde_json::from_slice(&content) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Unreadable task entry");
                Ok(None)
            }
        }
    }

    async fn remove(&self, task_id: TaskId) -> Result<()> {
        match tokio::fs::remove_file(self.entry_path(task_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::queue_io("Failed to remove task entry", e)),
        }
    }

    async fn load_all(&self) -> Result<Vec<QueueEntry>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.tasks_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(PipelineError::queue_io("Failed to read task directory", e)),
        };

        while let Some(dir_entry) = dir
            .next_entry()
            .await
            .map_err(|e| PipelineError::queue_io("Failed to read task directory entry", e))?
        {
            let path = dir_entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let loaded = match tokio::fs::read(&path).await {
                Ok(content) => serde_json::from_slice::<QueueEntry>(&content).map_err(|e| e.to_string()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => Err(e.to_string()),
            };
            match loaded {
                Ok(entry) => entries.push(entry),
                Err(e) => error!(path = %path.display(), error = %e, "Skipping unreadable task entry"),
            }
        }

        entries.sort_by_key(|entry| entry.seq);
        Ok(entries)
    }

    async fn append_failure(&self, record: &FailureRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.failed_path)
            .await
            .map_err(|e| PipelineError::queue_io("Failed to open failure log", e))?;
        log.write_all(&line)
            .await
            .map_err(|e| PipelineError::queue_io("Failed to append failure log", e))?;
        log.sync_data()
            .await
            .map_err(|e| PipelineError::queue_io("Failed to sync failure log", e))
    }

    async fn read_failures(&self) -> Result<Vec<FailureRecord>> {
        let content = match tokio::fs::read_to_string(&self.failed_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::queue_io("Failed to read failure log", e)),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed failure log line");
                    None
                }
            })
            .collect())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<TaskId, QueueEntry>,
    /// Pending entries in FIFO order
    pending: BTreeSet<(u64, TaskId)>,
    next_seq: u64,
    failed: usize,
}

impl QueueState {
    fn insert(&mut self, entry: QueueEntry) {
        self.next_seq = self.next_seq.max(entry.seq + 1);
        if entry.is_pending() {
            self.pending.insert((entry.seq, entry.task.id));
        }
        self.entries.insert(entry.task.id, entry);
    }

    fn remove(&mut self, task_id: TaskId) -> Option<QueueEntry> {
        let entry = self.entries.remove(&task_id)?;
        self.pending.remove(&(entry.seq, task_id));
        Some(entry)
    }

    fn pending_for(&self, entity: EntityRef, except: Option<TaskId>) -> Option<TaskId> {
        self.pending
            .iter()
            .map(|(_, id)| *id)
            .find(|id| Some(*id) != except && self.entries[id].task.entity == entity)
    }

    fn claimed_count(&self) -> usize {
        self.entries.len() - self.pending.len()
    }
}

/// Durable FIFO of optimization tasks
pub struct TaskQueue {
    dir: PathBuf,
    storage: QueueStorage,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
    counters: Arc<QueueCounters>,
    notify: Notify,
    events: broadcast::Sender<QueueEvent>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("dir", &self.dir)
            .field("stats", &self.counters.stats())
            .finish()
    }
}

impl TaskQueue {
    /// Open a queue directory, loading persisted entries and the failure count
    #[instrument(skip(policy))]
    pub async fn open(dir: &Path, policy: RetryPolicy) -> Result<Self> {
        let storage = QueueStorage::new(dir);
        tokio::fs::create_dir_all(&storage.tasks_dir)
            .await
            .map_err(|e| PipelineError::queue_io("Failed to create queue directory", e))?;

        let mut state = QueueState::default();
        for entry in storage.load_all().await? {
            state.insert(entry);
        }
        state.failed = storage.read_failures().await?.len();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let queue = Self {
            dir: dir.to_path_buf(),
            storage,
            policy,
            state: Mutex::new(state),
            counters: Arc::new(QueueCounters::default()),
            notify: Notify::new(),
            events,
            closed: AtomicBool::new(false),
        };

        {
            let state = queue.state.lock().await;
            queue.sync_counters(&state);
            info!(
                pending = state.pending.len(),
                claimed = state.claimed_count(),
                failed = state.failed,
                "Opened task queue"
            );
        }
        Ok(queue)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Shared counters for status reporting
    pub fn counters(&self) -> Arc<QueueCounters> {
        self.counters.clone()
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.stats()
    }

    /// Receive queue lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn sync_counters(&self, state: &QueueState) {
        self.counters
            .queued
            .store(state.pending.len(), Ordering::Release);
        self.counters
            .claimed
            .store(state.claimed_count(), Ordering::Release);
        self.counters.failed.store(state.failed, Ordering::Release);
    }

    /// Stop accepting new work; claimed tasks still complete
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Durably add a task, coalescing with a pending task for the same entity
    #[instrument(skip(self, task), fields(entity = %task.entity))]
    pub async fn enqueue(&self, task: OptimizationTask) -> Result<TaskId> {
        if self.is_closed() {
            return Err(PipelineError::QueueClosed);
        }

        let mut state = self.state.lock().await;
        let dir_lock = self.storage.lock().await?;

        while let Some(existing_id) = state.pending_for(task.entity, None) {
            // Another process sharing the directory may have claimed or
            // finished it since this view was loaded
            let mut entry = match self.storage.load(existing_id).await? {
                Some(on_disk) if on_disk.is_pending() => on_disk,
                on_disk => {
                    debug!(task_id = %existing_id, "Pending task changed on disk, not coalescing");
                    state.remove(existing_id);
                    if let Some(on_disk) = on_disk {
                        state.insert(on_disk);
                    }
                    self.sync_counters(&state);
                    continue;
                }
            };
            entry.task.assets = task.assets;
            entry.task.requested_at = task.requested_at;
            entry.task.attempt_count = 0;
            entry.not_before = None;
            entry.last_error = None;
            self.storage.save(&entry).await?;

            let entity = entry.task.entity;
            state.remove(existing_id);
            state.insert(entry);
            self.sync_counters(&state);
            drop(dir_lock);
            drop(state);

            debug!(task_id = %existing_id, "Coalesced with pending task");
            self.emit(QueueEvent::Coalesced {
                task_id: existing_id,
                entity,
            });
            self.notify.notify_one();
            return Ok(existing_id);
        }

        let entry = QueueEntry {
            seq: state.next_seq,
            task,
            state: EntryState::Pending,
            not_before: None,
            last_error: None,
        };
        self.storage.save(&entry).await?;

        let (task_id, entity) = (entry.task.id, entry.task.entity);
        state.insert(entry);
        self.sync_counters(&state);
        drop(dir_lock);
        drop(state);

        info!(task_id = %task_id, "Task enqueued");
        self.emit(QueueEvent::Enqueued { task_id, entity });
        self.notify.notify_one();
        Ok(task_id)
    }

    /// Claim the oldest eligible task without waiting
    ///
    /// Tasks in backoff and tasks whose entity already has a claimed task are
    /// skipped.
    pub async fn dequeue(&self, max_concurrency: usize) -> Result<Option<OptimizationTask>> {
        let mut state = self.state.lock().await;
        if state.claimed_count() >= max_concurrency {
            return Ok(None);
        }
        let dir_lock = self.storage.lock().await?;

        let now = Utc::now();
        let mut busy: HashSet<EntityRef> = state
            .entries
            .values()
            .filter(|entry| entry.is_claimed())
            .map(|entry| entry.task.entity)
            .collect();

        let (task_id, mut entry) = loop {
            let mut chosen = None;
            for (_, task_id) in &state.pending {
                let entry = &state.entries[task_id];
                // Later tasks of a skipped entity must not overtake it
                if !busy.insert(entry.task.entity) {
                    continue;
                }
                if entry.not_before.is_some_and(|t| t > now) {
                    continue;
                }
                chosen = Some(*task_id);
                break;
            }
            let Some(task_id) = chosen else {
                return Ok(None);
            };

            // Pick up a coalesce or claim written by another process
            match self.storage.load(task_id).await? {
                Some(on_disk) if on_disk.is_pending() && on_disk.not_before.map_or(true, |t| t <= now) => {
                    break (task_id, on_disk);
                }
                on_disk => {
                    debug!(task_id = %task_id, "Task changed on disk, re-selecting");
                    state.remove(task_id);
                    if let Some(on_disk) = on_disk {
                        state.insert(on_disk);
                    }
                    self.sync_counters(&state);
                    if state.claimed_count() >= max_concurrency {
                        return Ok(None);
                    }
                    busy = state
                        .entries
                        .values()
                        .filter(|entry| entry.is_claimed())
                        .map(|entry| entry.task.entity)
                        .collect();
                }
            }
        };

        entry.state = EntryState::Claimed { claimed_at: now };
        self.storage.save(&entry).await?;

        let task = entry.task.clone();
        state.remove(task_id);
        state.insert(entry);
        self.sync_counters(&state);
        drop(dir_lock);
        drop(state);

        debug!(task_id = %task_id, entity = %task.entity, attempt = task.attempt_count, "Task claimed");
        self.emit(QueueEvent::Claimed {
            task_id,
            entity: task.entity,
            attempt: task.attempt_count,
        });
        Ok(Some(task))
    }

    /// Claim a task, waiting up to `timeout` for one to become available
    pub async fn dequeue_wait(
        &self,
        max_concurrency: usize,
        timeout: Duration,
    ) -> Result<Option<OptimizationTask>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.dequeue(max_concurrency).await? {
                return Ok(Some(task));
            }
            if self.is_closed() {
                return Ok(None);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut wait = deadline - now;
            if let Some(ready_in) = self.next_retry_in().await {
                wait = wait.min(ready_in);
            }
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Time until the earliest backed-off task becomes eligible
    async fn next_retry_in(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        let now = Utc::now();
        state
            .pending
            .iter()
            .filter_map(|(_, id)| state.entries[id].not_before)
            .filter(|t| *t > now)
            .min()
            .and_then(|t| (t - now).to_std().ok())
    }

    fn claimed_entry(state: &QueueState, task_id: TaskId) -> Result<QueueEntry> {
        state
            .entries
            .get(&task_id)
            .filter(|entry| entry.is_claimed())
            .cloned()
            .ok_or(PipelineError::TaskNotFound { task_id })
    }

    /// Remove a completed task
    pub async fn ack(&self, task_id: TaskId) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = Self::claimed_entry(&state, task_id)?;
        self.storage.remove(task_id).await?;
        state.remove(task_id);
        self.sync_counters(&state);
        drop(state);

        debug!(task_id = %task_id, "Task acknowledged");
        self.emit(QueueEvent::Acked {
            task_id,
            entity: entry.task.entity,
        });
        self.notify.notify_waiters();
        Ok(())
    }

    /// Report a failed attempt
    ///
    /// Retryable errors requeue with backoff until the attempt budget is used
    /// up; everything else moves the task to the failure log.
    #[instrument(skip(self, failure), fields(kind = failure.error_type()))]
    pub async fn nack(&self, task_id: TaskId, failure: &PipelineError) -> Result<NackOutcome> {
        let mut state = self.state.lock().await;
        let mut entry = Self::claimed_entry(&state, task_id)?;
        entry.task.attempt_count += 1;
        let entity = entry.task.entity;

        if state.pending_for(entity, Some(task_id)).is_some() {
            self.storage.remove(task_id).await?;
            state.remove(task_id);
            self.sync_counters(&state);
            drop(state);

            debug!(task_id = %task_id, "Dropping failed task superseded by a newer request");
            self.emit(QueueEvent::Cancelled { task_id, entity });
            self.notify.notify_waiters();
            return Ok(NackOutcome::Superseded);
        }

        if failure.is_retryable() && entry.task.attempt_count < self.policy.max_attempts {
            let attempt = entry.task.attempt_count;
            let retry_at = Utc::now()
                + chrono::Duration::from_std(self.policy.delay_for(attempt))
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
            entry.state = EntryState::Pending;
            entry.not_before = Some(retry_at);
            entry.last_error = Some(failure.to_string());
            self.storage.save(&entry).await?;

            state.remove(task_id);
            state.insert(entry);
            self.sync_counters(&state);
            drop(state);

            warn!(task_id = %task_id, attempt, %retry_at, error = %failure, "Task failed, retrying later");
            self.emit(QueueEvent::Requeued {
                task_id,
                entity,
                attempt,
                retry_at,
            });
            self.notify.notify_waiters();
            return Ok(NackOutcome::Requeued { attempt, retry_at });
        }

        let record = FailureRecord::from_error(&entry.task, None, failure);
        self.fail_locked(&mut state, &entry, record).await?;
        drop(state);
        self.notify.notify_waiters();
        Ok(NackOutcome::Failed)
    }

    async fn fail_locked(
        &self,
        state: &mut QueueState,
        entry: &QueueEntry,
        record: FailureRecord,
    ) -> Result<()> {
        let task_id = entry.task.id;
        self.storage.append_failure(&record).await?;
        self.storage.remove(task_id).await?;
        state.remove(task_id);
        state.failed += 1;
        self.sync_counters(state);

        error!(
            task_id = %task_id,
            entity = %record.entity,
            attempts = record.attempts,
            kind = %record.kind,
            message = %record.message,
            "Task failed permanently"
        );
        self.emit(QueueEvent::Failed {
            task_id,
            entity: record.entity,
            kind: record.kind,
        });
        Ok(())
    }

    /// Requeue every claim left behind by a previous process
    ///
    /// Call once at startup before workers run. Each recovered task counts
    /// one attempt.
    pub async fn recover_claims(&self) -> Result<usize> {
        self.release_claims(None).await
    }

    /// Requeue claims older than `older_than` whose worker went away
    pub async fn sweep_stale_claims(&self, older_than: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(older_than).map_err(|e| PipelineError::InvalidInput {
            message: format!("Invalid claim age: {}", e),
        })?;
        self.release_claims(Some(Utc::now() - age)).await
    }

    async fn release_claims(&self, claimed_before: Option<DateTime<Utc>>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let _dir_lock = self.storage.lock().await?;
        let mut stale: Vec<QueueEntry> = state
            .entries
            .values()
            .filter(|entry| match (&entry.state, claimed_before) {
                (EntryState::Claimed { .. }, None) => true,
                (EntryState::Claimed { claimed_at }, Some(cutoff)) => *claimed_at < cutoff,
                _ => false,
            })
            .cloned()
            .collect();
        stale.sort_by_key(|entry| entry.seq);

        let mut released = 0;
        for mut entry in stale {
            let task_id = entry.task.id;
            let entity = entry.task.entity;
            entry.task.attempt_count += 1;

            if state.pending_for(entity, Some(task_id)).is_some() {
                self.storage.remove(task_id).await?;
                state.remove(task_id);
                self.emit(QueueEvent::Cancelled { task_id, entity });
                continue;
            }

            if entry.task.attempt_count >= self.policy.max_attempts {
                let record = FailureRecord {
                    task_id,
                    entity,
                    asset: None,
                    kind: "abandoned".to_string(),
                    message: "worker stopped while processing the task".to_string(),
                    attempts: entry.task.attempt_count,
                    failed_at: Utc::now(),
                };
                self.fail_locked(&mut state, &entry, record).await?;
                continue;
            }

            entry.state = EntryState::Pending;
            entry.not_before = None;
            entry.last_error = Some("claim released after worker loss".to_string());
            self.storage.save(&entry).await?;
            state.remove(task_id);
            state.insert(entry);
            released += 1;

            warn!(task_id = %task_id, entity = %entity, "Requeued abandoned claim");
            self.emit(QueueEvent::Recovered { task_id, entity });
        }

        self.sync_counters(&state);
        drop(state);
        if released > 0 {
            self.notify.notify_waiters();
        }
        Ok(released)
    }

    /// Drop pending tasks for an entity
    pub async fn cancel_entity(&self, entity: EntityRef) -> Result<usize> {
        let mut state = self.state.lock().await;
        let _dir_lock = self.storage.lock().await?;
        let doomed: Vec<TaskId> = state
            .pending
            .iter()
            .map(|(_, id)| *id)
            .filter(|id| state.entries[id].task.entity == entity)
            .collect();

        for task_id in &doomed {
            self.storage.remove(*task_id).await?;
            state.remove(*task_id);
            self.emit(QueueEvent::Cancelled {
                task_id: *task_id,
                entity,
            });
        }
        self.sync_counters(&state);

        if !doomed.is_empty() {
            info!(entity = %entity, count = doomed.len(), "Cancelled pending tasks");
        }
        Ok(doomed.len())
    }

    /// Rewrite asset paths of queued tasks after the entity folder moved
    pub async fn rebase_entity(
        &self,
        entity: EntityRef,
        old_dir: &Path,
        new_dir: &Path,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        let _dir_lock = self.storage.lock().await?;
        let affected: Vec<TaskId> = state
            .entries
            .values()
            .filter(|entry| entry.task.entity == entity)
            .map(|entry| entry.task.id)
            .collect();

        let mut rebased = 0;
        for task_id in affected {
            let mut entry = state.entries[&task_id].clone();
            let mut changed = false;
            for asset in &mut entry.task.assets {
                changed |= asset.rebase(old_dir, new_dir);
            }
            if changed {
                self.storage.save(&entry).await?;
                state.remove(task_id);
                state.insert(entry);
                rebased += 1;
            }
        }

        debug!(entity = %entity, rebased, "Rebased queued asset paths");
        Ok(rebased)
    }

    /// Pick up changes other processes made to the queue directory
    ///
    /// New and updated pending entries are adopted, pending entries whose file
    /// vanished are dropped. Claims are owned by this process and left alone.
    pub async fn refresh(&self) -> Result<usize> {
        // Scan under the lock so an ack racing with the scan is not undone
        let mut state = self.state.lock().await;
        let on_disk = self.storage.load_all().await?;
        let mut changes = 0;

        let disk_ids: HashSet<TaskId> = on_disk.iter().map(|entry| entry.task.id).collect();
        let vanished: Vec<TaskId> = state
            .pending
            .iter()
            .map(|(_, id)| *id)
            .filter(|id| !disk_ids.contains(id))
            .collect();
        for task_id in vanished {
            state.remove(task_id);
            changes += 1;
        }

        for entry in on_disk {
            let adopt = match state.entries.get(&entry.task.id) {
                None => true,
                Some(known) => {
                    known.is_pending()
                        && (known.task.assets != entry.task.assets
                            || known.task.attempt_count != entry.task.attempt_count)
                }
            };
            if adopt {
                state.remove(entry.task.id);
                state.insert(entry);
                changes += 1;
            }
        }

        self.sync_counters(&state);
        drop(state);
        if changes > 0 {
            debug!(changes, "Refreshed queue from disk");
            self.notify.notify_waiters();
        }
        Ok(changes)
    }

    /// Append an asset-level failure to the failure log
    pub async fn record_failure(&self, record: FailureRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        self.storage.append_failure(&record).await?;
        state.failed += 1;
        self.sync_counters(&state);
        drop(state);

        error!(
            task_id = %record.task_id,
            entity = %record.entity,
            asset = ?record.asset,
            kind = %record.kind,
            message = %record.message,
            "Asset failed permanently"
        );
        self.emit(QueueEvent::Failed {
            task_id: record.task_id,
            entity: record.entity,
            kind: record.kind,
        });
        Ok(())
    }

    /// Read the permanent failure log
    pub async fn failures(&self) -> Result<Vec<FailureRecord>> {
        self.storage.read_failures().await
    }

    /// Snapshot of all entries in FIFO order
    pub async fn entries(&self) -> Vec<QueueEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<QueueEntry> = state.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }

    /// Summarize a queue directory without opening it for writing
    pub async fn inspect(dir: &Path) -> Result<QueueStats> {
        let storage = QueueStorage::new(dir);
        let entries = storage.load_all().await?;
        let claimed = entries.iter().filter(|entry| entry.is_claimed()).count();

        Ok(QueueStats {
            queued: entries.len() - claimed,
            claimed,
            failed: storage.read_failures().await?.len(),
        })
    }
}
