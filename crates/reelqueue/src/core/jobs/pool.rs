//! Worker Pool Module
//!
//! Bounded pools of worker tasks that execute queued jobs in priority order.
//! A job that has started running is never preempted.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::task::{scope_current_job, TaskContext};
use super::{JobType, Priority, Task, TaskError, TaskHandle};

/// Upper bound for any pool size
pub const MAX_WORKERS: usize = 64;

/// Default size of the constrained pool
pub const DEFAULT_CONSTRAINED_WORKERS: usize = 2;

/// Cap on the default general pool size
const GENERAL_WORKERS_CAP: usize = 4;

// =============================================================================
// Pool Configuration
// =============================================================================

/// Which pool a job is routed to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PoolKind {
    /// Default pool for most job types
    General,
    /// Small pool for job types contending for encoder or GPU sessions
    Constrained,
}

/// Pool sizing and routing policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Workers in the general pool
    #[serde(default = "default_general_workers")]
    pub general_workers: usize,

    /// Workers in the constrained pool
    #[serde(default = "default_constrained_workers")]
    pub constrained_workers: usize,

    /// Job types routed to the constrained pool
    #[serde(default = "default_constrained_types")]
    pub constrained_types: Vec<JobType>,
}

fn default_general_workers() -> usize {
    general_workers_for(num_cpus::get())
}

fn default_constrained_workers() -> usize {
    DEFAULT_CONSTRAINED_WORKERS
}

fn default_constrained_types() -> Vec<JobType> {
    vec![JobType::Proxy, JobType::Transcode]
}

/// General pool size for a machine with `cpus` execution units.
///
/// One unit stays free for the interactive foreground.
pub(crate) fn general_workers_for(cpus: usize) -> usize {
    cpus.saturating_sub(1).clamp(1, GENERAL_WORKERS_CAP)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            general_workers: default_general_workers(),
            constrained_workers: default_constrained_workers(),
            constrained_types: default_constrained_types(),
        }
    }
}

impl PoolConfig {
    pub fn with_general_workers(mut self, workers: usize) -> Self {
        self.general_workers = workers;
        self
    }

    pub fn with_constrained_workers(mut self, workers: usize) -> Self {
        self.constrained_workers = workers;
        self
    }

    pub fn with_constrained_types(mut self, types: Vec<JobType>) -> Self {
        self.constrained_types = types;
        self
    }

    /// Pool that executes jobs of `job_type`
    pub fn pool_for(&self, job_type: JobType) -> PoolKind {
        if self.constrained_types.contains(&job_type) {
            PoolKind::Constrained
        } else {
            PoolKind::General
        }
    }

    /// Clamps worker counts into `1..=MAX_WORKERS` and drops duplicate types
    pub fn normalize(&mut self) {
        self.general_workers = self.general_workers.clamp(1, MAX_WORKERS);
        self.constrained_workers = self.constrained_workers.clamp(1, MAX_WORKERS);

        let mut seen = Vec::with_capacity(self.constrained_types.len());
        self.constrained_types.retain(|t| {
            if seen.contains(t) {
                false
            } else {
                seen.push(*t);
                true
            }
        });
    }
}

// =============================================================================
// Queued Jobs
// =============================================================================

/// Callback run once a job's lifecycle ends, before waiters are released
pub(crate) type CompletionFn = Box<dyn FnOnce(&Arc<TaskHandle>) + Send>;

/// A submitted job: its body, its control block and its completion callback.
///
/// Consuming `run` or `finish_unstarted` is the only way to end a job, so the
/// completion callback fires exactly once.
pub(crate) struct QueuedJob {
    handle: Arc<TaskHandle>,
    task: Box<dyn Task>,
    on_done: CompletionFn,
}

impl QueuedJob {
    pub(crate) fn new(handle: Arc<TaskHandle>, task: Box<dyn Task>, on_done: CompletionFn) -> Self {
        Self {
            handle,
            task,
            on_done,
        }
    }

    pub(crate) fn handle(&self) -> &Arc<TaskHandle> {
        &self.handle
    }

    /// Executes the job body unless it was cancelled while queued
    async fn run(self, worker_id: usize) {
        let QueuedJob {
            handle,
            mut task,
            on_done,
        } = self;

        if handle.is_cancelled() {
            tracing::debug!("Skipping job {} cancelled before dispatch", handle.id());
        } else {
            handle.set_running();
            tracing::debug!(
                "Worker {} processing job {} ({}) for {}",
                worker_id,
                handle.id(),
                task.description(),
                handle.owner()
            );

            let ctx = TaskContext::new(Arc::clone(&handle));
            let outcome = scope_current_job(
                handle.id().clone(),
                AssertUnwindSafe(task.run(&ctx)).catch_unwind(),
            )
            .await
            .unwrap_or(Err(TaskError::Panicked));

            match outcome {
                Ok(()) => tracing::debug!("Job {} completed", handle.id()),
                Err(TaskError::Cancelled) => tracing::debug!("Job {} cancelled", handle.id()),
                Err(e) => tracing::warn!(
                    "Job {} ({}) ended with error: {}",
                    handle.id(),
                    task.description(),
                    e
                ),
            }
        }

        complete(handle, task, on_done);
    }

    /// Ends a job that never reached a worker
    pub(crate) fn finish_unstarted(self) {
        tracing::debug!("Job {} withdrawn before dispatch", self.handle.id());
        complete(self.handle, self.task, self.on_done);
    }
}

fn complete(handle: Arc<TaskHandle>, task: Box<dyn Task>, on_done: CompletionFn) {
    // The body goes first; the registry only ever sees the handle.
    drop(task);
    on_done(&handle);
    handle.mark_finished();
}

struct QueueEntry {
    priority: Priority,
    sequence: u64,
    job: QueuedJob,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first, then earlier submission first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

// =============================================================================
// Execution Pool
// =============================================================================

struct PoolShared {
    kind: PoolKind,
    num_workers: usize,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    running: AtomicUsize,
    sequence: AtomicU64,
    shutdown: CancellationToken,
}

impl PoolShared {
    fn lock_queue(&self) -> MutexGuard<'_, BinaryHeap<QueueEntry>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn next_job(&self) -> QueuedJob {
        loop {
            if let Some(entry) = self.lock_queue().pop() {
                return entry.job;
            }
            self.notify.notified().await;
        }
    }
}

/// Bounded set of workers draining a priority queue.
///
/// Must be created from within a Tokio runtime. Dropping the pool stops its
/// workers after their current job and ends every still-queued job unrun.
pub struct ExecutionPool {
    shared: Arc<PoolShared>,
}

impl ExecutionPool {
    /// Creates a pool and spawns `num_workers` worker tasks
    pub(crate) fn new(kind: PoolKind, num_workers: usize) -> Self {
        let num_workers = num_workers.clamp(1, MAX_WORKERS);
        let shared = Arc::new(PoolShared {
            kind,
            num_workers,
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            running: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        for worker_id in 0..num_workers {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                tracing::debug!("{:?} worker {} started", shared.kind, worker_id);

                loop {
                    let job = tokio::select! {
                        _ = shared.shutdown.cancelled() => break,
                        job = shared.next_job() => job,
                    };

                    shared.running.fetch_add(1, Ordering::SeqCst);
                    job.run(worker_id).await;
                    shared.running.fetch_sub(1, Ordering::SeqCst);
                }

                tracing::debug!("{:?} worker {} shutting down", shared.kind, worker_id);
            });
        }

        Self { shared }
    }

    pub fn kind(&self) -> PoolKind {
        self.shared.kind
    }

    /// Gets the number of configured workers
    pub fn num_workers(&self) -> usize {
        self.shared.num_workers
    }

    /// Jobs waiting for a worker
    pub fn queue_len(&self) -> usize {
        self.shared.lock_queue().len()
    }

    /// Jobs currently held by a worker
    pub fn running_count(&self) -> usize {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Queues a job, ordered by the priority recorded on its handle
    pub(crate) fn submit(&self, job: QueuedJob) {
        if self.is_shut_down() {
            tracing::warn!(
                "{:?} pool is shut down; dropping job {}",
                self.shared.kind,
                job.handle().id()
            );
            job.handle().cancel_job();
            job.finish_unstarted();
            return;
        }

        let entry = QueueEntry {
            priority: job.handle().priority(),
            sequence: self.shared.sequence.fetch_add(1, Ordering::Relaxed),
            job,
        };
        self.shared.lock_queue().push(entry);
        self.shared.notify.notify_one();
    }

    /// Removes a job that is still waiting for a worker
    pub(crate) fn withdraw(&self, job_id: &str) -> Option<QueuedJob> {
        let mut queue = self.shared.lock_queue();
        if !queue.iter().any(|e| e.job.handle().id() == job_id) {
            return None;
        }

        let mut withdrawn = None;
        let remaining: BinaryHeap<QueueEntry> = queue
            .drain()
            .filter_map(|entry| {
                if withdrawn.is_none() && entry.job.handle().id() == job_id {
                    withdrawn = Some(entry.job);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        *queue = remaining;
        withdrawn
    }

    /// Stops the workers and ends every queued job without running it.
    ///
    /// Jobs already executing finish normally.
    pub fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();

        let drained: Vec<QueuedJob> = self.shared.lock_queue().drain().map(|e| e.job).collect();
        if !drained.is_empty() {
            tracing::info!(
                "{:?} pool shutting down with {} queued job(s)",
                self.shared.kind,
                drained.len()
            );
        }
        for job in drained {
            job.handle().cancel_job();
            job.finish_unstarted();
        }
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ExecutionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPool")
            .field("kind", &self.shared.kind)
            .field("num_workers", &self.shared.num_workers)
            .field("queued", &self.queue_len())
            .field("running", &self.running_count())
            .finish()
    }
}
