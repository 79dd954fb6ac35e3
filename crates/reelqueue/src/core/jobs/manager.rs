//! Task Manager
//!
//! Owner-keyed registry of in-flight jobs. Starting a job records its handle
//! under the owner and routes the body to a pool; the pool reports back when
//! the job ends, at which point the handle leaves the registry and the job
//! count is republished.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::pool::{CompletionFn, QueuedJob};
use super::task::current_job_id;
use super::{
    ExecutionPool, JobFilter, PoolConfig, PoolKind, Task, TaskHandle, TaskManagerStatus,
};
use crate::core::{CoreError, CoreResult, JobId, ObjectId};

/// Snapshot of the number of registered jobs.
///
/// `revision` increases with every registry change, so observers can drop
/// snapshots older than one they have already seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCount {
    pub outstanding: usize,
    pub revision: u64,
}

#[derive(Debug, Default)]
struct Registry {
    tasks: HashMap<ObjectId, Vec<Arc<TaskHandle>>>,
    revision: u64,
}

impl Registry {
    fn outstanding(&self) -> usize {
        self.tasks.values().map(Vec::len).sum()
    }

    /// Count after a change; must be called with the write lock held
    fn next_count(&mut self) -> JobCount {
        self.revision += 1;
        JobCount {
            outstanding: self.outstanding(),
            revision: self.revision,
        }
    }

    fn register(&mut self, handle: Arc<TaskHandle>) -> JobCount {
        self.tasks.entry(handle.owner()).or_default().push(handle);
        self.next_count()
    }

    fn remove(&mut self, owner: ObjectId, job_id: &str) -> Option<JobCount> {
        let jobs = self.tasks.get_mut(&owner)?;
        let index = jobs.iter().position(|h| h.id() == job_id)?;
        jobs.remove(index);
        if jobs.is_empty() {
            self.tasks.remove(&owner);
        }
        Some(self.next_count())
    }
}

struct ManagerInner {
    registry: RwLock<Registry>,
    config: PoolConfig,
    general: ExecutionPool,
    constrained: ExecutionPool,
    job_count: watch::Sender<JobCount>,
}

impl ManagerInner {
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool(&self, kind: PoolKind) -> &ExecutionPool {
        match kind {
            PoolKind::General => &self.general,
            PoolKind::Constrained => &self.constrained,
        }
    }

    /// Publishes `count` unless a newer revision is already visible
    fn publish(&self, count: JobCount) {
        self.job_count.send_if_modified(|current| {
            if count.revision > current.revision {
                *current = count;
                true
            } else {
                false
            }
        });
    }

    fn task_done(&self, owner: ObjectId, job_id: &str) -> CoreResult<()> {
        let removed = self.write().remove(owner, job_id);

        match removed {
            Some(count) => {
                self.publish(count);
                Ok(())
            }
            None => {
                error!(
                    "Completion reported for job {} which is not registered for {}",
                    job_id, owner
                );
                debug_assert!(false, "job {job_id} is not registered for {owner}");
                Err(CoreError::UnknownJob {
                    owner,
                    job_id: job_id.to_string(),
                })
            }
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let registry = self.registry.get_mut().unwrap_or_else(PoisonError::into_inner);
        let outstanding = registry.outstanding();
        if outstanding > 0 {
            info!("Task manager dropped with {} outstanding job(s); cancelling", outstanding);
        }
        for handle in registry.tasks.values().flatten() {
            handle.cancel_job();
        }
        // Pools shut down as the fields drop
    }
}

// =============================================================================
// Task Manager
// =============================================================================

/// Registry and dispatcher for background jobs.
///
/// Clones share the same registry and pools. Must be created from within a
/// Tokio runtime.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    /// Creates a manager and spawns its pool workers
    pub fn new(mut config: PoolConfig) -> Self {
        config.normalize();
        info!(
            "Starting task manager: {} general worker(s), {} constrained worker(s) for {:?}",
            config.general_workers, config.constrained_workers, config.constrained_types
        );

        let (job_count, _) = watch::channel(JobCount::default());
        Self {
            inner: Arc::new(ManagerInner {
                registry: RwLock::new(Registry::default()),
                general: ExecutionPool::new(PoolKind::General, config.general_workers),
                constrained: ExecutionPool::new(PoolKind::Constrained, config.constrained_workers),
                config,
                job_count,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The pool executing jobs of the given kind
    pub fn pool(&self, kind: PoolKind) -> &ExecutionPool {
        self.inner.pool(kind)
    }

    // =========================================================================
    // Starting Jobs
    // =========================================================================

    /// Registers `task` under `owner` and queues it on its pool.
    ///
    /// Returns as soon as the job is queued.
    pub fn start_task(&self, owner: ObjectId, task: impl Task) -> JobId {
        let handle = TaskHandle::new(owner, task.job_type(), task.priority());
        let count = self.inner.write().register(Arc::clone(&handle));
        self.inner.publish(count);

        self.dispatch(handle, Box::new(task))
    }

    /// Like [`start_task`](Self::start_task), but does nothing when `owner`
    /// already has a job of the same type registered.
    pub fn start_task_if_idle(&self, owner: ObjectId, task: impl Task) -> Option<JobId> {
        let job_type = task.job_type();
        let handle = TaskHandle::new(owner, job_type, task.priority());

        let count = {
            let mut registry = self.inner.write();
            let busy = registry
                .tasks
                .get(&owner)
                .is_some_and(|jobs| jobs.iter().any(|h| h.job_type() == job_type));
            if busy {
                debug!("{} already has a {} job; not starting another", owner, job_type);
                return None;
            }
            registry.register(Arc::clone(&handle))
        };
        self.inner.publish(count);

        Some(self.dispatch(handle, Box::new(task)))
    }

    fn dispatch(&self, handle: Arc<TaskHandle>, task: Box<dyn Task>) -> JobId {
        let job_id = handle.id().clone();
        let kind = self.inner.config.pool_for(handle.job_type());

        debug!(
            "Queueing {} job {} ({}) for {} on {:?} pool",
            handle.job_type(),
            job_id,
            task.description(),
            handle.owner(),
            kind
        );

        let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let on_done: CompletionFn = Box::new(move |handle| {
            if let Some(inner) = manager.upgrade() {
                let _ = TaskManager { inner }.task_done(handle.owner(), handle.id());
            }
        });

        self.inner
            .pool(kind)
            .submit(QueuedJob::new(handle, task, on_done));
        job_id
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// True if `owner` has a registered job matching `filter`
    pub fn has_pending_job(&self, owner: ObjectId, filter: impl Into<JobFilter>) -> bool {
        let filter = filter.into();
        self.inner
            .read()
            .tasks
            .get(&owner)
            .is_some_and(|jobs| jobs.iter().any(|h| filter.matches(h.job_type())))
    }

    /// Aggregate state of the jobs registered for `owner`
    pub fn job_status(&self, owner: ObjectId) -> TaskManagerStatus {
        let registry = self.inner.read();
        match registry.tasks.get(&owner) {
            None => TaskManagerStatus::NoJob,
            Some(jobs) if jobs.iter().any(|h| h.is_running()) => TaskManagerStatus::Running,
            Some(_) => TaskManagerStatus::Pending,
        }
    }

    /// Mean progress of the jobs registered for `owner`, truncated.
    ///
    /// An owner with no jobs reports 100.
    pub fn job_progress(&self, owner: ObjectId) -> u8 {
        let registry = self.inner.read();
        let Some(jobs) = registry.tasks.get(&owner).filter(|jobs| !jobs.is_empty()) else {
            return 100;
        };

        let total: u32 = jobs.iter().map(|h| u32::from(h.progress())).sum();
        // Each term is at most 100, so the mean fits
        (total / jobs.len() as u32) as u8
    }

    /// Handles of the jobs currently registered for `owner`
    pub fn jobs_for(&self, owner: ObjectId) -> Vec<Arc<TaskHandle>> {
        self.inner
            .read()
            .tasks
            .get(&owner)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of registered jobs across all owners
    pub fn job_count(&self) -> usize {
        self.inner.read().outstanding()
    }

    /// Receiver that observes every change of the registered job count
    pub fn subscribe_job_count(&self) -> watch::Receiver<JobCount> {
        self.inner.job_count.subscribe()
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancels the jobs of `owner` matching `filter` and waits until each has
    /// stopped and left the registry.
    pub async fn discard_jobs(&self, owner: ObjectId, filter: impl Into<JobFilter>) {
        let filter = filter.into();
        let matched: Vec<Arc<TaskHandle>> = self
            .inner
            .read()
            .tasks
            .get(&owner)
            .map(|jobs| {
                jobs.iter()
                    .filter(|h| filter.matches(h.job_type()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if matched.is_empty() {
            return;
        }
        debug!("Discarding {} job(s) for {}", matched.len(), owner);
        self.cancel_and_wait(matched).await;
    }

    /// Cancels every registered job and waits until all have stopped
    pub async fn cancel_all_jobs(&self) {
        let all: Vec<Arc<TaskHandle>> = self
            .inner
            .read()
            .tasks
            .values()
            .flatten()
            .cloned()
            .collect();

        if !all.is_empty() {
            info!("Cancelling all {} job(s)", all.len());
            self.cancel_and_wait(all).await;
        }

        let count = self.inner.write().next_count();
        self.inner.publish(count);
    }

    async fn cancel_and_wait(&self, handles: Vec<Arc<TaskHandle>>) {
        for handle in &handles {
            handle.cancel_job();
        }

        // Queued jobs are ended here rather than waiting for a worker slot
        for handle in &handles {
            let kind = self.inner.config.pool_for(handle.job_type());
            if let Some(job) = self.inner.pool(kind).withdraw(handle.id()) {
                job.finish_unstarted();
            }
        }

        let current = current_job_id();
        for handle in handles {
            if current.as_deref() == Some(handle.id().as_str()) {
                warn!(
                    "Job {} cancelled itself; it will stop when it next checks for cancellation",
                    handle.id()
                );
                continue;
            }
            handle.wait_finished().await;
        }
    }

    /// Records the end of a job. Called by the executing pool.
    ///
    /// Reporting a job that is not registered is a contract violation: it
    /// asserts in debug builds and is logged and ignored otherwise.
    pub(crate) fn task_done(&self, owner: ObjectId, job_id: &str) -> CoreResult<()> {
        self.inner.task_done(owner, job_id)
    }

    /// Cancels and waits for every job, then stops the pool workers
    pub async fn shutdown(&self) {
        self.cancel_all_jobs().await;
        self.inner.general.shutdown();
        self.inner.constrained.shutdown();
        info!("Task manager shut down");
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("config", &self.inner.config)
            .field("outstanding", &self.job_count())
            .field("general", &self.inner.general)
            .field("constrained", &self.inner.constrained)
            .finish()
    }
}
