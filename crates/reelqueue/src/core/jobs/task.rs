//! Job Contract
//!
//! A [`Task`] is the body of a background job. The scheduler pairs every
//! submitted task with a [`TaskHandle`], the shared control block it keeps in
//! its registry, and hands the task a [`TaskContext`] when it starts running.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{JobType, Priority};
use crate::core::{new_job_id, JobId, ObjectId};

tokio::task_local! {
    /// Job executing on the current worker task
    static CURRENT_JOB: JobId;
}

/// Returns the id of the job whose `run()` is executing on this task, if any
pub(crate) fn current_job_id() -> Option<JobId> {
    CURRENT_JOB.try_with(|id| id.clone()).ok()
}

/// Runs `fut` with `job_id` recorded as the current job
pub(crate) async fn scope_current_job<F: std::future::Future>(job_id: JobId, fut: F) -> F::Output {
    CURRENT_JOB.scope(job_id, fut).await
}

// =============================================================================
// Task Errors
// =============================================================================

/// Reasons a job body can stop without finishing its work.
///
/// The scheduler logs these but otherwise treats every outcome alike.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Job was cancelled")]
    Cancelled,

    #[error("Job failed: {0}")]
    Failed(String),

    #[error("Process error: {0}")]
    Process(#[from] std::io::Error),

    #[error("Job panicked")]
    Panicked,
}

// =============================================================================
// Task Trait
// =============================================================================

/// Body of a background job.
///
/// `run` executes on a pool worker. It must check the context's cancellation
/// state at safe points and return promptly once cancelled, and it should
/// report progress through [`TaskContext::set_progress`]. Completion is
/// reported to the scheduler by the pool when `run` returns, exactly once,
/// whatever the result.
#[async_trait]
pub trait Task: Send + 'static {
    /// Type tag used for pool routing and type-filtered queries
    fn job_type(&self) -> JobType;

    /// Ordering hint for the pool queue
    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Human-readable label for logs
    fn description(&self) -> String {
        self.job_type().to_string()
    }

    /// Performs the work
    async fn run(&mut self, ctx: &TaskContext) -> Result<(), TaskError>;
}

// =============================================================================
// Task Handle
// =============================================================================

/// Shared control block for one submitted job.
///
/// The registry holds these instead of the job body, so it never touches a
/// job after the executing pool has dropped it.
#[derive(Debug)]
pub struct TaskHandle {
    id: JobId,
    owner: ObjectId,
    job_type: JobType,
    priority: Priority,
    progress: AtomicU8,
    running: AtomicBool,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

impl TaskHandle {
    pub(crate) fn new(owner: ObjectId, job_type: JobType, priority: Priority) -> Arc<Self> {
        let (finished, _) = watch::channel(false);
        Arc::new(Self {
            id: new_job_id(),
            owner,
            job_type,
            priority,
            progress: AtomicU8::new(0),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            finished,
        })
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Progress percentage in `0..=100`
    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Acquire)
    }

    /// True while a pool worker is executing the job
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the job has returned and its completion has been recorded
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Requests cooperative cancellation. Returns immediately.
    pub fn cancel_job(&self) {
        self.cancel.cancel();
    }

    /// Waits until the job has stopped executing and left the registry
    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        // The sender lives as long as `self`, so this only resolves on `true`.
        let _ = rx.wait_for(|done| *done).await;
    }

    pub(crate) fn set_running(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Clears the running flag, then releases waiters
    pub(crate) fn mark_finished(&self) {
        self.running.store(false, Ordering::Release);
        self.finished.send_replace(true);
    }

    fn advance_progress(&self, percent: u8) {
        self.progress.fetch_max(percent.min(100), Ordering::AcqRel);
    }
}

// =============================================================================
// Task Context
// =============================================================================

/// View of its own control block given to a running job
#[derive(Clone, Debug)]
pub struct TaskContext {
    handle: Arc<TaskHandle>,
}

impl TaskContext {
    pub(crate) fn new(handle: Arc<TaskHandle>) -> Self {
        Self { handle }
    }

    pub fn job_id(&self) -> &JobId {
        self.handle.id()
    }

    pub fn owner(&self) -> ObjectId {
        self.handle.owner()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        self.handle.cancel.cancelled().await
    }

    /// Safe-point check for use with `?`
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Child token for handing to helpers that accept a `CancellationToken`
    pub fn cancellation_token(&self) -> CancellationToken {
        self.handle.cancel.child_token()
    }

    /// Records progress. Values above 100 are clamped and the stored value
    /// never decreases.
    pub fn set_progress(&self, percent: u8) {
        self.handle.advance_progress(percent);
    }

    pub fn progress(&self) -> u8 {
        self.handle.progress()
    }
}
