//! Closure-backed jobs

use std::future::Future;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use super::{JobType, Priority, Task, TaskContext, TaskError};

type JobBody = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, Result<(), TaskError>> + Send>;

/// A job whose body is an async closure.
///
/// ```ignore
/// let task = FnTask::new(JobType::Analysis, |ctx| async move {
///     for step in 0..10u8 {
///         ctx.check_cancelled()?;
///         ctx.set_progress(step * 10);
///     }
///     Ok(())
/// });
/// ```
pub struct FnTask {
    job_type: JobType,
    priority: Priority,
    description: Option<String>,
    body: Option<JobBody>,
}

impl FnTask {
    pub fn new<F, Fut>(job_type: JobType, f: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            job_type,
            priority: Priority::Normal,
            description: None,
            body: Some(Box::new(move |ctx| f(ctx).boxed())),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl std::fmt::Debug for FnTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTask")
            .field("job_type", &self.job_type)
            .field("priority", &self.priority)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Task for FnTask {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("{} job", self.job_type))
    }

    async fn run(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        match self.body.take() {
            Some(body) => body(ctx.clone()).await,
            None => Err(TaskError::Failed("job body already consumed".to_string())),
        }
    }
}
