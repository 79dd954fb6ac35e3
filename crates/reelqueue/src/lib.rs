//! ReelQueue
//!
//! Background job scheduler for a nonlinear media editor. Long-running work
//! (proxy generation, transcoding, analysis) is registered against the media
//! item it modifies and executed on bounded worker pools with cooperative
//! cancellation.

pub mod core;

pub use crate::core::jobs::{
    FnTask, JobCount, JobFilter, JobType, PoolConfig, PoolKind, Priority, Task, TaskContext,
    TaskError, TaskHandle, TaskManager, TaskManagerStatus, TranscodeReport, TranscodeTask,
};
pub use crate::core::settings::{SchedulerSettings, SettingsManager};
pub use crate::core::{CoreError, CoreResult, JobId, ObjectId, ObjectType};

use std::path::Path;
use std::sync::OnceLock;

/// Keeps the non-blocking file writer alive for the process lifetime
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Log file name prefix inside the log directory
const LOG_FILE_NAME: &str = "reelqueue.log";

/// Installs the global tracing subscriber at `info` level.
///
/// See [`init_logging_with_level`].
pub fn init_logging(log_dir: Option<&Path>) {
    init_logging_with_level(log_dir, "info");
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`. When `log_dir` is given,
/// output is also written to a daily rolling file there (best effort).
/// Calling this more than once has no effect.
pub fn init_logging_with_level(log_dir: Option<&Path>, default_level: &str) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(cfg!(debug_assertions));

    let file_layer = log_dir
        .filter(|dir| std::fs::create_dir_all(dir).is_ok())
        .filter(|_| LOG_GUARD.get().is_none())
        .map(|dir| {
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
        });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer);

    // Already initialized (tests, repeated CLI setup)
    let _ = tracing::subscriber::set_global_default(subscriber);
}
