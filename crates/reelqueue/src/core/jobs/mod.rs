//! Job System Module
//!
//! Background job scheduling for proxy generation, transcoding and analysis.
//! Jobs are tracked per owner (the media item they modify) so callers can
//! query status and progress without knowing job internals.

mod closure;
mod manager;
mod pool;
mod task;
mod transcode;

pub use closure::FnTask;
pub use manager::{JobCount, TaskManager};
pub use pool::{ExecutionPool, PoolConfig, PoolKind};
pub use task::{Task, TaskContext, TaskError, TaskHandle};
pub use transcode::{TranscodeReport, TranscodeTask};

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Job Types
// =============================================================================

/// Job type enumeration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobType {
    /// Generic background work
    Generic,
    /// Generate proxy media for preview
    Proxy,
    /// Transcode to another codec or container
    Transcode,
    /// Media analysis (scene detection, loudness, etc.)
    Analysis,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobType::Generic => "generic",
            JobType::Proxy => "proxy",
            JobType::Transcode => "transcode",
            JobType::Analysis => "analysis",
        };
        f.write_str(name)
    }
}

/// Job type selector for queries and cancellation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JobFilter {
    /// Matches every job
    #[default]
    Any,
    /// Matches jobs of one type only
    Kind(JobType),
}

impl JobFilter {
    pub fn matches(&self, job_type: JobType) -> bool {
        match self {
            JobFilter::Any => true,
            JobFilter::Kind(kind) => *kind == job_type,
        }
    }
}

impl From<JobType> for JobFilter {
    fn from(job_type: JobType) -> Self {
        JobFilter::Kind(job_type)
    }
}

/// Job priority levels
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    /// Background tasks (lowest)
    Background = 0,
    /// Normal priority
    #[default]
    Normal = 1,
    /// Preview generation (higher)
    Preview = 2,
    /// User-requested tasks (highest)
    UserRequest = 3,
}

/// Aggregate job state for one owner.
///
/// Derived from registry membership and running flags; never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskManagerStatus {
    /// No job registered for the owner
    NoJob,
    /// Jobs registered, none dispatched yet
    Pending,
    /// At least one job is executing
    Running,
}
