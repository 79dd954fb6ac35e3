//! ReelQueue Error Definitions
//!
//! Defines error types used throughout the project.

use thiserror::Error;

use super::{JobId, ObjectId};

/// Core scheduler error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Job {job_id} is not registered for {owner}")]
    UnknownJob { owner: ObjectId, job_id: JobId },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid settings: {0}")]
    Settings(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Core scheduler result type
pub type CoreResult<T> = Result<T, CoreError>;
