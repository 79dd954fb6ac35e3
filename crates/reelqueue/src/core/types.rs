//! ReelQueue Core Type Definitions
//!
//! Defines the identifier types shared by the scheduler and its callers.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Job unique identifier (ULID)
pub type JobId = String;

/// Creates a fresh job identifier
pub fn new_job_id() -> JobId {
    ulid::Ulid::new().to_string()
}

// =============================================================================
// Owner Identity
// =============================================================================

/// Kind of project entity a job acts upon
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectType {
    /// Clip in the project bin
    BinClip,
    /// Clip placed on the timeline
    TimelineClip,
    /// Timeline track
    TimelineTrack,
    /// Master output
    Master,
    /// Whole project
    Project,
}

impl ObjectType {
    fn as_str(&self) -> &'static str {
        match self {
            ObjectType::BinClip => "bin_clip",
            ObjectType::TimelineClip => "timeline_clip",
            ObjectType::TimelineTrack => "timeline_track",
            ObjectType::Master => "master",
            ObjectType::Project => "project",
        }
    }
}

/// Opaque key identifying the entity a job modifies.
///
/// The scheduler only hashes and compares it; it never resolves it back to
/// project data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectId {
    pub kind: ObjectType,
    pub id: i64,
}

impl ObjectId {
    pub fn new(kind: ObjectType, id: i64) -> Self {
        Self { kind, id }
    }

    /// Shorthand for a project bin clip
    pub fn bin_clip(id: i64) -> Self {
        Self::new(ObjectType::BinClip, id)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}
