//! ReelQueue Core
//!
//! Job scheduling engine: the owner-keyed task registry, its execution pools
//! and the persisted scheduler settings.

pub mod jobs;
pub mod settings;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;

#[cfg(test)]
mod tests_scheduler;
