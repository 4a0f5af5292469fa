//! Backup execution and progress-tracking engine.
//!
//! Runs declarative backup definitions against local and SSH targets,
//! persists every state transition through a [`BackupStore`], streams live
//! progress to observers and recovers runs orphaned by a crash.

pub mod archive;
pub mod broadcast;
pub mod checksum;
pub mod config;
pub mod executor;
pub mod fs;
pub mod models;
pub mod remote;
pub mod store;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use broadcast::{Observer, ObserverId, ObserverSet, ProgressTracker};
pub use config::EngineConfig;
pub use executor::{Orchestrator, RecoveryReport, RunStarted};
pub use store::{BackupStore, MemoryStore};
pub use utils::errors::{EngineError, Result};
