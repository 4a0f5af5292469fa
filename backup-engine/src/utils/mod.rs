//! Utility modules for the backup engine.

pub mod errors;
pub mod format;

pub use errors::{EngineError, Result};
