//! File system utilities for backup operations.

pub mod walker;
