//! Records the engine reads from and writes back to the durable store.

pub mod audit;
pub mod definition;
pub mod host;
pub mod run_state;

pub use audit::{AuditEntry, LogLevel};
pub use definition::{ArchiveFormat, BackupDefinition, DefinitionStatus};
pub use host::{HostKind, TargetHost};
pub use run_state::{ProgressView, RunState, RunStatus};
