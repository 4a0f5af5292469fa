//! The durable store the engine persists through.
//!
//! Implementations are synchronous; callers on the async side wrap them in
//! `spawn_blocking` the same way they would a database connection.

pub mod memory;

use crate::models::{AuditEntry, BackupDefinition, DefinitionStatus, RunState, RunStatus, TargetHost};

pub use memory::MemoryStore;

pub trait BackupStore: Send + Sync {
    fn find_definition(&self, id: &str) -> anyhow::Result<Option<BackupDefinition>>;

    fn find_definitions_by_status(&self, status: DefinitionStatus) -> anyhow::Result<Vec<BackupDefinition>>;

    /// Persist every field of an existing definition.
    fn save_definition(&self, definition: &BackupDefinition) -> anyhow::Result<()>;

    fn find_host(&self, id: &str) -> anyhow::Result<Option<TargetHost>>;

    fn create_run_state(&self, state: &RunState) -> anyhow::Result<()>;

    fn save_run_state(&self, state: &RunState) -> anyhow::Result<()>;

    fn find_run_state(&self, id: &str) -> anyhow::Result<Option<RunState>>;

    /// Most recent run-state for a definition, by update time.
    fn latest_run_state(&self, definition_id: &str) -> anyhow::Result<Option<RunState>>;

    fn find_run_states_by_status(&self, statuses: &[RunStatus]) -> anyhow::Result<Vec<RunState>>;

    fn append_audit(&self, entry: &AuditEntry) -> anyhow::Result<()>;

    /// Resolve host references in order. Unknown ids are reported by id.
    fn resolve_hosts(&self, ids: &[String]) -> anyhow::Result<Result<Vec<TargetHost>, String>> {
        let mut hosts = Vec::with_capacity(ids.len());
        for id in ids {
            match self.find_host(id)? {
                Some(host) => hosts.push(host),
                None => return Ok(Err(id.clone())),
            }
        }
        Ok(Ok(hosts))
    }
}
