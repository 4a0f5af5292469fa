//! In-process store backed by concurrent maps.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::BackupStore;
use crate::models::{AuditEntry, BackupDefinition, DefinitionStatus, RunState, RunStatus, TargetHost};

#[derive(Default)]
pub struct MemoryStore {
    definitions: DashMap<String, BackupDefinition>,
    hosts: DashMap<String, TargetHost>,
    // Insertion sequence breaks ties between equal update timestamps.
    run_states: DashMap<String, (u64, RunState)>,
    sequence: AtomicU64,
    audit: Mutex<Vec<AuditEntry>>,
    save_count: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_definition(&self, definition: BackupDefinition) {
        self.definitions.insert(definition.id.clone(), definition);
    }

    pub fn insert_host(&self, host: TargetHost) {
        self.hosts.insert(host.id.clone(), host);
    }

    /// Seed a run-state verbatim (e.g. one left behind by a crashed process).
    pub fn insert_run_state(&self, state: RunState) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.run_states.insert(state.id.clone(), (seq, state));
    }

    pub fn run_states_for(&self, definition_id: &str) -> Vec<RunState> {
        let mut states: Vec<(u64, RunState)> = self
            .run_states
            .iter()
            .filter(|entry| entry.value().1.definition_id == definition_id)
            .map(|entry| entry.value().clone())
            .collect();
        states.sort_by_key(|(seq, _)| *seq);
        states.into_iter().map(|(_, state)| state).collect()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().map(|entries| entries.clone()).unwrap_or_default()
    }

    /// Number of run-state writes (creates and saves) so far.
    pub fn run_state_writes(&self) -> u64 {
        self.save_count.load(Ordering::SeqCst)
    }
}

impl BackupStore for MemoryStore {
    fn find_definition(&self, id: &str) -> anyhow::Result<Option<BackupDefinition>> {
        Ok(self.definitions.get(id).map(|d| d.clone()))
    }

    fn find_definitions_by_status(&self, status: DefinitionStatus) -> anyhow::Result<Vec<BackupDefinition>> {
        Ok(self
            .definitions
            .iter()
            .filter(|d| d.status == status)
            .map(|d| d.clone())
            .collect())
    }

    fn save_definition(&self, definition: &BackupDefinition) -> anyhow::Result<()> {
        if !self.definitions.contains_key(&definition.id) {
            anyhow::bail!("Backup {} not found", definition.id);
        }
        let mut stored = definition.clone();
        stored.updated_at = chrono::Utc::now();
        self.definitions.insert(stored.id.clone(), stored);
        Ok(())
    }

    fn find_host(&self, id: &str) -> anyhow::Result<Option<TargetHost>> {
        Ok(self.hosts.get(id).map(|h| h.clone()))
    }

    fn create_run_state(&self, state: &RunState) -> anyhow::Result<()> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        self.insert_run_state(state.clone());
        Ok(())
    }

    fn save_run_state(&self, state: &RunState) -> anyhow::Result<()> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        let mut entry = self
            .run_states
            .get_mut(&state.id)
            .ok_or_else(|| anyhow::anyhow!("Run state {} not found", state.id))?;
        entry.1 = state.clone();
        Ok(())
    }

    fn find_run_state(&self, id: &str) -> anyhow::Result<Option<RunState>> {
        Ok(self.run_states.get(id).map(|entry| entry.1.clone()))
    }

    fn latest_run_state(&self, definition_id: &str) -> anyhow::Result<Option<RunState>> {
        Ok(self
            .run_states
            .iter()
            .filter(|entry| entry.value().1.definition_id == definition_id)
            .map(|entry| entry.value().clone())
            .max_by_key(|(seq, state)| (state.updated_at, *seq))
            .map(|(_, state)| state))
    }

    fn find_run_states_by_status(&self, statuses: &[RunStatus]) -> anyhow::Result<Vec<RunState>> {
        let mut states: Vec<(u64, RunState)> = self
            .run_states
            .iter()
            .filter(|entry| statuses.contains(&entry.value().1.status))
            .map(|entry| entry.value().clone())
            .collect();
        states.sort_by_key(|(seq, _)| *seq);
        Ok(states.into_iter().map(|(_, state)| state).collect())
    }

    fn append_audit(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        self.audit
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log lock poisoned"))?
            .push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArchiveFormat;

    #[test]
    fn test_latest_run_state_by_update_time() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut older = RunState::started("def");
        older.updated_at = chrono::Utc::now() + chrono::Duration::seconds(30);
        let newer_insert = RunState::started("def");

        store.create_run_state(&older)?;
        store.create_run_state(&newer_insert)?;

        // Update time wins over insertion order.
        let latest = store.latest_run_state("def")?.unwrap();
        assert_eq!(latest.id, older.id);
        assert!(store.latest_run_state("other")?.is_none());
        Ok(())
    }

    #[test]
    fn test_resolve_hosts_reports_missing_id() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.insert_host(TargetHost::local("h1", "local"));

        let ok = store.resolve_hosts(&["h1".to_string()])?;
        assert_eq!(ok.unwrap().len(), 1);

        let missing = store.resolve_hosts(&["h1".to_string(), "h9".to_string()])?;
        assert_eq!(missing.unwrap_err(), "h9");
        Ok(())
    }

    #[test]
    fn test_save_unknown_definition_fails() {
        let store = MemoryStore::new();
        let def = BackupDefinition::new("x", "/a", "/b", ArchiveFormat::Raw, vec![]);
        assert!(store.save_definition(&def).is_err());
    }
}
