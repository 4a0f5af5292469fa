//! SQLite-backed [`BackupStore`].

use backup_engine::models::{AuditEntry, BackupDefinition, DefinitionStatus, RunState, RunStatus, TargetHost};
use backup_engine::BackupStore;

use crate::db::connection::DbPool;
use crate::models::{audit_log, backup, progress, server};

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Delete every running, failed or completed run-state except the ones
    /// in `keep`. Returns the number removed.
    pub fn purge_processes(&self, keep: &[String]) -> anyhow::Result<usize> {
        let conn = self.pool.get()?;
        let mut removed = 0;
        for state in progress::find_by_statuses(&conn, &RunStatus::VISIBLE)? {
            if keep.contains(&state.id) {
                continue;
            }
            if progress::delete(&conn, &state.id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn purge_process(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.pool.get()?;
        progress::delete(&conn, id)
    }
}

impl BackupStore for SqliteStore {
    fn find_definition(&self, id: &str) -> anyhow::Result<Option<BackupDefinition>> {
        let conn = self.pool.get()?;
        backup::find_by_id(&conn, id)
    }

    fn find_definitions_by_status(&self, status: DefinitionStatus) -> anyhow::Result<Vec<BackupDefinition>> {
        let conn = self.pool.get()?;
        backup::find_by_status(&conn, status)
    }

    fn save_definition(&self, definition: &BackupDefinition) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        if !backup::save(&conn, definition)? {
            anyhow::bail!("Backup {} not found", definition.id);
        }
        Ok(())
    }

    fn find_host(&self, id: &str) -> anyhow::Result<Option<TargetHost>> {
        let conn = self.pool.get()?;
        server::find_by_id(&conn, id)
    }

    fn create_run_state(&self, state: &RunState) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        progress::create(&conn, state)
    }

    fn save_run_state(&self, state: &RunState) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        if !progress::save(&conn, state)? {
            anyhow::bail!("Run state {} not found", state.id);
        }
        Ok(())
    }

    fn find_run_state(&self, id: &str) -> anyhow::Result<Option<RunState>> {
        let conn = self.pool.get()?;
        progress::find_by_id(&conn, id)
    }

    fn latest_run_state(&self, definition_id: &str) -> anyhow::Result<Option<RunState>> {
        let conn = self.pool.get()?;
        progress::latest_for_backup(&conn, definition_id)
    }

    fn find_run_states_by_status(&self, statuses: &[RunStatus]) -> anyhow::Result<Vec<RunState>> {
        let conn = self.pool.get()?;
        progress::find_by_statuses(&conn, statuses)
    }

    fn append_audit(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        audit_log::append(&conn, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;
    use crate::db::migrate::migrate;
    use backup_engine::models::{ArchiveFormat, LogLevel};
    use backup_engine::{EngineConfig, ObserverSet, Orchestrator};
    use std::sync::Arc;
    use std::time::Duration;

    fn store() -> anyhow::Result<SqliteStore> {
        let pool = memory_pool()?;
        migrate(&pool)?;
        Ok(SqliteStore::new(pool))
    }

    #[test]
    fn test_save_missing_rows_fail() -> anyhow::Result<()> {
        let store = store()?;
        let def = BackupDefinition::new("n", "/a", "/b", ArchiveFormat::Raw, vec![]);
        assert!(store.save_definition(&def).is_err());
        assert!(store.save_run_state(&RunState::started(&def.id)).is_err());
        Ok(())
    }

    #[test]
    fn test_purge_keeps_listed_runs() -> anyhow::Result<()> {
        let store = store()?;
        let running = RunState::started("b1");
        let mut failed = RunState::started("b2");
        failed.status = RunStatus::Failed;
        let mut pending = RunState::started("b3");
        pending.status = RunStatus::Pending;
        for state in [&running, &failed, &pending] {
            store.create_run_state(state)?;
        }

        let removed = store.purge_processes(&[running.id.clone()])?;
        assert_eq!(removed, 1);
        assert!(store.find_run_state(&running.id)?.is_some());
        assert!(store.find_run_state(&failed.id)?.is_none());
        assert!(store.find_run_state(&pending.id)?.is_some(), "pending runs are not listed");

        assert!(store.purge_process(&running.id)?);
        assert!(!store.purge_process(&running.id)?);
        Ok(())
    }

    #[test]
    fn test_resolve_hosts_through_sqlite() -> anyhow::Result<()> {
        let store = store()?;
        {
            let conn = store.pool.get()?;
            server::insert(&conn, &TargetHost::local("h1", "primary"))?;
        }
        let hosts = store.resolve_hosts(&["h1".to_string()])?;
        assert_eq!(hosts.map(|h| h.len()), Ok(1));
        let missing = store.resolve_hosts(&["h1".to_string(), "nope".to_string()])?;
        assert_eq!(missing.map(|h| h.len()), Err("nope".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_orchestrated_run_persists_to_sqlite() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let source = dir.path().join("src");
        std::fs::create_dir_all(source.join("nested"))?;
        std::fs::write(source.join("a.txt"), vec![b'a'; 4096])?;
        std::fs::write(source.join("nested/b.txt"), vec![b'b'; 2048])?;
        let destination = dir.path().join("out");

        let store = store()?;
        let def = BackupDefinition::new(
            "docs",
            source.to_string_lossy(),
            destination.to_string_lossy(),
            ArchiveFormat::Tar,
            vec![],
        );
        {
            let conn = store.pool.get()?;
            backup::insert(&conn, &def)?;
        }

        let orchestrator = Orchestrator::new(
            Arc::new(store.clone()),
            ObserverSet::new(),
            EngineConfig::default(),
        );
        let started = orchestrator.execute_async(&def.id, Some("admin".into())).await?;

        for _ in 0..500 {
            if !orchestrator.is_executing(&def.id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stored = store.find_definition(&def.id)?.expect("definition");
        assert_eq!(stored.status, DefinitionStatus::Completed);
        assert_eq!(stored.executed_by.as_deref(), Some("admin"));
        assert!(stored.size_bytes > 0);
        assert_eq!(stored.checksum.as_deref().map(str::len), Some(64));

        let state = store.find_run_state(&started.run_id)?.expect("run state");
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.progress, 100);
        assert_eq!(state.bytes_processed, 6144);

        let conn = store.pool.get()?;
        let entries = audit_log::find_for_entity(&conn, &def.id)?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, LogLevel::Info.as_str());
        assert!(entries[1].1.ends_with("completed successfully"));
        let metadata = entries[1].2.clone().expect("metadata");
        assert_eq!(metadata["run_id"], started.run_id.as_str());
        Ok(())
    }
}
