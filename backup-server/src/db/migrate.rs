use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS servers (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  type TEXT NOT NULL DEFAULT 'local' CHECK(type IN ('local','remote')),
  host TEXT NOT NULL DEFAULT 'localhost',
  ssh_user TEXT,
  ssh_key_path TEXT,
  ssh_port INTEGER,
  transfer_type TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS backups (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  source TEXT NOT NULL,
  destination TEXT NOT NULL,
  file_type TEXT NOT NULL CHECK(file_type IN ('tar','zip','raw')),
  server_ids TEXT NOT NULL DEFAULT '[]',
  type TEXT NOT NULL DEFAULT 'full',
  status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','running','completed','failed')),
  size_bytes INTEGER NOT NULL DEFAULT 0,
  checksum TEXT,
  started_at TEXT,
  completed_at TEXT,
  duration_sec INTEGER NOT NULL DEFAULT 0,
  executed_by TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backup_progress (
  id TEXT PRIMARY KEY,
  backup_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK(status IN ('pending','running','completed','failed')),
  progress INTEGER NOT NULL DEFAULT 0,
  message TEXT NOT NULL DEFAULT '',
  current_file TEXT,
  bytes_processed INTEGER NOT NULL DEFAULT 0,
  total_bytes INTEGER,
  speed_bps INTEGER,
  eta_seconds INTEGER,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  level TEXT NOT NULL CHECK(level IN ('info','warn','error')),
  message TEXT NOT NULL,
  entity_type TEXT,
  entity_id TEXT,
  metadata TEXT,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backup_progress_backup_id ON backup_progress(backup_id, updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_backup_progress_status ON backup_progress(status);
CREATE INDEX IF NOT EXISTS idx_logs_entity ON logs(entity_type, entity_id);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;

    #[test]
    fn test_migrate_is_idempotent() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        migrate(&pool)?;
        migrate(&pool)?;

        let conn = pool.get()?;
        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
             AND name IN ('servers','backups','backup_progress','logs')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(tables, 4);
        Ok(())
    }
}
