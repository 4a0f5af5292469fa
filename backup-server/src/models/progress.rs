use backup_engine::models::{RunState, RunStatus};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::{format_time, get_opt_u64, get_parsed, get_time, get_u64, to_sql_int};

fn row_to_progress(row: &Row) -> rusqlite::Result<RunState> {
    let progress: i64 = row.get("progress")?;
    Ok(RunState {
        id: row.get("id")?,
        definition_id: row.get("backup_id")?,
        status: get_parsed::<RunStatus>(row, "status")?,
        progress: progress.clamp(0, 100) as u8,
        message: row.get("message")?,
        current_file: row.get("current_file")?,
        bytes_processed: get_u64(row, "bytes_processed")?,
        total_bytes: get_opt_u64(row, "total_bytes")?,
        speed_bps: get_opt_u64(row, "speed_bps")?,
        eta_seconds: get_opt_u64(row, "eta_seconds")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
    })
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub fn create(conn: &Connection, state: &RunState) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO backup_progress (id, backup_id, status, progress, message, current_file,
                                      bytes_processed, total_bytes, speed_bps, eta_seconds,
                                      created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            state.id,
            state.definition_id,
            state.status.as_str(),
            state.progress,
            state.message,
            state.current_file,
            to_sql_int(state.bytes_processed),
            state.total_bytes.map(to_sql_int),
            state.speed_bps.map(to_sql_int),
            state.eta_seconds.map(to_sql_int),
            format_time(&state.created_at),
            format_time(&state.updated_at),
        ],
    )?;
    Ok(())
}

/// Overwrite a run-state. Returns false when the row has been purged.
pub fn save(conn: &Connection, state: &RunState) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_progress SET status = ?1, progress = ?2, message = ?3, current_file = ?4,
                bytes_processed = ?5, total_bytes = ?6, speed_bps = ?7, eta_seconds = ?8,
                updated_at = ?9
         WHERE id = ?10",
        params![
            state.status.as_str(),
            state.progress,
            state.message,
            state.current_file,
            to_sql_int(state.bytes_processed),
            state.total_bytes.map(to_sql_int),
            state.speed_bps.map(to_sql_int),
            state.eta_seconds.map(to_sql_int),
            format_time(&state.updated_at),
            state.id,
        ],
    )?;
    Ok(changes > 0)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<RunState>> {
    let state = conn
        .query_row("SELECT * FROM backup_progress WHERE id = ?", params![id], row_to_progress)
        .optional()?;
    Ok(state)
}

pub fn latest_for_backup(conn: &Connection, backup_id: &str) -> anyhow::Result<Option<RunState>> {
    let state = conn
        .query_row(
            "SELECT * FROM backup_progress WHERE backup_id = ?
             ORDER BY updated_at DESC, rowid DESC LIMIT 1",
            params![backup_id],
            row_to_progress,
        )
        .optional()?;
    Ok(state)
}

pub fn find_by_statuses(conn: &Connection, statuses: &[RunStatus]) -> anyhow::Result<Vec<RunState>> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT * FROM backup_progress WHERE status IN ({}) ORDER BY created_at, rowid",
        placeholders(statuses.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(statuses.iter().map(|s| s.as_str())), row_to_progress)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM backup_progress WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;
    use crate::db::migrate::migrate;

    #[test]
    fn test_latest_and_status_filter() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        migrate(&pool)?;
        let conn = pool.get()?;

        let mut first = RunState::started("b1");
        first.status = RunStatus::Failed;
        first.updated_at = first.updated_at - chrono::Duration::seconds(10);
        create(&conn, &first)?;

        let mut second = RunState::started("b1");
        second.total_bytes = Some(1024);
        create(&conn, &second)?;

        let latest = latest_for_backup(&conn, "b1")?.expect("latest run state");
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.total_bytes, Some(1024));
        assert!(latest.speed_bps.is_none());

        let running = find_by_statuses(&conn, &[RunStatus::Running])?;
        assert_eq!(running.len(), 1);
        assert_eq!(find_by_statuses(&conn, &RunStatus::VISIBLE)?.len(), 2);
        assert!(find_by_statuses(&conn, &[])?.is_empty());
        Ok(())
    }

    #[test]
    fn test_save_after_delete_reports_missing() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        migrate(&pool)?;
        let conn = pool.get()?;

        let mut state = RunState::started("b1");
        create(&conn, &state)?;
        state.progress = 40;
        state.bytes_processed = 4000;
        assert!(save(&conn, &state)?);
        assert_eq!(find_by_id(&conn, &state.id)?.expect("saved").progress, 40);

        assert!(delete(&conn, &state.id)?);
        assert!(!save(&conn, &state)?);
        assert!(!delete(&conn, &state.id)?);
        Ok(())
    }
}
