use backup_engine::models::{ArchiveFormat, BackupDefinition, DefinitionStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;

use super::{format_time, get_opt_time, get_parsed, get_time, get_u64, to_sql_int};

#[derive(Debug, Deserialize)]
pub struct CreateBackupRequest {
    pub name: String,
    pub source: String,
    pub destination: String,
    pub file_type: String,
    #[serde(default)]
    pub server_ids: Vec<String>,
    #[serde(rename = "type")]
    pub execution_type: Option<String>,
}

fn row_to_backup(row: &Row) -> rusqlite::Result<BackupDefinition> {
    let server_ids: String = row.get("server_ids")?;
    let host_ids: Vec<String> = serde_json::from_str(&server_ids).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(BackupDefinition {
        id: row.get("id")?,
        name: row.get("name")?,
        source: row.get("source")?,
        destination: row.get("destination")?,
        format: get_parsed::<ArchiveFormat>(row, "file_type")?,
        host_ids,
        execution_type: row.get("type")?,
        status: get_parsed::<DefinitionStatus>(row, "status")?,
        size_bytes: get_u64(row, "size_bytes")?,
        checksum: row.get("checksum")?,
        started_at: get_opt_time(row, "started_at")?,
        completed_at: get_opt_time(row, "completed_at")?,
        duration_sec: get_u64(row, "duration_sec")?,
        executed_by: row.get("executed_by")?,
        created_at: get_time(row, "created_at")?,
        updated_at: get_time(row, "updated_at")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<BackupDefinition>> {
    let mut stmt = conn.prepare("SELECT * FROM backups ORDER BY created_at DESC")?;
    let rows = stmt.query_map([], row_to_backup)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<BackupDefinition>> {
    let backup = conn
        .query_row("SELECT * FROM backups WHERE id = ?", params![id], row_to_backup)
        .optional()?;
    Ok(backup)
}

pub fn find_by_status(conn: &Connection, status: DefinitionStatus) -> anyhow::Result<Vec<BackupDefinition>> {
    let mut stmt = conn.prepare("SELECT * FROM backups WHERE status = ? ORDER BY created_at")?;
    let rows = stmt.query_map(params![status.as_str()], row_to_backup)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn insert(conn: &Connection, backup: &BackupDefinition) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO backups (id, name, source, destination, file_type, server_ids, type, status,
                              size_bytes, checksum, started_at, completed_at, duration_sec,
                              executed_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            backup.id,
            backup.name,
            backup.source,
            backup.destination,
            backup.format.as_str(),
            serde_json::to_string(&backup.host_ids)?,
            backup.execution_type,
            backup.status.as_str(),
            to_sql_int(backup.size_bytes),
            backup.checksum,
            backup.started_at.as_ref().map(format_time),
            backup.completed_at.as_ref().map(format_time),
            to_sql_int(backup.duration_sec),
            backup.executed_by,
            format_time(&backup.created_at),
            format_time(&backup.updated_at),
        ],
    )?;
    Ok(())
}

/// Write back the fields the engine owns. Returns false when the row is gone.
pub fn save(conn: &Connection, backup: &BackupDefinition) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backups SET status = ?1, size_bytes = ?2, checksum = ?3, started_at = ?4,
                completed_at = ?5, duration_sec = ?6, executed_by = ?7, updated_at = ?8
         WHERE id = ?9",
        params![
            backup.status.as_str(),
            to_sql_int(backup.size_bytes),
            backup.checksum,
            backup.started_at.as_ref().map(format_time),
            backup.completed_at.as_ref().map(format_time),
            to_sql_int(backup.duration_sec),
            backup.executed_by,
            format_time(&chrono::Utc::now()),
            backup.id,
        ],
    )?;
    Ok(changes > 0)
}

pub fn create(conn: &Connection, data: &CreateBackupRequest) -> anyhow::Result<BackupDefinition> {
    let format: ArchiveFormat = data.file_type.parse()?;
    let mut backup = BackupDefinition::new(
        data.name.trim(),
        data.source.trim(),
        data.destination.trim(),
        format,
        data.server_ids.clone(),
    );
    if let Some(kind) = data.execution_type.as_deref().filter(|k| !k.is_empty()) {
        backup.execution_type = kind.to_string();
    }
    insert(conn, &backup)?;
    find_by_id(conn, &backup.id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created backup"))
}
