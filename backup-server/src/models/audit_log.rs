use backup_engine::models::AuditEntry;
use rusqlite::{params, Connection};

use super::format_time;

pub fn append(conn: &Connection, entry: &AuditEntry) -> anyhow::Result<()> {
    let metadata = entry.metadata.as_ref().map(|m| m.to_string());
    conn.execute(
        "INSERT INTO logs (level, message, entity_type, entity_id, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.level.as_str(),
            entry.message,
            entry.entity_type,
            entry.entity_id,
            metadata,
            format_time(&entry.created_at),
        ],
    )?;
    Ok(())
}

/// `(level, message, metadata)` for one entity, oldest first.
#[cfg(test)]
pub fn find_for_entity(
    conn: &Connection,
    entity_id: &str,
) -> anyhow::Result<Vec<(String, String, Option<serde_json::Value>)>> {
    let mut stmt = conn.prepare(
        "SELECT level, message, metadata FROM logs WHERE entity_id = ? ORDER BY id",
    )?;
    let rows = stmt.query_map(params![entity_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    })?;
    let mut entries = Vec::new();
    for row in rows {
        let (level, message, metadata) = row?;
        let metadata = metadata.map(|m| serde_json::from_str(&m)).transpose()?;
        entries.push((level, message, metadata));
    }
    Ok(entries)
}
