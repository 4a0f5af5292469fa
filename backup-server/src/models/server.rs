use backup_engine::models::{HostKind, TargetHost};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::get_parsed;

fn row_to_server(row: &Row) -> rusqlite::Result<TargetHost> {
    let port: Option<i64> = row.get("ssh_port")?;
    Ok(TargetHost {
        id: row.get("id")?,
        name: row.get("name")?,
        kind: get_parsed::<HostKind>(row, "type")?,
        host: row.get("host")?,
        ssh_user: row.get("ssh_user")?,
        ssh_key_path: row.get("ssh_key_path")?,
        ssh_port: port.and_then(|p| u16::try_from(p).ok()),
        transfer_type: row.get("transfer_type")?,
    })
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<TargetHost>> {
    let server = conn
        .query_row("SELECT * FROM servers WHERE id = ?", params![id], row_to_server)
        .optional()?;
    Ok(server)
}

pub fn exists(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM servers WHERE id = ?",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[cfg(test)]
pub fn insert(conn: &Connection, server: &TargetHost) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO servers (id, name, type, host, ssh_user, ssh_key_path, ssh_port, transfer_type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            server.id,
            server.name,
            server.kind.as_str(),
            server.host,
            server.ssh_user,
            server.ssh_key_path,
            server.ssh_port.map(i64::from),
            server.transfer_type,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::memory_pool;
    use crate::db::migrate::migrate;

    #[test]
    fn test_remote_server_round_trip() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        migrate(&pool)?;
        let conn = pool.get()?;

        let mut remote = TargetHost::remote("r1", "offsite", "10.0.0.5", "backup", "/keys/id", 2222);
        remote.transfer_type = Some("scp".into());
        insert(&conn, &remote)?;

        let stored = find_by_id(&conn, "r1")?.expect("stored server");
        assert_eq!(stored.kind, HostKind::Remote);
        assert_eq!(stored.ssh_port, Some(2222));
        assert_eq!(stored.transfer_type.as_deref(), Some("scp"));
        assert!(exists(&conn, "r1")?);
        assert!(!exists(&conn, "r2")?);
        assert!(find_by_id(&conn, "r2")?.is_none());
        Ok(())
    }
}
