//! Row mapping between SQLite tables and engine records.

pub mod audit_log;
pub mod backup;
pub mod progress;
pub mod server;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use std::str::FromStr;

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}

pub(crate) fn get_time(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(conversion_error)
}

pub(crate) fn get_opt_time(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(conversion_error)
    })
    .transpose()
}

/// Parse a text column through the record's `FromStr`.
pub(crate) fn get_parsed<T>(row: &Row, column: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(column)?;
    raw.parse().map_err(conversion_error)
}

pub(crate) fn get_u64(row: &Row, column: &str) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(column)?;
    Ok(raw.max(0) as u64)
}

pub(crate) fn get_opt_u64(row: &Row, column: &str) -> rusqlite::Result<Option<u64>> {
    let raw: Option<i64> = row.get(column)?;
    Ok(raw.map(|v| v.max(0) as u64))
}

pub(crate) fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
