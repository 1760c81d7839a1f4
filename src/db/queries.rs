use rusqlite::params;
use serde::Serialize;

use super::{Database, DbError};

#[derive(Debug, Clone, Serialize)]
pub struct KvRow {
    pub key: String,
    pub value: String,
    pub size_bytes: i64,
    pub updated_at: String,
}

pub fn upsert_entry(db: &Database, row: &KvRow) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        "INSERT INTO kv_entries (key, value, size_bytes, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key)
         DO UPDATE SET value = excluded.value,
                       size_bytes = excluded.size_bytes,
                       updated_at = excluded.updated_at",
        params![row.key, row.value, row.size_bytes, row.updated_at],
    )?;
    Ok(())
}

pub fn get_value(db: &Database, key: &str) -> Result<Option<String>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare("SELECT value FROM kv_entries WHERE key = ?1")?;
    let mut rows = stmt.query_map(params![key], |row| row.get(0))?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

/// Returns whether a row was deleted.
pub fn delete_entry(db: &Database, key: &str) -> Result<bool, DbError> {
    let conn = db.conn();
    let changed = conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
    Ok(changed > 0)
}

pub fn list_keys(db: &Database) -> Result<Vec<String>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare("SELECT key FROM kv_entries ORDER BY key")?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn total_size(db: &Database) -> Result<i64, DbError> {
    let conn = db.conn();
    let total: i64 =
        conn.query_row("SELECT COALESCE(SUM(size_bytes), 0) FROM kv_entries", [], |row| {
            row.get(0)
        })?;
    Ok(total)
}
