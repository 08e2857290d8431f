use chrono::Utc;
use rusqlite::{Connection, Row};
use tdas_models::cache_schema::CacheRow;

use crate::error::ContextError;

const SELECT_COLUMNS: &str =
    "SELECT key, category, value_json, source, symbol, created_at, expires_at, updated_at \
     FROM cache_entries";

/// Read-only accessor for the shared SQLite cache.
///
/// The database is written by external data pipelines; TDAS only reads it.
/// Expired rows are filtered in SQL so callers never see stale market data.
pub struct SqliteReader {
    conn: Connection,
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<CacheRow> {
    Ok(CacheRow {
        key: row.get(0)?,
        category: row.get(1)?,
        value_json: row.get(2)?,
        source: row.get(3)?,
        symbol: row.get(4)?,
        created_at: row.get(5)?,
        expires_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl SqliteReader {
    /// Open a read-only connection to the shared cache database.
    pub fn open(path: &str) -> Result<Self, ContextError> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// Open a writable in-memory database with the schema created. Used by tests to seed data.
    pub fn open_in_memory() -> Result<Self, ContextError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(tdas_models::cache_schema::CACHE_TABLE_DDL)?;
        Ok(Self { conn })
    }

    /// Get a single live entry by key.
    pub fn get(&self, key: &str) -> Result<Option<CacheRow>, ContextError> {
        let now = Utc::now().to_rfc3339();
        let mut stmt = self.conn.prepare_cached(&format!(
            "{SELECT_COLUMNS} WHERE key = ?1 AND expires_at > ?2"
        ))?;

        match stmt.query_row(rusqlite::params![key, now], map_row) {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(ContextError::Sqlite(e)),
        }
    }

    /// Get all live entries whose key starts with `prefix`.
    pub fn get_by_prefix(&self, prefix: &str) -> Result<Vec<CacheRow>, ContextError> {
        let now = Utc::now().to_rfc3339();
        let like_pattern = format!("{prefix}%");
        let mut stmt = self.conn.prepare_cached(&format!(
            "{SELECT_COLUMNS} WHERE key LIKE ?1 AND expires_at > ?2 ORDER BY key"
        ))?;

        let rows = stmt
            .query_map(rusqlite::params![like_pattern, now], map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Upsert an entry. Data pipelines write the table directly; this exists for tests.
    pub fn insert(&self, row: &CacheRow) -> Result<(), ContextError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO cache_entries \
             (key, category, value_json, source, symbol, created_at, expires_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                row.key,
                row.category,
                row.value_json,
                row.source,
                row.symbol,
                row.created_at,
                row.expires_at,
                row.updated_at,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_row(key: &str, ttl_seconds: i64) -> CacheRow {
        let now = Utc::now();
        CacheRow {
            key: key.to_string(),
            category: "indicator".to_string(),
            value_json: r#"{"value": 3.1}"#.to_string(),
            source: "test".to_string(),
            symbol: Some("AAPL".to_string()),
            created_at: now.to_rfc3339(),
            expires_at: (now + Duration::seconds(ttl_seconds)).to_rfc3339(),
            updated_at: now.to_rfc3339(),
        }
    }

    #[test]
    fn get_live_key() {
        let reader = SqliteReader::open_in_memory().unwrap();
        reader.insert(&make_row("indicator:atr_14:AAPL", 300)).unwrap();

        let row = reader.get("indicator:atr_14:AAPL").unwrap().unwrap();
        assert_eq!(row.value_json, r#"{"value": 3.1}"#);
        assert!(reader.get("indicator:atr_14:MSFT").unwrap().is_none());
    }

    #[test]
    fn expired_key_is_invisible() {
        let reader = SqliteReader::open_in_memory().unwrap();
        reader.insert(&make_row("quote:AAPL", -10)).unwrap();

        assert!(reader.get("quote:AAPL").unwrap().is_none());
    }

    #[test]
    fn prefix_scan_skips_expired_rows() {
        let reader = SqliteReader::open_in_memory().unwrap();
        reader.insert(&make_row("indicator:atr_14:AAPL", 300)).unwrap();
        reader.insert(&make_row("indicator:rsi_14:AAPL", 300)).unwrap();
        reader.insert(&make_row("indicator:sma_20:AAPL", -5)).unwrap();
        reader.insert(&make_row("quote:AAPL", 300)).unwrap();

        let rows = reader.get_by_prefix("indicator:").unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["indicator:atr_14:AAPL", "indicator:rsi_14:AAPL"]);
    }
}
