use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tdas_models::cache_schema::CacheRow;
use tracing::debug;

use crate::error::ContextError;
use crate::memory::MemoryCache;
use crate::sqlite::SqliteReader;

/// Read-through cache: checks moka (hot) → SQLite (shared) → None.
///
/// SQLite hits are promoted to moka for the hot TTL, capped by the row's own
/// expiry. `rusqlite::Connection` is not `Sync`, so SQLite access goes through
/// a `Mutex`.
pub struct CacheReader {
    memory: MemoryCache,
    sqlite: Mutex<SqliteReader>,
}

impl CacheReader {
    pub fn new(sqlite: SqliteReader, max_capacity: u64, memory_ttl: Duration) -> Self {
        Self {
            memory: MemoryCache::new(max_capacity, memory_ttl),
            sqlite: Mutex::new(sqlite),
        }
    }

    fn with_sqlite<T>(
        &self,
        f: impl FnOnce(&SqliteReader) -> Result<T, ContextError>,
    ) -> Result<T, ContextError> {
        let sqlite = self
            .sqlite
            .lock()
            .map_err(|e| ContextError::Unavailable(format!("SQLite mutex poisoned: {e}")))?;
        f(&sqlite)
    }

    /// Raw JSON for a key. Checks moka first, then SQLite.
    pub async fn get_json(&self, key: &str) -> Result<Option<String>, ContextError> {
        if let Some(json) = self.memory.get(key).await {
            return Ok(Some(json));
        }

        let row = self.with_sqlite(|sqlite| sqlite.get(key))?;
        match row {
            Some(row) => {
                let expires_at = match DateTime::parse_from_rfc3339(&row.expires_at) {
                    Ok(at) => Some(at.with_timezone(&Utc)),
                    Err(e) => {
                        debug!(key = %key, expires_at = %row.expires_at, error = %e, "Unparseable expiry, using hot TTL");
                        None
                    }
                };
                self.memory
                    .insert(key.to_string(), row.value_json.clone(), expires_at)
                    .await;
                Ok(Some(row.value_json))
            }
            None => Ok(None),
        }
    }

    /// Typed value for a key.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ContextError> {
        match self.get_json(key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// All live rows matching a key prefix, straight from SQLite.
    pub fn get_by_prefix(&self, prefix: &str) -> Result<Vec<CacheRow>, ContextError> {
        self.with_sqlite(|sqlite| sqlite.get_by_prefix(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn make_row(key: &str, value_json: &str) -> CacheRow {
        let now = Utc::now();
        CacheRow {
            key: key.to_string(),
            category: "market_data".to_string(),
            value_json: value_json.to_string(),
            source: "test".to_string(),
            symbol: Some("AAPL".to_string()),
            created_at: now.to_rfc3339(),
            expires_at: (now + ChronoDuration::seconds(300)).to_rfc3339(),
            updated_at: now.to_rfc3339(),
        }
    }

    fn setup_reader() -> CacheReader {
        let sqlite = SqliteReader::open_in_memory().unwrap();
        sqlite
            .insert(&make_row("quote:AAPL", r#"{"price": 150.25}"#))
            .unwrap();
        sqlite
            .insert(&make_row("indicator:atr_14:AAPL", r#"{"value": 3.5}"#))
            .unwrap();
        CacheReader::new(sqlite, 100, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn sqlite_hit_is_promoted_to_memory() {
        let reader = setup_reader();

        let quote: serde_json::Value = reader.get("quote:AAPL").await.unwrap().unwrap();
        assert_eq!(quote["price"], serde_json::json!(150.25));
        assert!(reader.memory.get("quote:AAPL").await.is_some());
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let reader = setup_reader();
        let value: Option<serde_json::Value> = reader.get("quote:MSFT").await.unwrap();
        assert!(value.is_none());
        assert!(reader.get_json("ref:VIX").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_json_surfaces_as_error() {
        let sqlite = SqliteReader::open_in_memory().unwrap();
        sqlite.insert(&make_row("quote:AAPL", "not json")).unwrap();
        let reader = CacheReader::new(sqlite, 100, Duration::from_secs(60));

        let result: Result<Option<serde_json::Value>, _> = reader.get("quote:AAPL").await;
        assert!(matches!(result, Err(ContextError::Json(_))));
    }

    #[tokio::test]
    async fn promoted_row_keeps_its_shared_expiry() {
        let sqlite = SqliteReader::open_in_memory().unwrap();
        let mut row = make_row("quote:AAPL", r#"{"price": 150.25}"#);
        row.expires_at = (Utc::now() + ChronoDuration::milliseconds(100)).to_rfc3339();
        sqlite.insert(&row).unwrap();
        let reader = CacheReader::new(sqlite, 100, Duration::from_secs(60));

        assert!(reader.get_json("quote:AAPL").await.unwrap().is_some());
        assert!(reader.memory.get("quote:AAPL").await.is_some());

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(reader.memory.get("quote:AAPL").await.is_none());
        assert!(reader.get_json("quote:AAPL").await.unwrap().is_none());
    }

    #[test]
    fn prefix_scan() {
        let reader = setup_reader();
        let rows = reader.get_by_prefix("indicator:").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "indicator:atr_14:AAPL");
    }
}
