use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing market data for {instrument}: {key}")]
    Missing { instrument: String, key: String },

    #[error("Malformed cache value at {key}: {reason}")]
    Malformed { key: String, reason: String },

    #[error("Cache not available: {0}")]
    Unavailable(String),
}
