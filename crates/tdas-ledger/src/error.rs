use rust_decimal::Decimal;
use tdas_models::session::LedgerRejection;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient funds: opening requires {required}, only {available} available")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("Invalid stop-loss: {0}")]
    InvalidStop(String),

    #[error("Decision is not executable: {0}")]
    NotExecutable(String),

    #[error("Unknown position: {0}")]
    UnknownPosition(Uuid),

    #[error("Position {0} is already closed")]
    AlreadyClosed(Uuid),

    #[error("Ledger actor is not running")]
    Closed,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Journal not available: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// The structured reason recorded on an approved decision the ledger declined.
    /// `None` for faults that are not a refusal to execute.
    pub fn rejection(&self) -> Option<LedgerRejection> {
        match self {
            LedgerError::InsufficientFunds {
                required,
                available,
            } => Some(LedgerRejection::InsufficientFunds {
                required: *required,
                available: *available,
            }),
            LedgerError::InvalidStop(detail) => Some(LedgerRejection::InvalidStop {
                detail: detail.clone(),
            }),
            LedgerError::NotExecutable(detail) => Some(LedgerRejection::NotExecutable {
                detail: detail.clone(),
            }),
            _ => None,
        }
    }
}
