use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tdas_models::position::PositionEvent;
use tdas_models::session::SessionRecord;
use tracing::debug;
use uuid::Uuid;

use crate::error::LedgerError;

/// Receives position events after every ledger mutation.
pub trait EventSink: Send + Sync {
    fn append_events(&self, events: &[PositionEvent]) -> Result<(), LedgerError>;
}

/// Receives the audit record of every completed session.
pub trait SessionSink: Send + Sync {
    fn append_session(&self, record: &SessionRecord) -> Result<(), LedgerError>;
}

const JOURNAL_DDL: &str = "\
CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    instrument  TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    approved    INTEGER NOT NULL,
    record_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_instrument ON sessions(instrument);
CREATE TABLE IF NOT EXISTS position_events (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    position_id TEXT NOT NULL,
    instrument  TEXT NOT NULL,
    kind        TEXT NOT NULL,
    at          TEXT NOT NULL,
    event_json  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_position ON position_events(position_id);
";

/// Append-only SQLite audit journal for sessions and position events.
///
/// `rusqlite::Connection` is not `Sync`, so access goes through a `Mutex`.
pub struct Journal {
    conn: Mutex<Connection>,
}

impl Journal {
    /// Open (or create) a file-backed journal in WAL mode.
    pub fn open(path: &str) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(JOURNAL_DDL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(JOURNAL_DDL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| LedgerError::Unavailable(format!("journal mutex poisoned: {e}")))?;
        f(&mut conn)
    }

    /// Session records for an instrument, oldest first.
    pub fn sessions_for(&self, instrument: &str) -> Result<Vec<SessionRecord>, LedgerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT record_json FROM sessions WHERE instrument = ?1 ORDER BY started_at, rowid",
            )?;
            let rows = stmt
                .query_map([instrument], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|json| serde_json::from_str(json).map_err(LedgerError::from))
                .collect()
        })
    }

    pub fn session(&self, id: Uuid) -> Result<Option<SessionRecord>, LedgerError> {
        self.with_conn(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT record_json FROM sessions WHERE id = ?1",
                    [id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            json.map(|j| serde_json::from_str(&j).map_err(LedgerError::from))
                .transpose()
        })
    }

    /// Events for one position in append order.
    pub fn events_for(&self, position_id: Uuid) -> Result<Vec<PositionEvent>, LedgerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT event_json FROM position_events WHERE position_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt
                .query_map([position_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|json| serde_json::from_str(json).map_err(LedgerError::from))
                .collect()
        })
    }

    pub fn session_count(&self) -> Result<u64, LedgerError> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?)
        })
    }

    pub fn event_count(&self) -> Result<u64, LedgerError> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM position_events", [], |row| {
                row.get(0)
            })?)
        })
    }
}

impl SessionSink for Journal {
    fn append_session(&self, record: &SessionRecord) -> Result<(), LedgerError> {
        let json = serde_json::to_string(record)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, instrument, started_at, approved, record_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    record.id.to_string(),
                    record.instrument,
                    record.started_at.to_rfc3339(),
                    record.decision.approved,
                    json,
                ],
            )?;
            Ok(())
        })?;
        debug!(session_id = %record.id, instrument = %record.instrument, "Journaled session");
        Ok(())
    }
}

impl EventSink for Journal {
    fn append_events(&self, events: &[PositionEvent]) -> Result<(), LedgerError> {
        let rows = events
            .iter()
            .map(|e| Ok((e, serde_json::to_string(e)?)))
            .collect::<Result<Vec<_>, LedgerError>>()?;
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO position_events (position_id, instrument, kind, at, event_json) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (event, json) in &rows {
                    stmt.execute(rusqlite::params![
                        event.position_id().to_string(),
                        event.instrument(),
                        event.kind(),
                        event.at().to_rfc3339(),
                        json,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn closed(position_id: Uuid) -> PositionEvent {
        PositionEvent::ClosedManual {
            position_id,
            instrument: "AAPL".to_string(),
            exit_price: dec!(151.20),
            realized_pnl: dec!(36.00),
            at: Utc::now(),
        }
    }

    fn marked(position_id: Uuid) -> PositionEvent {
        PositionEvent::Marked {
            position_id,
            instrument: "AAPL".to_string(),
            price: dec!(149.10),
            unrealized_pnl: dec!(-27.00),
            at: Utc::now(),
        }
    }

    #[test]
    fn events_round_trip_in_order() {
        let journal = Journal::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        journal
            .append_events(&[marked(id), marked(Uuid::new_v4()), closed(id)])
            .unwrap();

        let events = journal.events_for(id).unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["marked", "closed_manual"]);
        assert_eq!(journal.event_count().unwrap(), 3);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let journal = Journal::open_in_memory().unwrap();
        journal.append_events(&[]).unwrap();
        assert_eq!(journal.event_count().unwrap(), 0);
        assert_eq!(journal.session_count().unwrap(), 0);
    }

    #[test]
    fn file_backed_journal_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let id = Uuid::new_v4();
        {
            let journal = Journal::open(path.to_str().unwrap()).unwrap();
            journal.append_events(&[closed(id)]).unwrap();
        }

        let reopened = Journal::open(path.to_str().unwrap()).unwrap();
        assert_eq!(reopened.events_for(id).unwrap().len(), 1);
    }
}
