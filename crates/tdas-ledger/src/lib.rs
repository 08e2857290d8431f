pub mod actor;
pub mod error;
pub mod journal;
pub mod ledger;

pub use actor::{ChannelSizes, LedgerHandle};
pub use error::LedgerError;
pub use journal::{EventSink, Journal, SessionSink};
pub use ledger::{ApplyOutcome, LedgerSettings, ShadowLedger};
