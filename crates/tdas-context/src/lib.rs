pub mod error;
pub mod memory;
pub mod reader;
pub mod source;
pub mod sqlite;

pub use error::ContextError;
pub use reader::CacheReader;
pub use source::{CacheContextSource, MarketContextSource, StaticContextSource};
pub use sqlite::SqliteReader;
