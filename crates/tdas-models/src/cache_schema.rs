use serde::{Deserialize, Serialize};

/// Categories for organizing cache keys.
/// Data pipelines use these when writing to the shared SQLite cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    MarketData,
    Indicator,
    ReferenceSymbol,
    Regime,
    Level,
    Calendar,
    News,
}

/// The SQLite table schema that data pipelines write to and TDAS reads from.
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS cache_entries (
///     key         TEXT PRIMARY KEY,
///     category    TEXT NOT NULL,
///     value_json  TEXT NOT NULL,
///     source      TEXT NOT NULL,
///     symbol      TEXT,
///     created_at  TEXT NOT NULL,
///     expires_at  TEXT NOT NULL,
///     updated_at  TEXT NOT NULL
/// );
/// ```
pub const CACHE_TABLE_DDL: &str = "\
CREATE TABLE IF NOT EXISTS cache_entries (
    key         TEXT PRIMARY KEY,
    category    TEXT NOT NULL,
    value_json  TEXT NOT NULL,
    source      TEXT NOT NULL,
    symbol      TEXT,
    created_at  TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_category ON cache_entries(category);
CREATE INDEX IF NOT EXISTS idx_cache_symbol ON cache_entries(symbol);
CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);
";

/// Key pattern conventions for the cache.
///
/// - Quotes: `quote:{symbol}` → `{"price": ..}`
/// - Volatility index: `ref:VIX` → `{"value": ..}`
/// - Market regime: `regime:market` → `{"regime": "risk_on" | "transition" | "risk_off"}`
/// - Indicators: `indicator:{name}:{symbol}` → `{"value": ..}` (e.g. `indicator:atr_14:AAPL`)
/// - Price levels: `level:support:{symbol}`, `level:resistance:{symbol}` → `{"value": ..}`
/// - Earnings calendar: `calendar:earnings:{symbol}` → `{"date": "YYYY-MM-DD"}`
/// - News: `news:{symbol}` → free-form JSON, display only
pub mod key_patterns {
    pub const VOLATILITY_INDEX: &str = "ref:VIX";
    pub const MARKET_REGIME: &str = "regime:market";
    pub const INDICATOR_PREFIX: &str = "indicator:";

    pub fn quote(symbol: &str) -> String {
        format!("quote:{symbol}")
    }

    pub fn indicator(name: &str, symbol: &str) -> String {
        format!("indicator:{name}:{symbol}")
    }

    pub fn support(symbol: &str) -> String {
        format!("level:support:{symbol}")
    }

    pub fn resistance(symbol: &str) -> String {
        format!("level:resistance:{symbol}")
    }

    pub fn earnings(symbol: &str) -> String {
        format!("calendar:earnings:{symbol}")
    }

    pub fn news(symbol: &str) -> String {
        format!("news:{symbol}")
    }

    /// Split `indicator:{name}:{symbol}` into its name, if the key belongs to `symbol`.
    pub fn indicator_name<'a>(key: &'a str, symbol: &str) -> Option<&'a str> {
        key.strip_prefix(INDICATOR_PREFIX)?
            .strip_suffix(symbol)?
            .strip_suffix(':')
    }
}

/// A raw cache row as read from SQLite.
#[derive(Debug, Clone)]
pub struct CacheRow {
    pub key: String,
    pub category: String,
    pub value_json: String,
    pub source: String,
    pub symbol: Option<String>,
    pub created_at: String,
    pub expires_at: String,
    pub updated_at: String,
}
