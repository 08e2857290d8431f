use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::position::Side;

/// A request to deliberate over one instrument. Triggers a new session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateRequest {
    pub instrument_id: String,
    pub as_of_timestamp: DateTime<Utc>,
    /// Caller-asserted emergency exit; routes an approved decision to the fast path.
    #[serde(default)]
    pub emergency_exit: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    RiskOn,
    Transition,
    RiskOff,
}

/// Technical measures available for the instrument. All optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TechnicalIndicators {
    /// Average true range, in price units.
    #[serde(default)]
    pub atr: Option<Decimal>,
    #[serde(default)]
    pub support: Option<Decimal>,
    #[serde(default)]
    pub resistance: Option<Decimal>,
    /// Any other named indicator (e.g. `rsi_14`, `sma_20`).
    #[serde(default)]
    pub values: BTreeMap<String, Decimal>,
}

impl TechnicalIndicators {
    pub fn get(&self, name: &str) -> Option<Decimal> {
        self.values.get(name).copied()
    }
}

/// Read-only market snapshot for one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketContext {
    pub instrument: String,
    pub price: Decimal,
    pub volatility_index: Decimal,
    pub market_regime: MarketRegime,
    #[serde(default)]
    pub technical_indicators: TechnicalIndicators,
    /// Next (or most recent) earnings date for the instrument.
    #[serde(default)]
    pub earnings_date: Option<NaiveDate>,
    /// News/macro data passed through to providers for display only.
    #[serde(default)]
    pub news: serde_json::Value,
    pub as_of: DateTime<Utc>,
}

/// One open position as seen from outside the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenPosition {
    pub position_id: Uuid,
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub notional: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Consistent snapshot of portfolio state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortfolioContext {
    /// Settled cash plus unrealized P&L of open positions.
    pub total_value: Decimal,
    /// Settled cash not committed to open positions.
    pub available_cash: Decimal,
    /// Change in total value since the start of the trading day, as a fraction.
    pub daily_pnl_pct: Decimal,
    pub open_positions: Vec<OpenPosition>,
}

impl PortfolioContext {
    /// A fresh portfolio holding only cash.
    pub fn cash_only(cash: Decimal) -> Self {
        Self {
            total_value: cash,
            available_cash: cash,
            daily_pnl_pct: Decimal::ZERO,
            open_positions: Vec::new(),
        }
    }

    pub fn positions_in<'a>(&'a self, instrument: &'a str) -> impl Iterator<Item = &'a OpenPosition> {
        self.open_positions
            .iter()
            .filter(move |p| p.instrument == instrument)
    }
}
