use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{MarketContext, PortfolioContext};
use crate::position::Side;

/// The three provider roles that sit on every deliberation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Trader,
    Risk,
    Analyst,
}

impl Role {
    /// Every role, in the order opinions are reported.
    pub const ALL: [Role; 3] = [Role::Trader, Role::Risk, Role::Analyst];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Trader => "trader",
            Role::Risk => "risk",
            Role::Analyst => "analyst",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Buy,
    Sell,
    Hold,
    Pass,
}

impl Action {
    /// Buy and sell move capital; hold and pass do not.
    pub fn is_trade(&self) -> bool {
        matches!(self, Action::Buy | Action::Sell)
    }

    /// The position side a trade action would open.
    pub fn side(&self) -> Option<Side> {
        match self {
            Action::Buy => Some(Side::Long),
            Action::Sell => Some(Side::Short),
            Action::Hold | Action::Pass => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "buy",
            Action::Sell => "sell",
            Action::Hold => "hold",
            Action::Pass => "pass",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which input produced the stop-loss distance used for sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopSource {
    /// ATR-based volatility measure.
    Volatility,
    /// Nearest support (long) or resistance (short) level plus a buffer.
    Level,
    Default,
}

/// Every intermediate value of the four-stage sizing calculation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SizingBreakdown {
    pub portfolio_value: Decimal,
    pub stop_distance_pct: Decimal,
    pub stop_source: StopSource,
    pub risk_fraction: Decimal,
    pub base_size: Decimal,
    pub confidence: Decimal,
    pub confidence_adjusted: Decimal,
    pub volatility_multiplier: Decimal,
    pub risk_adjusted: Decimal,
    pub hard_cap: Decimal,
    pub final_size: Decimal,
    /// True when the hard cap, not the risk-adjusted size, set `final_size`.
    pub capped: bool,
}

/// Sizing output attached to the Risk-role opinion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskProposal {
    pub position_size: Decimal,
    pub stop_loss: Option<Decimal>,
    pub sizing: Option<SizingBreakdown>,
}

impl RiskProposal {
    /// The proposal carried by a hold/pass vote or a failed sizing run.
    pub fn none() -> Self {
        Self {
            position_size: Decimal::ZERO,
            stop_loss: None,
            sizing: None,
        }
    }
}

/// One provider's structured assessment of a candidate trade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Opinion {
    pub id: Uuid,
    pub role: Role,
    pub provider: String,
    pub action: Action,
    /// 0.0 to 1.0.
    pub confidence: Decimal,
    pub score: Decimal,
    pub reasoning: String,
    /// Risk role only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<RiskProposal>,
    /// Trader role only: the entry price the trader is quoting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<Decimal>,
    /// Analyst role only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub information_score: Option<Decimal>,
    /// Display/audit data. Never read by the arbiter.
    #[serde(default)]
    pub context: serde_json::Value,
    /// Set when the provider failed and this opinion was substituted.
    #[serde(default)]
    pub abstained: bool,
    pub elapsed_ms: u64,
}

impl Opinion {
    /// The conservative opinion substituted for a provider that failed or ran out of time.
    pub fn abstain(role: Role, provider: &str, reason: &str, elapsed_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            provider: provider.to_string(),
            action: Action::Hold,
            confidence: Decimal::ZERO,
            score: Decimal::ZERO,
            reasoning: format!("abstained: {reason}"),
            proposal: (role == Role::Risk).then(RiskProposal::none),
            entry_price: None,
            information_score: None,
            context: serde_json::Value::Null,
            abstained: true,
            elapsed_ms,
        }
    }
}

/// What an external scoring hook returns, before the provider shapes it into an [`Opinion`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawOpinion {
    pub action: Action,
    pub confidence: Decimal,
    #[serde(default)]
    pub score: Option<Decimal>,
    #[serde(default)]
    pub reasoning: String,
    /// Free-form supporting fields (e.g. `entry_price`, `information_score`).
    #[serde(default)]
    pub fields: serde_json::Value,
}

/// Input handed to a scoring hook (serialized as JSON on its stdin).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringRequest {
    pub request_id: Uuid,
    pub session_id: Uuid,
    pub role: Role,
    pub instrument: String,
    pub as_of: DateTime<Utc>,
    pub market: MarketContext,
    pub portfolio: PortfolioContext,
}
