use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::PortfolioContext;
use crate::opinion::{Action, Role};
use crate::position::Side;

/// Identifiers of the eight portfolio-safety rules, in evaluation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    PositionLimit,
    LowConfidenceSize,
    StopLossRequired,
    StopLossDistance,
    EarningsBlackout,
    DailyLossLimit,
    ExtremeVolatility,
    RiskOffVolatility,
}

impl RuleId {
    pub const ALL: [RuleId; 8] = [
        RuleId::PositionLimit,
        RuleId::LowConfidenceSize,
        RuleId::StopLossRequired,
        RuleId::StopLossDistance,
        RuleId::EarningsBlackout,
        RuleId::DailyLossLimit,
        RuleId::ExtremeVolatility,
        RuleId::RiskOffVolatility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::PositionLimit => "position_limit",
            RuleId::LowConfidenceSize => "low_confidence_size",
            RuleId::StopLossRequired => "stop_loss_required",
            RuleId::StopLossDistance => "stop_loss_distance",
            RuleId::EarningsBlackout => "earnings_blackout",
            RuleId::DailyLossLimit => "daily_loss_limit",
            RuleId::ExtremeVolatility => "extreme_volatility",
            RuleId::RiskOffVolatility => "risk_off_volatility",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one rule for one decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleCheck {
    pub rule: RuleId,
    /// False when the decision's action or intent exempts it from this rule.
    pub applicable: bool,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    Fast,
    Deliberative,
}

/// Why the router chose its path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    NewEntry,
    Rebalance,
    OversizedPosition,
    StopBreached,
    DailyLossLimit,
    ExtremeVolatility,
    EmergencyExit,
    Default,
}

/// How a trade action relates to what the portfolio already holds in the instrument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TradeIntent {
    /// No open position in the instrument.
    Entry,
    /// Adds to an open position on the same side.
    Increase,
    /// Opposes an open position; closes it.
    Exit,
    /// Hold or pass.
    Stand,
}

impl TradeIntent {
    pub fn classify(action: Action, instrument: &str, portfolio: &PortfolioContext) -> Self {
        let Some(side) = action.side() else {
            return TradeIntent::Stand;
        };
        let mut same = false;
        for position in portfolio.positions_in(instrument) {
            if position.side == side.opposite() {
                return TradeIntent::Exit;
            }
            if position.side == side {
                same = true;
            }
        }
        if same {
            TradeIntent::Increase
        } else {
            TradeIntent::Entry
        }
    }

    /// Entries and increases put new capital at risk.
    pub fn is_entering(&self) -> bool {
        matches!(self, TradeIntent::Entry | TradeIntent::Increase)
    }
}

/// The fields of a decision the rule gate inspects.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeTerms<'a> {
    pub instrument: &'a str,
    pub action: Action,
    pub weighted_confidence: Decimal,
    pub position_size: Decimal,
    pub stop_loss: Option<Decimal>,
    pub entry_price: Option<Decimal>,
}

/// One provider's vote and its weighted contribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightedVote {
    pub role: Role,
    pub opinion_id: Uuid,
    pub action: Action,
    pub confidence: Decimal,
    pub weight: Decimal,
    pub contribution: Decimal,
    pub abstained: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    AnyHold,
    AnyPass,
    DefaultHold,
}

/// How the arbiter arrived at the action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionSelection {
    Majority { action: Action, votes: u8 },
    TieBreak { action: Action, rule: TieBreak },
}

impl ActionSelection {
    pub fn action(&self) -> Action {
        match self {
            ActionSelection::Majority { action, .. } | ActionSelection::TieBreak { action, .. } => {
                *action
            }
        }
    }
}

/// Reasoning text copied verbatim from one input opinion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributedReasoning {
    pub role: Role,
    pub opinion_id: Uuid,
    pub text: String,
}

/// Traces every field of a draft decision back to the opinions it was taken from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub votes: Vec<WeightedVote>,
    pub selection: ActionSelection,
    /// Opinion that supplied `position_size` and `stop_loss`.
    pub sizing_from: Uuid,
    /// Opinion that supplied `entry_price`, if any did.
    pub entry_from: Option<Uuid>,
    pub reasoning: Vec<AttributedReasoning>,
}

/// The arbiter's output: a combination of input opinion fields, not yet gated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DraftDecision {
    pub instrument: String,
    pub action: Action,
    pub weighted_confidence: Decimal,
    pub position_size: Decimal,
    pub stop_loss: Option<Decimal>,
    pub entry_price: Option<Decimal>,
    pub provenance: Provenance,
}

impl DraftDecision {
    pub fn terms(&self) -> TradeTerms<'_> {
        TradeTerms {
            instrument: &self.instrument,
            action: self.action,
            weighted_confidence: self.weighted_confidence,
            position_size: self.position_size,
            stop_loss: self.stop_loss,
            entry_price: self.entry_price,
        }
    }
}

/// What the arbiter proposed before the gate finalized the decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedTerms {
    pub action: Action,
    pub position_size: Decimal,
    pub stop_loss: Option<Decimal>,
}

/// The combined, gated and routed output of one session.
///
/// When `approved` is false, `action` is `Pass` and `position_size` is zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: Uuid,
    pub instrument: String,
    pub action: Action,
    pub weighted_confidence: Decimal,
    pub position_size: Decimal,
    pub stop_loss: Option<Decimal>,
    pub entry_price: Option<Decimal>,
    pub approved: bool,
    pub violated_rules: Vec<RuleId>,
    pub rule_checks: Vec<RuleCheck>,
    pub intent: TradeIntent,
    /// Set only for approved decisions.
    pub execution_path: Option<ExecutionPath>,
    pub route_reason: Option<RouteReason>,
    pub proposed: ProposedTerms,
    pub provenance: Provenance,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn terms(&self) -> TradeTerms<'_> {
        TradeTerms {
            instrument: &self.instrument,
            action: self.action,
            weighted_confidence: self.weighted_confidence,
            position_size: self.position_size,
            stop_loss: self.stop_loss,
            entry_price: self.entry_price,
        }
    }

    /// The side an executable decision would open.
    pub fn side(&self) -> Option<Side> {
        self.action.side()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OpenPosition;
    use rust_decimal_macros::dec;

    fn holding(side: Side) -> PortfolioContext {
        let mut portfolio = PortfolioContext::cash_only(dec!(100000));
        portfolio.open_positions.push(OpenPosition {
            position_id: Uuid::new_v4(),
            instrument: "AAPL".to_string(),
            side,
            quantity: dec!(10),
            entry_price: dec!(150),
            stop_loss: dec!(142.50),
            notional: dec!(1500),
            unrealized_pnl: Decimal::ZERO,
        });
        portfolio
    }

    #[test]
    fn rule_ids_serialize_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&RuleId::DailyLossLimit).unwrap(),
            "\"daily_loss_limit\""
        );
        assert_eq!(RuleId::ALL.len(), 8);
        assert_eq!(RuleId::ALL[3].as_str(), "stop_loss_distance");
    }

    #[test]
    fn intent_without_holdings_is_entry() {
        let portfolio = PortfolioContext::cash_only(dec!(100000));
        assert_eq!(
            TradeIntent::classify(Action::Buy, "AAPL", &portfolio),
            TradeIntent::Entry
        );
        assert_eq!(
            TradeIntent::classify(Action::Hold, "AAPL", &portfolio),
            TradeIntent::Stand
        );
    }

    #[test]
    fn intent_against_holdings() {
        let long = holding(Side::Long);
        assert_eq!(
            TradeIntent::classify(Action::Buy, "AAPL", &long),
            TradeIntent::Increase
        );
        assert_eq!(
            TradeIntent::classify(Action::Sell, "AAPL", &long),
            TradeIntent::Exit
        );
        assert_eq!(
            TradeIntent::classify(Action::Sell, "TSLA", &long),
            TradeIntent::Entry
        );
        assert!(TradeIntent::Increase.is_entering());
        assert!(!TradeIntent::Exit.is_entering());
    }

    #[test]
    fn action_selection_tagging() {
        let selection = ActionSelection::TieBreak {
            action: Action::Hold,
            rule: TieBreak::AnyHold,
        };
        let json = serde_json::to_value(&selection).unwrap();
        assert_eq!(json["kind"], "tie_break");
        assert_eq!(json["rule"], "any_hold");
        assert_eq!(selection.action(), Action::Hold);
    }
}
