use rust_decimal::Decimal;
use tdas_models::config::{ConfigError, WeightsConfig};
use tdas_models::decision::{
    ActionSelection, AttributedReasoning, DraftDecision, Provenance, TieBreak, WeightedVote,
};
use tdas_models::opinion::{Action, Opinion, RiskProposal, Role};
use tracing::debug;

use crate::error::AgentError;

/// Exactly one opinion per role.
#[derive(Debug, Clone, PartialEq)]
pub struct OpinionSet {
    trader: Opinion,
    risk: Opinion,
    analyst: Opinion,
}

impl OpinionSet {
    pub fn new(trader: Opinion, risk: Opinion, analyst: Opinion) -> Result<Self, AgentError> {
        for (expected, opinion) in [
            (Role::Trader, &trader),
            (Role::Risk, &risk),
            (Role::Analyst, &analyst),
        ] {
            if opinion.role != expected {
                return Err(AgentError::MalformedOpinions(format!(
                    "expected a {expected} opinion, got {}",
                    opinion.role
                )));
            }
        }
        if risk.proposal.is_none() {
            return Err(AgentError::MalformedOpinions(
                "risk opinion carries no sizing proposal".to_string(),
            ));
        }
        Ok(Self {
            trader,
            risk,
            analyst,
        })
    }

    /// Build from opinions in any order. Missing or repeated roles are malformed.
    pub fn from_opinions(opinions: Vec<Opinion>) -> Result<Self, AgentError> {
        let mut trader = None;
        let mut risk = None;
        let mut analyst = None;
        for opinion in opinions {
            let slot = match opinion.role {
                Role::Trader => &mut trader,
                Role::Risk => &mut risk,
                Role::Analyst => &mut analyst,
            };
            if slot.is_some() {
                return Err(AgentError::MalformedOpinions(format!(
                    "more than one {} opinion",
                    opinion.role
                )));
            }
            *slot = Some(opinion);
        }
        match (trader, risk, analyst) {
            (Some(t), Some(r), Some(a)) => Self::new(t, r, a),
            _ => Err(AgentError::MalformedOpinions(
                "expected one opinion per role".to_string(),
            )),
        }
    }

    pub fn get(&self, role: Role) -> &Opinion {
        match role {
            Role::Trader => &self.trader,
            Role::Risk => &self.risk,
            Role::Analyst => &self.analyst,
        }
    }

    /// Opinions in role order.
    pub fn iter(&self) -> impl Iterator<Item = &Opinion> {
        [&self.trader, &self.risk, &self.analyst].into_iter()
    }

    pub fn into_vec(self) -> Vec<Opinion> {
        vec![self.trader, self.risk, self.analyst]
    }
}

/// Majority vote over the three actions, with the hold → pass → hold tie-break.
pub fn select_action(actions: [Action; 3]) -> ActionSelection {
    for candidate in actions {
        let votes = actions.iter().filter(|a| **a == candidate).count();
        if votes >= 2 {
            return ActionSelection::Majority {
                action: candidate,
                votes: votes as u8,
            };
        }
    }
    if actions.contains(&Action::Hold) {
        ActionSelection::TieBreak {
            action: Action::Hold,
            rule: TieBreak::AnyHold,
        }
    } else if actions.contains(&Action::Pass) {
        ActionSelection::TieBreak {
            action: Action::Pass,
            rule: TieBreak::AnyPass,
        }
    } else {
        ActionSelection::TieBreak {
            action: Action::Hold,
            rule: TieBreak::DefaultHold,
        }
    }
}

/// Combines one opinion per role into a draft decision.
///
/// The draft only selects or numerically combines fields already present in the
/// opinions: the weighted confidence, the voted action, the Risk opinion's size and
/// stop, the Trader's entry price. Every field is traced in its [`Provenance`].
#[derive(Debug, Clone)]
pub struct Arbiter {
    weights: WeightsConfig,
}

impl Arbiter {
    pub fn new(weights: WeightsConfig) -> Result<Self, ConfigError> {
        weights.validate()?;
        Ok(Self { weights })
    }

    pub fn weights(&self) -> &WeightsConfig {
        &self.weights
    }

    pub fn combine(&self, instrument: &str, opinions: &OpinionSet) -> DraftDecision {
        let votes: Vec<WeightedVote> = opinions
            .iter()
            .map(|opinion| {
                let weight = self.weights.weight(opinion.role);
                WeightedVote {
                    role: opinion.role,
                    opinion_id: opinion.id,
                    action: opinion.action,
                    confidence: opinion.confidence,
                    weight,
                    contribution: opinion.confidence * weight,
                    abstained: opinion.abstained,
                }
            })
            .collect();
        let weighted_confidence: Decimal = votes.iter().map(|v| v.contribution).sum();

        let selection = select_action([
            opinions.get(Role::Trader).action,
            opinions.get(Role::Risk).action,
            opinions.get(Role::Analyst).action,
        ]);

        let risk = opinions.get(Role::Risk);
        let none = RiskProposal::none();
        let proposal = risk.proposal.as_ref().unwrap_or(&none);

        let trader = opinions.get(Role::Trader);
        let entry_price = trader.entry_price;

        let reasoning = opinions
            .iter()
            .filter(|o| !o.reasoning.is_empty())
            .map(|o| AttributedReasoning {
                role: o.role,
                opinion_id: o.id,
                text: o.reasoning.clone(),
            })
            .collect();

        let action = selection.action();
        debug!(
            instrument = %instrument,
            action = %action,
            weighted_confidence = %weighted_confidence,
            selection = ?selection,
            "Arbiter combined opinions"
        );

        DraftDecision {
            instrument: instrument.to_string(),
            action,
            weighted_confidence,
            position_size: proposal.position_size,
            stop_loss: proposal.stop_loss,
            entry_price,
            provenance: Provenance {
                votes,
                selection,
                sizing_from: risk.id,
                entry_from: entry_price.map(|_| trader.id),
                reasoning,
            },
        }
    }
}
