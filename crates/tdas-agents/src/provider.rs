use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tdas_context::source::decimal_from_json;
use tdas_models::config::{ProviderConfig, ProvidersConfig, SizingConfig};
use tdas_models::opinion::{Action, Opinion, RawOpinion, RiskProposal, Role, ScoringRequest};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AgentError;
use crate::hook::{CommandHook, ScoringHook};
use crate::parser::validate_raw_opinion;
use crate::sizing::SizingEngine;

/// A source of opinions for one role. Mockable for testing.
#[async_trait]
pub trait OpinionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn role(&self) -> Role;
    /// Time allowed for one `produce_opinion` call.
    fn budget(&self) -> Duration;

    async fn produce_opinion(&self, request: &ScoringRequest) -> Result<Opinion, AgentError>;
}

/// Build the opinion common to every role from a validated raw opinion.
fn base_opinion(role: Role, provider: &str, raw: RawOpinion) -> Opinion {
    Opinion {
        id: Uuid::new_v4(),
        role,
        provider: provider.to_string(),
        action: raw.action,
        confidence: raw.confidence,
        score: raw.score.unwrap_or(raw.confidence),
        reasoning: raw.reasoning,
        proposal: None,
        entry_price: None,
        information_score: None,
        context: raw.fields,
        abstained: false,
        elapsed_ms: 0,
    }
}

/// Optional decimal in the raw opinion's `fields`.
fn optional_field(fields: &serde_json::Value, name: &str) -> Result<Option<Decimal>, AgentError> {
    match fields.get(name) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => decimal_from_json(name, value)
            .map(Some)
            .map_err(|e| AgentError::InvalidOpinion(e.to_string())),
    }
}

async fn score_validated(
    hook: &dyn ScoringHook,
    request: &ScoringRequest,
) -> Result<RawOpinion, AgentError> {
    let raw = hook.score(request).await?;
    validate_raw_opinion(&raw)?;
    Ok(raw)
}

/// Directional view. May suggest an entry price.
pub struct TraderProvider {
    name: String,
    hook: Arc<dyn ScoringHook>,
    budget: Duration,
}

impl TraderProvider {
    pub fn new(name: impl Into<String>, hook: Arc<dyn ScoringHook>, budget: Duration) -> Self {
        Self {
            name: name.into(),
            hook,
            budget,
        }
    }
}

#[async_trait]
impl OpinionProvider for TraderProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        Role::Trader
    }

    fn budget(&self) -> Duration {
        self.budget
    }

    async fn produce_opinion(&self, request: &ScoringRequest) -> Result<Opinion, AgentError> {
        let raw = score_validated(self.hook.as_ref(), request).await?;
        let entry_price = optional_field(&raw.fields, "entry_price")?;
        let mut opinion = base_opinion(Role::Trader, &self.name, raw);
        if opinion.action.is_trade() {
            opinion.entry_price = entry_price.filter(|p| *p > Decimal::ZERO);
        }
        Ok(opinion)
    }
}

/// Risk view. Sizes its own buy/sell vote through the sizing engine.
pub struct RiskProvider {
    name: String,
    hook: Arc<dyn ScoringHook>,
    budget: Duration,
    sizing: SizingEngine,
}

impl RiskProvider {
    pub fn new(
        name: impl Into<String>,
        hook: Arc<dyn ScoringHook>,
        budget: Duration,
        sizing: SizingEngine,
    ) -> Self {
        Self {
            name: name.into(),
            hook,
            budget,
            sizing,
        }
    }
}

#[async_trait]
impl OpinionProvider for RiskProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        Role::Risk
    }

    fn budget(&self) -> Duration {
        self.budget
    }

    async fn produce_opinion(&self, request: &ScoringRequest) -> Result<Opinion, AgentError> {
        let raw = score_validated(self.hook.as_ref(), request).await?;
        let mut opinion = base_opinion(Role::Risk, &self.name, raw);

        let Some(side) = opinion.action.side() else {
            opinion.proposal = Some(RiskProposal::none());
            return Ok(opinion);
        };

        match self.sizing.propose(
            side,
            &request.market,
            request.portfolio.total_value,
            opinion.confidence,
        ) {
            Ok(proposal) => {
                debug!(
                    instrument = %request.instrument,
                    size = %proposal.position_size,
                    stop_loss = ?proposal.stop_loss,
                    "Risk provider sized trade"
                );
                opinion.proposal = Some(proposal);
            }
            Err(e) => {
                warn!(
                    instrument = %request.instrument,
                    action = %opinion.action,
                    error = %e,
                    "Sizing failed, downgrading to hold"
                );
                opinion.reasoning = if opinion.reasoning.is_empty() {
                    format!("downgraded to hold: {e}")
                } else {
                    format!("{} (downgraded to hold: {e})", opinion.reasoning)
                };
                opinion.action = Action::Hold;
                opinion.proposal = Some(RiskProposal::none());
            }
        }
        Ok(opinion)
    }
}

/// Information view. Its score and context are display-only.
pub struct AnalystProvider {
    name: String,
    hook: Arc<dyn ScoringHook>,
    budget: Duration,
}

impl AnalystProvider {
    pub fn new(name: impl Into<String>, hook: Arc<dyn ScoringHook>, budget: Duration) -> Self {
        Self {
            name: name.into(),
            hook,
            budget,
        }
    }
}

#[async_trait]
impl OpinionProvider for AnalystProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Role {
        Role::Analyst
    }

    fn budget(&self) -> Duration {
        self.budget
    }

    async fn produce_opinion(&self, request: &ScoringRequest) -> Result<Opinion, AgentError> {
        let raw = score_validated(self.hook.as_ref(), request).await?;
        let information_score = optional_field(&raw.fields, "information_score")?;
        let mut opinion = base_opinion(Role::Analyst, &self.name, raw);
        opinion.information_score = Some(information_score.unwrap_or(opinion.score));
        Ok(opinion)
    }
}

/// Wrap `hook` in the provider variant for `role`.
pub fn provider_for_role(
    role: Role,
    name: impl Into<String>,
    hook: Arc<dyn ScoringHook>,
    budget: Duration,
    sizing: &SizingConfig,
) -> Arc<dyn OpinionProvider> {
    match role {
        Role::Trader => Arc::new(TraderProvider::new(name, hook, budget)),
        Role::Risk => Arc::new(RiskProvider::new(
            name,
            hook,
            budget,
            SizingEngine::new(sizing.clone()),
        )),
        Role::Analyst => Arc::new(AnalystProvider::new(name, hook, budget)),
    }
}

/// Build a command-backed provider from configuration.
pub fn build_provider(
    provider: &ProviderConfig,
    providers: &ProvidersConfig,
    sizing: &SizingConfig,
) -> Arc<dyn OpinionProvider> {
    let budget = Duration::from_millis(providers.timeout_ms(provider));
    let hook = Arc::new(CommandHook::new(
        provider.command.clone(),
        provider.args.clone(),
        budget,
    ));
    provider_for_role(provider.role, provider.name.clone(), hook, budget, sizing)
}
