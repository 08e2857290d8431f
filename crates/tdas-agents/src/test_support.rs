//! Test support: builders for contexts and opinions, canned scoring hooks, and
//! a fully wired orchestrator over in-memory collaborators.
//!
//! `ScenarioHook` derives a raw opinion from the market snapshot with fixed,
//! documented rules, so end-to-end tests can steer every role through the
//! market data alone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tdas_context::source::decimal_from_json;
use tdas_context::StaticContextSource;
use tdas_ledger::{ChannelSizes, Journal, LedgerHandle, LedgerSettings, ShadowLedger};
use tdas_models::config::{TdasConfig, WeightsConfig};
use tdas_models::context::{
    CandidateRequest, MarketContext, MarketRegime, PortfolioContext, TechnicalIndicators,
};
use tdas_models::decision::DraftDecision;
use tdas_models::opinion::{Action, Opinion, RawOpinion, RiskProposal, Role, ScoringRequest};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::arbiter::{Arbiter, OpinionSet};
use crate::error::AgentError;
use crate::hook::ScoringHook;
use crate::orchestrator::Orchestrator;
use crate::provider::{provider_for_role, OpinionProvider};

/// Transition regime, no indicators, no earnings date, no news.
pub fn market(instrument: &str, price: Decimal, vix: Decimal) -> MarketContext {
    MarketContext {
        instrument: instrument.to_string(),
        price,
        volatility_index: vix,
        market_regime: MarketRegime::Transition,
        technical_indicators: TechnicalIndicators::default(),
        earnings_date: None,
        news: serde_json::Value::Null,
        as_of: Utc::now(),
    }
}

/// [`market`] with a 20-day moving average, which is what `ScenarioHook` trends on.
pub fn trending_market(instrument: &str, price: Decimal, sma_20: Decimal, vix: Decimal) -> MarketContext {
    let mut ctx = market(instrument, price, vix);
    ctx.technical_indicators
        .values
        .insert("sma_20".to_string(), sma_20);
    ctx
}

pub fn scoring_request(
    role: Role,
    market: MarketContext,
    portfolio: PortfolioContext,
) -> ScoringRequest {
    ScoringRequest {
        request_id: Uuid::new_v4(),
        session_id: Uuid::new_v4(),
        role,
        instrument: market.instrument.clone(),
        as_of: market.as_of,
        market,
        portfolio,
    }
}

/// A non-abstaining opinion whose score equals its confidence.
pub fn opinion(role: Role, action: Action, confidence: Decimal) -> Opinion {
    Opinion {
        id: Uuid::new_v4(),
        role,
        provider: role.to_string(),
        action,
        confidence,
        score: confidence,
        reasoning: format!("{role} view: {action}"),
        proposal: None,
        entry_price: None,
        information_score: None,
        context: serde_json::Value::Null,
        abstained: false,
        elapsed_ms: 0,
    }
}

pub fn risk_opinion(
    action: Action,
    confidence: Decimal,
    position_size: Decimal,
    stop_loss: Option<Decimal>,
) -> Opinion {
    let mut risk = opinion(Role::Risk, action, confidence);
    risk.proposal = Some(RiskProposal {
        position_size,
        stop_loss,
        sizing: None,
    });
    risk
}

/// A unanimous AAPL draft. With equal confidences the weighted confidence is `confidence`.
pub fn draft(
    action: Action,
    confidence: Decimal,
    position_size: Decimal,
    stop_loss: Option<Decimal>,
) -> DraftDecision {
    let set = OpinionSet::new(
        opinion(Role::Trader, action, confidence),
        risk_opinion(action, confidence, position_size, stop_loss),
        opinion(Role::Analyst, action, confidence),
    )
    .expect("well-formed opinion set");
    Arbiter::new(WeightsConfig::default())
        .expect("default weights")
        .combine("AAPL", &set)
}

/// Returns the same raw opinion for every request.
#[derive(Debug, Clone)]
pub struct StaticHook {
    raw: RawOpinion,
}

impl StaticHook {
    pub fn new(action: Action, confidence: Decimal) -> Self {
        Self {
            raw: RawOpinion {
                action,
                confidence,
                score: None,
                reasoning: format!("static {action}"),
                fields: serde_json::Value::Null,
            },
        }
    }

    pub fn with_fields(mut self, fields: serde_json::Value) -> Self {
        self.raw.fields = fields;
        self
    }

    pub fn with_reasoning(mut self, reasoning: &str) -> Self {
        self.raw.reasoning = reasoning.to_string();
        self
    }

    pub fn with_score(mut self, score: Decimal) -> Self {
        self.raw.score = Some(score);
        self
    }
}

#[async_trait]
impl ScoringHook for StaticHook {
    async fn score(&self, _request: &ScoringRequest) -> Result<RawOpinion, AgentError> {
        Ok(self.raw.clone())
    }
}

/// Sleeps before delegating. Pair with paused tokio time for deterministic timing.
pub struct SlowHook {
    delay: Duration,
    inner: Arc<dyn ScoringHook>,
}

impl SlowHook {
    pub fn new(delay: Duration, inner: Arc<dyn ScoringHook>) -> Self {
        Self { delay, inner }
    }
}

#[async_trait]
impl ScoringHook for SlowHook {
    async fn score(&self, request: &ScoringRequest) -> Result<RawOpinion, AgentError> {
        tokio::time::sleep(self.delay).await;
        self.inner.score(request).await
    }
}

pub struct FailingHook {
    message: String,
}

impl FailingHook {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl ScoringHook for FailingHook {
    async fn score(&self, _request: &ScoringRequest) -> Result<RawOpinion, AgentError> {
        Err(AgentError::Hook(self.message.clone()))
    }
}

pub struct PanickingHook;

#[async_trait]
impl ScoringHook for PanickingHook {
    async fn score(&self, _request: &ScoringRequest) -> Result<RawOpinion, AgentError> {
        panic!("scoring hook panicked")
    }
}

/// Derives an opinion from the market snapshot according to the request's role.
///
/// Trader (trend against `sma_20`, 2% band):
/// - price at or above the upper band: buy, 0.85, quoting the price as entry
/// - price at or below the lower band: sell, 0.80, quoting the price as entry
/// - inside the band: hold, 0.55
/// - no `sma_20`: pass, 0.50
///
/// Risk:
/// - volatility index above 30 or a risk-off regime: hold, 0.65
/// - otherwise follows the trend above with confidence 0.75, or holds at 0.60
///
/// Analyst:
/// - earnings from one day before to seven days after `as_of`: hold, 0.70
/// - `news.sentiment` above 0.3: buy, 0.70; below -0.3: sell, 0.70
/// - otherwise hold, 0.70
///
/// The analyst's information score is the absolute sentiment, or 0.5 without news.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScenarioHook;

fn trend(market: &MarketContext) -> Option<Action> {
    let sma = market.technical_indicators.get("sma_20")?;
    let band = sma * Decimal::new(2, 2);
    Some(if market.price >= sma + band {
        Action::Buy
    } else if market.price <= sma - band {
        Action::Sell
    } else {
        Action::Hold
    })
}

fn raw(action: Action, confidence: Decimal, reasoning: String, fields: serde_json::Value) -> RawOpinion {
    RawOpinion {
        action,
        confidence,
        score: None,
        reasoning,
        fields,
    }
}

impl ScenarioHook {
    fn trader(market: &MarketContext) -> RawOpinion {
        let entry = serde_json::json!({ "entry_price": market.price.to_string() });
        match trend(market) {
            Some(Action::Buy) => raw(
                Action::Buy,
                Decimal::new(85, 2),
                format!("{} trading above its 20-day average", market.price),
                entry,
            ),
            Some(Action::Sell) => raw(
                Action::Sell,
                Decimal::new(80, 2),
                format!("{} trading below its 20-day average", market.price),
                entry,
            ),
            Some(_) => raw(
                Action::Hold,
                Decimal::new(55, 2),
                "price inside the trend band".to_string(),
                serde_json::Value::Null,
            ),
            None => raw(
                Action::Pass,
                Decimal::new(50, 2),
                "no trend reference".to_string(),
                serde_json::Value::Null,
            ),
        }
    }

    fn risk(market: &MarketContext) -> RawOpinion {
        if market.volatility_index > Decimal::new(30, 0)
            || market.market_regime == MarketRegime::RiskOff
        {
            return raw(
                Action::Hold,
                Decimal::new(65, 2),
                format!("volatility {} too high to add risk", market.volatility_index),
                serde_json::Value::Null,
            );
        }
        match trend(market) {
            Some(action) if action.is_trade() => raw(
                action,
                Decimal::new(75, 2),
                "volatility contained".to_string(),
                serde_json::Value::Null,
            ),
            _ => raw(
                Action::Hold,
                Decimal::new(60, 2),
                "no directional edge".to_string(),
                serde_json::Value::Null,
            ),
        }
    }

    fn analyst(market: &MarketContext) -> RawOpinion {
        let sentiment = market
            .news
            .get("sentiment")
            .and_then(|v| decimal_from_json("sentiment", v).ok());
        let information_score = sentiment.map(|s| s.abs()).unwrap_or(Decimal::new(5, 1));
        let fields = serde_json::json!({ "information_score": information_score.to_string() });
        let confidence = Decimal::new(70, 2);

        if let Some(earnings) = market.earnings_date {
            let days = (earnings - market.as_of.date_naive()).num_days();
            if (-1..=7).contains(&days) {
                return raw(
                    Action::Hold,
                    confidence,
                    format!("earnings on {earnings}"),
                    fields,
                );
            }
        }
        match sentiment {
            Some(s) if s > Decimal::new(3, 1) => {
                raw(Action::Buy, confidence, "positive news flow".to_string(), fields)
            }
            Some(s) if s < Decimal::new(-3, 1) => {
                raw(Action::Sell, confidence, "negative news flow".to_string(), fields)
            }
            _ => raw(Action::Hold, confidence, "no strong catalyst".to_string(), fields),
        }
    }
}

#[async_trait]
impl ScoringHook for ScenarioHook {
    async fn score(&self, request: &ScoringRequest) -> Result<RawOpinion, AgentError> {
        Ok(match request.role {
            Role::Trader => Self::trader(&request.market),
            Role::Risk => Self::risk(&request.market),
            Role::Analyst => Self::analyst(&request.market),
        })
    }
}

/// An orchestrator over a static market source, a spawned ledger and an in-memory journal.
///
/// Must be built inside a tokio runtime.
pub struct TestRig {
    pub orchestrator: Orchestrator,
    pub context: Arc<StaticContextSource>,
    pub ledger: LedgerHandle,
    pub journal: Arc<Journal>,
    pub providers: Vec<Arc<dyn OpinionProvider>>,
    pub cancel: CancellationToken,
}

impl TestRig {
    /// Every role scored by [`ScenarioHook`].
    pub fn scenario(market: MarketContext, cash: Decimal) -> Self {
        let hook: Arc<dyn ScoringHook> = Arc::new(ScenarioHook);
        Self::with_hooks(market, cash, [hook.clone(), hook.clone(), hook])
    }

    /// Hooks in role order: trader, risk, analyst.
    pub fn with_hooks(market: MarketContext, cash: Decimal, hooks: [Arc<dyn ScoringHook>; 3]) -> Self {
        Self::with_config(market, cash, hooks, &TdasConfig::default())
    }

    /// Provider budgets, names and all thresholds come from `config`.
    pub fn with_config(
        market: MarketContext,
        cash: Decimal,
        hooks: [Arc<dyn ScoringHook>; 3],
        config: &TdasConfig,
    ) -> Self {
        let providers: Vec<Arc<dyn OpinionProvider>> = Role::ALL
            .into_iter()
            .zip(hooks)
            .map(|(role, hook)| {
                let budget = config
                    .providers
                    .providers
                    .iter()
                    .find(|p| p.role == role)
                    .map(|p| config.providers.timeout_ms(p))
                    .unwrap_or(config.providers.default_timeout_ms);
                provider_for_role(
                    role,
                    role.to_string(),
                    hook,
                    Duration::from_millis(budget),
                    &config.sizing,
                )
            })
            .collect();

        let context = Arc::new(StaticContextSource::with(market));
        let journal = Arc::new(Journal::open_in_memory().expect("in-memory journal"));
        let cancel = CancellationToken::new();
        let settings = LedgerSettings {
            margin_allowance: config.ledger.margin_allowance,
            max_stop_distance_pct: config.gate.max_stop_distance_pct,
        };
        let (ledger, _task) = LedgerHandle::spawn(
            ShadowLedger::new(cash, settings),
            Some(journal.clone()),
            cancel.clone(),
            ChannelSizes::default(),
        );

        let orchestrator = Orchestrator::new(providers.clone(), context.clone(), ledger.clone(), config)
            .expect("valid test configuration")
            .with_session_sink(journal.clone());

        Self {
            orchestrator,
            context,
            ledger,
            journal,
            providers,
            cancel,
        }
    }

    pub fn request(&self, instrument: &str) -> CandidateRequest {
        CandidateRequest {
            instrument_id: instrument.to_string(),
            as_of_timestamp: Utc::now(),
            emergency_exit: false,
        }
    }
}
