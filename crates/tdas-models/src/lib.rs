pub mod cache_schema;
pub mod config;
pub mod context;
pub mod decision;
pub mod opinion;
pub mod position;
pub mod session;

pub use cache_schema::{CacheCategory, CacheRow};
pub use config::{
    ConfigError, ContextConfig, GateConfig, LedgerConfig, LoggingConfig, ProviderConfig,
    ProvidersConfig, RouterConfig, SizingConfig, TdasConfig, WeightsConfig,
};
pub use context::{
    CandidateRequest, MarketContext, MarketRegime, OpenPosition, PortfolioContext,
    TechnicalIndicators,
};
pub use decision::{
    ActionSelection, AttributedReasoning, Decision, DraftDecision, ExecutionPath, Provenance,
    ProposedTerms, RouteReason, RuleCheck, RuleId, TieBreak, TradeIntent, TradeTerms,
    WeightedVote,
};
pub use opinion::{
    Action, Opinion, RawOpinion, RiskProposal, Role, ScoringRequest, SizingBreakdown, StopSource,
};
pub use position::{Position, PositionEvent, PositionStatus, Side};
pub use session::{ExecutionOutcome, LedgerRejection, SessionRecord};
