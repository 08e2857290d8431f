pub mod arbiter;
pub mod error;
pub mod gate;
pub mod hook;
pub mod orchestrator;
pub mod parser;
pub mod provider;
pub mod router;
pub mod session;
pub mod sizing;

pub mod test_support;

pub use arbiter::{select_action, Arbiter, OpinionSet};
pub use error::{AgentError, SizingError};
pub use gate::{GateVerdict, RuleGate};
pub use hook::{CommandHook, ScoringHook};
pub use orchestrator::Orchestrator;
pub use provider::{
    build_provider, provider_for_role, AnalystProvider, OpinionProvider, RiskProvider,
    TraderProvider,
};
pub use router::{ExecutionRouter, RoutingContext};
pub use session::Session;
pub use sizing::SizingEngine;
