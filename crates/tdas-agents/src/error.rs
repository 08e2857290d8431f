use tdas_models::opinion::Role;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Provider {provider} timed out after {budget_ms} ms")]
    ProviderTimeout { provider: String, budget_ms: u64 },

    #[error("Scoring hook error: {0}")]
    Hook(String),

    #[error("Opinion parse error: {0}")]
    Parse(String),

    #[error("Invalid opinion: {0}")]
    InvalidOpinion(String),

    #[error("Malformed opinion set: {0}")]
    MalformedOpinions(String),

    #[error("No provider configured for role {0}")]
    MissingProvider(Role),

    #[error("Session for {instrument} exceeded its {deadline_ms} ms deadline")]
    SessionTimeout { instrument: String, deadline_ms: u64 },

    #[error("Market context error: {0}")]
    Context(#[from] tdas_context::ContextError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] tdas_ledger::LedgerError),

    #[error("Configuration error: {0}")]
    Config(#[from] tdas_models::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sizing failures. The Risk provider downgrades its vote to hold on any of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SizingError {
    #[error("Invalid sizing input: {0}")]
    InvalidInput(String),
}
