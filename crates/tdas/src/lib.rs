//! TDAS - Trade Decision Arbitration System
//!
//! Three independent opinion providers (trader, risk, analyst) score a
//! candidate instrument; a weighted-vote arbiter combines them, an eight-rule
//! gate can veto the result, a router picks the fast or deliberative path, and
//! a shadow ledger executes approved decisions against a virtual portfolio.
//!
//! # Library Usage
//!
//! ```rust,no_run
//! use tdas::models::config::TdasConfig;
//! use tdas::models::context::CandidateRequest;
//!
//! # async fn run(request: CandidateRequest) -> anyhow::Result<()> {
//! let config = TdasConfig::default();
//! let orchestrator = tdas::build_orchestrator(&config)?;
//! let record = tdas::deliberate(&orchestrator, request).await?;
//! println!("{}", record.decision.action);
//! # Ok(())
//! # }
//! ```

pub use tdas_agents as agents;
pub use tdas_context as context;
pub use tdas_ledger as ledger;
pub use tdas_models as models;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tdas_agents::{build_provider, AgentError, OpinionProvider, Orchestrator};
use tdas_context::{CacheContextSource, CacheReader, SqliteReader};
use tdas_ledger::{ChannelSizes, Journal, LedgerHandle, LedgerSettings, ShadowLedger};
use tdas_models::config::TdasConfig;
use tdas_models::context::CandidateRequest;
use tdas_models::session::SessionRecord;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Build an Orchestrator from configuration.
///
/// Spawns the ledger task, so this must run inside a tokio runtime. The ledger
/// stops once the orchestrator and every handle cloned from it are dropped.
pub fn build_orchestrator(config: &TdasConfig) -> Result<Orchestrator, anyhow::Error> {
    config.validate().context("Invalid configuration")?;

    let sqlite = SqliteReader::open(&config.context.sqlite_path)
        .with_context(|| format!("Failed to open cache: {}", config.context.sqlite_path))?;
    let cache = Arc::new(CacheReader::new(
        sqlite,
        config.context.memory_max_capacity,
        Duration::from_secs(config.context.memory_ttl_seconds),
    ));
    let context = Arc::new(CacheContextSource::new(cache));

    let journal = Arc::new(match &config.ledger.journal_path {
        Some(path) => {
            Journal::open(path).with_context(|| format!("Failed to open journal: {path}"))?
        }
        None => Journal::open_in_memory()?,
    });

    let settings = LedgerSettings {
        margin_allowance: config.ledger.margin_allowance,
        max_stop_distance_pct: config.gate.max_stop_distance_pct,
    };
    let (ledger, _task) = LedgerHandle::spawn(
        ShadowLedger::new(config.ledger.starting_cash, settings),
        Some(journal.clone()),
        CancellationToken::new(),
        ChannelSizes {
            commands: config.ledger.command_buffer,
            events: config.ledger.event_buffer,
        },
    );

    let providers: Vec<Arc<dyn OpinionProvider>> = config
        .providers
        .providers
        .iter()
        .map(|p| build_provider(p, &config.providers, &config.sizing))
        .collect();

    info!(
        providers = providers.len(),
        starting_cash = %config.ledger.starting_cash,
        journal = config.ledger.journal_path.as_deref().unwrap_or(":memory:"),
        "Built orchestrator"
    );

    Ok(Orchestrator::new(providers, context, ledger, config)?.with_session_sink(journal))
}

/// Run one deliberation using the given orchestrator.
pub async fn deliberate(
    orchestrator: &Orchestrator,
    request: CandidateRequest,
) -> Result<SessionRecord, AgentError> {
    orchestrator.deliberate(request).await
}
