use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tdas_context::MarketContextSource;
use tdas_ledger::{ApplyOutcome, LedgerHandle, SessionSink};
use tdas_models::config::TdasConfig;
use tdas_models::context::{CandidateRequest, MarketContext};
use tdas_models::decision::Decision;
use tdas_models::opinion::{Opinion, Role, ScoringRequest};
use tdas_models::session::{ExecutionOutcome, SessionRecord};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::arbiter::Arbiter;
use crate::error::AgentError;
use crate::gate::RuleGate;
use crate::provider::OpinionProvider;
use crate::router::ExecutionRouter;
use crate::session::Session;

/// Runs sessions: fans out to the three providers, combines, gates, routes and
/// commits to the shadow ledger.
///
/// Sessions for the same instrument run one at a time; different instruments
/// run concurrently.
pub struct Orchestrator {
    providers: Vec<Arc<dyn OpinionProvider>>,
    context: Arc<dyn MarketContextSource>,
    ledger: LedgerHandle,
    sessions: Option<Arc<dyn SessionSink>>,
    arbiter: Arbiter,
    gate: RuleGate,
    router: ExecutionRouter,
    session_deadline: Duration,
    instrument_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    /// Requires exactly one provider per role and a valid configuration.
    pub fn new(
        providers: Vec<Arc<dyn OpinionProvider>>,
        context: Arc<dyn MarketContextSource>,
        ledger: LedgerHandle,
        config: &TdasConfig,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        for role in Role::ALL {
            match providers.iter().filter(|p| p.role() == role).count() {
                0 => return Err(AgentError::MissingProvider(role)),
                1 => {}
                n => {
                    return Err(AgentError::MalformedOpinions(format!(
                        "{n} providers configured for role {role}"
                    )))
                }
            }
        }

        Ok(Self {
            providers,
            context,
            ledger,
            sessions: None,
            arbiter: Arbiter::new(config.weights.clone())?,
            gate: RuleGate::new(config.gate.clone()),
            router: ExecutionRouter::new(config.router.clone()),
            session_deadline: Duration::from_millis(config.providers.session_deadline_ms()),
            instrument_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Append every completed session record to `sink`.
    pub fn with_session_sink(mut self, sink: Arc<dyn SessionSink>) -> Self {
        self.sessions = Some(sink);
        self
    }

    pub fn with_session_deadline(mut self, deadline: Duration) -> Self {
        self.session_deadline = deadline;
        self
    }

    pub fn session_deadline(&self) -> Duration {
        self.session_deadline
    }

    pub fn ledger(&self) -> &LedgerHandle {
        &self.ledger
    }

    /// Instruments with a session running or queued.
    pub async fn active_instruments(&self) -> usize {
        self.instrument_locks.lock().await.len()
    }

    async fn instrument_lock(&self, instrument: &str) -> Arc<Mutex<()>> {
        let mut locks = self.instrument_locks.lock().await;
        locks.entry(instrument.to_string()).or_default().clone()
    }

    /// Drop the instrument's lock once no other session holds or waits on it.
    /// Clones are only taken under the map lock, so the count cannot race.
    async fn release_instrument(&self, instrument: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.instrument_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(instrument);
        }
    }

    /// Run one session to completion.
    ///
    /// Fails only on a missed session deadline, an unreadable market context, a
    /// malformed opinion set or a ledger fault. Rule rejections and ledger refusals
    /// are recorded outcomes.
    pub async fn deliberate(&self, request: CandidateRequest) -> Result<SessionRecord, AgentError> {
        let instrument = request.instrument_id.clone();
        let lock = self.instrument_lock(&instrument).await;
        let result = {
            let _serialized = Arc::clone(&lock).lock_owned().await;
            self.run_session(request).await
        };
        self.release_instrument(&instrument, lock).await;
        result
    }

    async fn run_session(&self, request: CandidateRequest) -> Result<SessionRecord, AgentError> {
        let mut session = Session::open(request);
        let deadline = session.started() + self.session_deadline;
        info!(
            session_id = %session.id(),
            instrument = %session.instrument(),
            deadline_ms = self.session_deadline.as_millis() as u64,
            "Starting session"
        );

        let decided = tokio::time::timeout_at(deadline, self.decide(&mut session)).await;
        let (decision, market) = match decided {
            Ok(result) => result?,
            Err(_) => return Err(self.timed_out(&session)),
        };
        if Instant::now() >= deadline {
            return Err(self.timed_out(&session));
        }

        let execution = self.commit(&decision, &market).await?;
        let record = session.close(decision, execution)?;

        if let Some(sink) = &self.sessions {
            if let Err(e) = sink.append_session(&record) {
                error!(session_id = %record.id, error = %e, "Failed to journal session");
            }
        }

        info!(
            session_id = %record.id,
            instrument = %record.instrument,
            action = %record.decision.action,
            approved = record.decision.approved,
            path = ?record.decision.execution_path,
            execution = ?record.execution,
            elapsed_ms = record.duration_ms,
            "Session complete"
        );
        Ok(record)
    }

    fn timed_out(&self, session: &Session) -> AgentError {
        let deadline_ms = self.session_deadline.as_millis() as u64;
        warn!(
            session_id = %session.id(),
            instrument = %session.instrument(),
            deadline_ms,
            "Session deadline exceeded, aborting"
        );
        AgentError::SessionTimeout {
            instrument: session.instrument().to_string(),
            deadline_ms,
        }
    }

    /// Everything up to the ledger commit.
    async fn decide(&self, session: &mut Session) -> Result<(Decision, MarketContext), AgentError> {
        let instrument = session.instrument().to_string();
        let market = self
            .context
            .market_context(&instrument, session.request().as_of_timestamp)
            .await?;
        let portfolio = self.ledger.snapshot();

        // Fan out. Dropping the set aborts any provider still running.
        let mut tasks = JoinSet::new();
        for provider in &self.providers {
            let provider = Arc::clone(provider);
            let request = ScoringRequest {
                request_id: Uuid::new_v4(),
                session_id: session.id(),
                role: provider.role(),
                instrument: instrument.clone(),
                as_of: session.request().as_of_timestamp,
                market: market.clone(),
                portfolio: portfolio.clone(),
            };
            tasks.spawn(async move {
                let start = Instant::now();
                let budget = provider.budget();
                let result = match tokio::time::timeout(budget, provider.produce_opinion(&request)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::ProviderTimeout {
                        provider: provider.name().to_string(),
                        budget_ms: budget.as_millis() as u64,
                    }),
                };
                (
                    provider.role(),
                    provider.name().to_string(),
                    result,
                    start.elapsed().as_millis() as u64,
                )
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((role, name, Ok(mut opinion), elapsed_ms)) => {
                    info!(
                        provider = %name,
                        role = %role,
                        action = %opinion.action,
                        confidence = %opinion.confidence,
                        elapsed_ms,
                        "Provider responded"
                    );
                    opinion.elapsed_ms = elapsed_ms;
                    session.record_opinion(opinion)?;
                }
                Ok((role, name, Err(e), elapsed_ms)) => {
                    warn!(provider = %name, role = %role, error = %e, elapsed_ms, "Provider failed, abstaining");
                    session.record_opinion(Opinion::abstain(role, &name, &e.to_string(), elapsed_ms))?;
                }
                Err(e) => {
                    error!(error = %e, "Provider task panicked");
                }
            }
        }

        // A panicked task leaves its slot empty.
        for provider in &self.providers {
            let role = provider.role();
            if !session.has_opinion(role) {
                let elapsed_ms = session.started().elapsed().as_millis() as u64;
                session.record_opinion(Opinion::abstain(
                    role,
                    provider.name(),
                    "provider task failed",
                    elapsed_ms,
                ))?;
            }
        }

        let opinions = session.opinion_set()?;
        let draft = self.arbiter.combine(&instrument, &opinions);

        // The gate sees the portfolio as it is now, not as the providers saw it.
        let portfolio = self.ledger.snapshot();
        let mut decision = self.gate.finalize(draft, &portfolio, &market);
        self.router.assign(
            &mut decision,
            &portfolio,
            &market,
            session.request().emergency_exit,
        );
        Ok((decision, market))
    }

    async fn commit(
        &self,
        decision: &Decision,
        market: &MarketContext,
    ) -> Result<ExecutionOutcome, AgentError> {
        if !decision.approved {
            return Ok(ExecutionOutcome::Rejected);
        }
        match self.ledger.apply(decision, market.price).await {
            Ok(ApplyOutcome::NoAction) => Ok(ExecutionOutcome::NoAction),
            Ok(ApplyOutcome::Opened(position)) => Ok(ExecutionOutcome::Opened {
                position_id: position.id,
            }),
            Ok(ApplyOutcome::Closed(positions)) => Ok(ExecutionOutcome::Closed {
                position_ids: positions.iter().map(|p| p.id).collect(),
            }),
            Err(e) => match e.rejection() {
                Some(rejection) => {
                    warn!(
                        decision_id = %decision.id,
                        instrument = %decision.instrument,
                        error = %e,
                        "Approved decision not executed"
                    );
                    Ok(ExecutionOutcome::Unexecuted { rejection })
                }
                None => Err(e.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{market, TestRig};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn construction_requires_every_role() {
        let rig = TestRig::scenario(market("AAPL", dec!(150), dec!(18)), dec!(100000));
        let mut providers = rig.providers.clone();
        providers.retain(|p| p.role() != Role::Analyst);

        let result = Orchestrator::new(
            providers,
            rig.context.clone(),
            rig.ledger.clone(),
            &TdasConfig::default(),
        );
        assert!(matches!(result, Err(AgentError::MissingProvider(Role::Analyst))));
    }

    #[tokio::test]
    async fn construction_rejects_duplicate_roles() {
        let rig = TestRig::scenario(market("AAPL", dec!(150), dec!(18)), dec!(100000));
        let mut providers = rig.providers.clone();
        providers.push(Arc::clone(&rig.providers[0]));

        let result = Orchestrator::new(
            providers,
            rig.context.clone(),
            rig.ledger.clone(),
            &TdasConfig::default(),
        );
        assert!(matches!(result, Err(AgentError::MalformedOpinions(_))));
    }

    #[tokio::test]
    async fn invalid_weights_fail_construction() {
        let rig = TestRig::scenario(market("AAPL", dec!(150), dec!(18)), dec!(100000));
        let mut config = TdasConfig::default();
        config.weights.analyst = dec!(0.31);

        let result = Orchestrator::new(
            rig.providers.clone(),
            rig.context.clone(),
            rig.ledger.clone(),
            &config,
        );
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn missing_market_context_is_a_hard_failure() {
        let rig = TestRig::scenario(market("AAPL", dec!(150), dec!(18)), dec!(100000));
        let result = rig.orchestrator.deliberate(rig.request("MSFT")).await;
        assert!(matches!(result, Err(AgentError::Context(_))));
        assert_eq!(rig.journal.session_count().unwrap(), 0);
        assert_eq!(rig.orchestrator.active_instruments().await, 0);
    }

    #[tokio::test]
    async fn instrument_locks_are_released_after_each_session() {
        let rig = TestRig::scenario(market("AAPL", dec!(150), dec!(18)), dec!(100000));
        for instrument in ["AAPL", "AAPL"] {
            rig.orchestrator.deliberate(rig.request(instrument)).await.unwrap();
            assert_eq!(rig.orchestrator.active_instruments().await, 0);
        }
    }
}
