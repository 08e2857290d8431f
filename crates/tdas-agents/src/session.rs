use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tdas_models::context::CandidateRequest;
use tdas_models::decision::Decision;
use tdas_models::opinion::{Opinion, Role};
use tdas_models::session::{ExecutionOutcome, SessionRecord};
use tokio::time::Instant;
use uuid::Uuid;

use crate::arbiter::OpinionSet;
use crate::error::AgentError;

/// One open deliberation. Consumed by [`Session::close`], which yields the
/// read-only [`SessionRecord`].
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    request: CandidateRequest,
    started_at: DateTime<Utc>,
    started: Instant,
    opinions: BTreeMap<Role, Opinion>,
}

impl Session {
    pub fn open(request: CandidateRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            started_at: Utc::now(),
            started: Instant::now(),
            opinions: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn instrument(&self) -> &str {
        &self.request.instrument_id
    }

    pub fn request(&self) -> &CandidateRequest {
        &self.request
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn has_opinion(&self, role: Role) -> bool {
        self.opinions.contains_key(&role)
    }

    /// Each role's slot can be filled once.
    pub fn record_opinion(&mut self, opinion: Opinion) -> Result<(), AgentError> {
        if self.opinions.contains_key(&opinion.role) {
            return Err(AgentError::MalformedOpinions(format!(
                "session {} already has a {} opinion",
                self.id, opinion.role
            )));
        }
        self.opinions.insert(opinion.role, opinion);
        Ok(())
    }

    /// The filled slots as an opinion set. Fails until every role has an opinion.
    pub fn opinion_set(&self) -> Result<OpinionSet, AgentError> {
        OpinionSet::from_opinions(self.opinions.values().cloned().collect())
    }

    pub fn close(
        self,
        decision: Decision,
        execution: ExecutionOutcome,
    ) -> Result<SessionRecord, AgentError> {
        if self.opinions.len() != Role::ALL.len() {
            return Err(AgentError::MalformedOpinions(format!(
                "session {} closed with {} of {} opinions",
                self.id,
                self.opinions.len(),
                Role::ALL.len()
            )));
        }
        let instrument = self.request.instrument_id.clone();
        Ok(SessionRecord {
            id: self.id,
            request: self.request,
            instrument,
            started_at: self.started_at,
            completed_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            opinions: self.opinions.into_values().collect(),
            decision,
            execution,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::Arbiter;
    use crate::gate::RuleGate;
    use crate::test_support::{market, opinion, risk_opinion};
    use rust_decimal_macros::dec;
    use tdas_models::config::WeightsConfig;
    use tdas_models::context::PortfolioContext;
    use tdas_models::opinion::Action;

    fn request() -> CandidateRequest {
        CandidateRequest {
            instrument_id: "AAPL".to_string(),
            as_of_timestamp: Utc::now(),
            emergency_exit: false,
        }
    }

    #[test]
    fn opinions_are_kept_in_role_order() {
        let mut session = Session::open(request());
        session
            .record_opinion(opinion(Role::Analyst, Action::Hold, dec!(0.7)))
            .unwrap();
        session
            .record_opinion(risk_opinion(Action::Buy, dec!(0.75), dec!(10000), Some(dec!(142.50))))
            .unwrap();
        assert!(session.opinion_set().is_err());
        session
            .record_opinion(opinion(Role::Trader, Action::Buy, dec!(0.85)))
            .unwrap();

        let set = session.opinion_set().unwrap();
        let draft = Arbiter::new(WeightsConfig::default())
            .unwrap()
            .combine(session.instrument(), &set);
        let decision = RuleGate::default().finalize(
            draft,
            &PortfolioContext::cash_only(dec!(100000)),
            &market("AAPL", dec!(150), dec!(18)),
        );

        let id = session.id();
        let record = session.close(decision, ExecutionOutcome::NoAction).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.instrument, "AAPL");
        let roles: Vec<Role> = record.opinions.iter().map(|o| o.role).collect();
        assert_eq!(roles, Role::ALL.to_vec());
        assert!(record.completed_at >= record.started_at);
    }

    #[test]
    fn a_role_slot_is_filled_once() {
        let mut session = Session::open(request());
        session
            .record_opinion(opinion(Role::Trader, Action::Buy, dec!(0.85)))
            .unwrap();
        let again = session.record_opinion(opinion(Role::Trader, Action::Sell, dec!(0.5)));
        assert!(matches!(again, Err(AgentError::MalformedOpinions(_))));
        assert!(session.has_opinion(Role::Trader));
        assert!(!session.has_opinion(Role::Risk));
    }
}
