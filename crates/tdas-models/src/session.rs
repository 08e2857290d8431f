use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::CandidateRequest;
use crate::decision::Decision;
use crate::opinion::Opinion;

/// Why the shadow ledger declined to execute an approved decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum LedgerRejection {
    InsufficientFunds { required: Decimal, available: Decimal },
    InvalidStop { detail: String },
    NotExecutable { detail: String },
}

/// What happened to a session's decision after gating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The rule gate rejected the decision.
    Rejected,
    /// Approved hold or pass: nothing to execute.
    NoAction,
    Opened { position_id: Uuid },
    Closed { position_ids: Vec<Uuid> },
    /// Approved but not executed, with the ledger's reason.
    Unexecuted { rejection: LedgerRejection },
}

/// Read-only audit record of one complete deliberation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub request: CandidateRequest,
    pub instrument: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// One per role, in role order.
    pub opinions: Vec<Opinion>,
    pub decision: Decision,
    pub execution: ExecutionOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn unexecuted_outcome_carries_ledger_reason() {
        let outcome = ExecutionOutcome::Unexecuted {
            rejection: LedgerRejection::InsufficientFunds {
                required: dec!(25000),
                available: dec!(12000),
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "unexecuted");
        assert_eq!(json["rejection"]["reason"], "insufficient_funds");
        assert_eq!(json["rejection"]["required"], "25000");

        let parsed: ExecutionOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, outcome);
    }

    #[test]
    fn rejected_outcome_is_a_bare_status() {
        let json = serde_json::to_string(&ExecutionOutcome::Rejected).unwrap();
        assert_eq!(json, r#"{"status":"rejected"}"#);
    }
}
