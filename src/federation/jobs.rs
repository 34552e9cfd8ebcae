//! Federation job lifecycle.
//!
//! A job accepted from a peer walks `SUBMITTED → RESULTED →
//! PAYMENT_REQUESTED → SETTLED | FAILED`. Terminal jobs stay around for the
//! configured retention so late settlement queries still resolve.

use serde::{Deserialize, Serialize};

use crate::federation::messages::RouterJobResult;
use crate::timestamp::UnixMillis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FederationJobState {
    #[serde(rename = "SUBMITTED")]
    Submitted,
    #[serde(rename = "RESULTED")]
    Resulted,
    #[serde(rename = "PAYMENT_REQUESTED")]
    PaymentRequested,
    #[serde(rename = "SETTLED")]
    Settled,
    #[serde(rename = "FAILED")]
    Failed,
}

impl FederationJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FederationJobState::Settled | FederationJobState::Failed)
    }

    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: FederationJobState) -> bool {
        use FederationJobState::*;
        matches!(
            (self, next),
            (Submitted, Resulted)
                | (Submitted, Failed)
                | (Resulted, PaymentRequested)
                | (Resulted, Failed)
                | (PaymentRequested, Settled)
                | (PaymentRequested, Failed)
        )
    }
}

/// One cross-router job as tracked by either side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationJob {
    pub job_id: String,
    pub peer_router_id: String,
    pub job_type: String,
    pub state: FederationJobState,
    pub submitted_at: UnixMillis,
    pub updated_at: UnixMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RouterJobResult>,
    /// Ledger key of the settlement challenge, once requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_key: Option<String>,
}

impl FederationJob {
    pub fn submitted(
        job_id: impl Into<String>,
        peer_router_id: impl Into<String>,
        job_type: impl Into<String>,
        now: UnixMillis,
    ) -> Self {
        FederationJob {
            job_id: job_id.into(),
            peer_router_id: peer_router_id.into(),
            job_type: job_type.into(),
            state: FederationJobState::Submitted,
            submitted_at: now,
            updated_at: now,
            result: None,
            payment_key: None,
        }
    }

    /// Apply a state transition, rejecting illegal moves.
    pub fn transition(
        &mut self,
        next: FederationJobState,
        now: UnixMillis,
    ) -> Result<(), FederationJobState> {
        if !self.state.can_transition_to(next) {
            return Err(self.state);
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// True once the job may be dropped by retention.
    pub fn expired(&self, now: UnixMillis, retention_ms: i64) -> bool {
        self.state.is_terminal() && now - self.updated_at > retention_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let now = UnixMillis(1_000);
        let mut job = FederationJob::submitted("j1", "npub1peer", "inference", now);
        job.transition(FederationJobState::Resulted, now + 1).unwrap();
        job.transition(FederationJobState::PaymentRequested, now + 2)
            .unwrap();
        job.transition(FederationJobState::Settled, now + 3).unwrap();
        assert!(job.state.is_terminal());
    }

    #[test]
    fn illegal_transitions_rejected() {
        let now = UnixMillis(1_000);
        let mut job = FederationJob::submitted("j1", "npub1peer", "inference", now);
        assert!(job.transition(FederationJobState::Settled, now).is_err());
        job.transition(FederationJobState::Failed, now).unwrap();
        assert!(job.transition(FederationJobState::Resulted, now).is_err());
    }

    #[test]
    fn retention_applies_only_to_terminal_jobs() {
        let now = UnixMillis(1_000);
        let mut job = FederationJob::submitted("j1", "npub1peer", "inference", now);
        assert!(!job.expired(now + 100_000, 10));
        job.transition(FederationJobState::Failed, now).unwrap();
        assert!(job.expired(now + 100_000, 10));
        assert!(!job.expired(now + 5, 10));
    }
}
