use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Resources;

/// Outcome of a single solicitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BidOutcome {
    Offered,
    Accepted,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The node declined the job
    Declined(String),
    /// No response before the negotiation deadline
    Timeout,
    /// Node accepted but another evaluation reserved the capacity first
    CapacityRace,
    /// Node could not be reached
    Unreachable(String),
    /// Job was cancelled while the round was in flight
    JobCancelled,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Declined(reason) => write!(f, "declined: {reason}"),
            RejectReason::Timeout => write!(f, "timeout"),
            RejectReason::CapacityRace => write!(f, "capacity race lost"),
            RejectReason::Unreachable(reason) => write!(f, "unreachable: {reason}"),
            RejectReason::JobCancelled => write!(f, "job cancelled"),
        }
    }
}

/// A node's answer in one bidding round. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Bid {
    pub eval_id: Uuid,
    pub node_id: String,
    pub outcome: BidOutcome,
    pub resources: Resources,
}

impl Bid {
    pub fn is_accepted(&self) -> bool {
        self.outcome == BidOutcome::Accepted
    }
}

/// One winning placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAssignment {
    pub node_id: String,
    pub resources: Resources,
}

/// Committed result of one bidding round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub eval_id: Uuid,
    pub job_id: Uuid,
    /// Winners in rank order
    pub assignments: Vec<PlannedAssignment>,
    pub unmet_replicas: u32,
}

impl Plan {
    pub fn empty(eval_id: Uuid, job_id: Uuid, unmet_replicas: u32) -> Self {
        Self {
            eval_id,
            job_id,
            assignments: Vec::new(),
            unmet_replicas,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn is_satisfied(&self) -> bool {
        self.unmet_replicas == 0
    }
}
