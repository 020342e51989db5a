use thiserror::Error;
use uuid::Uuid;

use crate::models::JobState;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum FleetError {
    // Transient scheduling failures: retried through Nack with backoff. Bid
    // timeouts and lost reservation races stay inside the bidding round as a
    // RejectReason.
    #[error("No eligible nodes for job {job_id}")]
    NoEligibleNodes { job_id: Uuid },

    // Permanent scheduling failures: job and evaluation fail immediately.
    #[error("Job {job_id} requests resources exceeding the {limit} limit")]
    ResourcesExceedLimits { job_id: Uuid, limit: &'static str },

    #[error("Invalid selection policy: {0}")]
    InvalidSelectionPolicy(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Evaluation not found: {0}")]
    EvaluationNotFound(Uuid),

    #[error("Evaluation {0} has not failed")]
    EvaluationNotFailed(Uuid),

    #[error("Stale delivery receipt for evaluation {0}")]
    StaleDelivery(Uuid),

    #[error("Invalid job state transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Job {0} was cancelled")]
    JobCancelled(Uuid),

    #[error("Job queue is full")]
    QueueFull,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl FleetError {
    /// Permanent failures skip the retry budget entirely.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            FleetError::ResourcesExceedLimits { .. }
                | FleetError::InvalidSelectionPolicy(_)
                | FleetError::InvalidJob(_)
        )
    }
}

impl From<StoreError> for FleetError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => FleetError::BrokerUnavailable(reason),
            other => FleetError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_errors_are_classified() {
        assert!(FleetError::InvalidJob("count".into()).is_permanent());
        assert!(FleetError::InvalidSelectionPolicy("x".into()).is_permanent());
        assert!(FleetError::ResourcesExceedLimits {
            job_id: Uuid::new_v4(),
            limit: "total"
        }
        .is_permanent());
        assert!(!FleetError::NoEligibleNodes {
            job_id: Uuid::new_v4()
        }
        .is_permanent());
        assert!(!FleetError::BrokerUnavailable("down".into()).is_permanent());
    }

    #[test]
    fn unavailable_store_maps_to_broker_unavailable() {
        let err: FleetError = StoreError::Unavailable("offline".into()).into();
        assert!(matches!(err, FleetError::BrokerUnavailable(_)));

        let err: FleetError = StoreError::NotFound("k".into()).into();
        assert!(matches!(err, FleetError::Store(StoreError::NotFound(_))));
    }
}
