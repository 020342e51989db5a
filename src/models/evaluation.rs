use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cancel-class evaluations jump ahead of everything else.
pub const CANCEL_PRIORITY: u32 = 0;
pub const DEFAULT_PRIORITY: u32 = 50;

/// Why an evaluation was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    JobRegistered,
    NodeUpdated,
    PeriodicRescan,
    /// Fresh evaluation issued for one whose retry budget ran out. Ordinary
    /// retries reuse the same evaluation through nack.
    RetryOf(Uuid),
    JobCancelled,
}

impl TriggerKind {
    pub fn default_priority(&self) -> u32 {
        match self {
            TriggerKind::JobCancelled => CANCEL_PRIORITY,
            _ => DEFAULT_PRIORITY,
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::JobRegistered => write!(f, "job-registered"),
            TriggerKind::NodeUpdated => write!(f, "node-updated"),
            TriggerKind::PeriodicRescan => write!(f, "periodic-rescan"),
            TriggerKind::RetryOf(id) => write!(f, "retry-of({id})"),
            TriggerKind::JobCancelled => write!(f, "job-cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl EvalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Cancelled
        )
    }
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalStatus::Pending => write!(f, "pending"),
            EvalStatus::InProgress => write!(f, "in_progress"),
            EvalStatus::Complete => write!(f, "complete"),
            EvalStatus::Failed => write!(f, "failed"),
            EvalStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One unit of scheduling work for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: Uuid,
    pub job_id: Uuid,
    pub trigger: TriggerKind,
    /// Lower dequeues first
    pub priority: u32,
    pub status: EvalStatus,
    pub created_at: DateTime<Utc>,
    /// Not dequeue-able before this time (retry backoff)
    pub wait_until: Option<DateTime<Utc>>,
    /// Set on dequeue, cleared on ack/nack
    pub visibility_deadline: Option<DateTime<Utc>>,
    pub delivery_count: u32,
    /// Store-assigned, monotonic; FIFO tie-break within a priority
    pub create_index: u64,
    /// Issued per delivery; ack/nack must present the current one
    pub receipt: Option<Uuid>,
    pub status_description: Option<String>,
}

impl Evaluation {
    pub fn new(job_id: Uuid, trigger: TriggerKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            trigger,
            priority: trigger.default_priority(),
            status: EvalStatus::Pending,
            created_at: Utc::now(),
            wait_until: None,
            visibility_deadline: None,
            delivery_count: 0,
            create_index: 0,
            receipt: None,
            status_description: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Two pending evaluations with the same key are interchangeable.
    pub fn dedup_key(&self) -> (Uuid, TriggerKind) {
        (self.job_id, self.trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_trigger_has_highest_priority() {
        let job_id = Uuid::new_v4();
        let cancel = Evaluation::new(job_id, TriggerKind::JobCancelled);
        let registered = Evaluation::new(job_id, TriggerKind::JobRegistered);
        assert!(cancel.priority < registered.priority);
    }

    #[test]
    fn retry_triggers_dedup_on_payload() {
        let job_id = Uuid::new_v4();
        let a = Evaluation::new(job_id, TriggerKind::RetryOf(Uuid::new_v4()));
        let b = Evaluation::new(job_id, TriggerKind::RetryOf(Uuid::new_v4()));
        assert_ne!(a.dedup_key(), b.dedup_key());

        let c = Evaluation::new(job_id, TriggerKind::NodeUpdated);
        let d = Evaluation::new(job_id, TriggerKind::NodeUpdated);
        assert_eq!(c.dedup_key(), d.dedup_key());
    }
}
