use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::bidding::BiddingCoordinator;
use crate::broker::{EvalBroker, NackOutcome};
use crate::config::JobTimeoutConfig;
use crate::error::{FleetError, Result};
use crate::jobstore::JobStore;
use crate::models::{Evaluation, Job, JobState, PlannedAssignment, TriggerKind};
use crate::nodes::NodeDirectory;
use crate::scheduler::Planner;

/// How one delivery was settled with the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Nacked(NackOutcome),
    /// Permanent failure, retry budget untouched
    Failed(String),
}

/// One scheduling attempt: plan, bid, apply, then ack or nack.
///
/// Holds no state between evaluations. A worker that dies halfway leaves the
/// evaluation claimed; the broker's visibility sweep hands it to someone else.
pub struct EvalProcessor {
    broker: Arc<EvalBroker>,
    jobs: JobStore,
    directory: Arc<NodeDirectory>,
    planner: Arc<Planner>,
    bidding: Arc<BiddingCoordinator>,
    timeouts: JobTimeoutConfig,
}

impl EvalProcessor {
    pub fn new(
        broker: Arc<EvalBroker>,
        jobs: JobStore,
        directory: Arc<NodeDirectory>,
        planner: Arc<Planner>,
        bidding: Arc<BiddingCoordinator>,
        timeouts: JobTimeoutConfig,
    ) -> Self {
        Self {
            broker,
            jobs,
            directory,
            planner,
            bidding,
            timeouts,
        }
    }

    /// Run one delivery to completion.
    ///
    /// An `Err` means the delivery could not be settled (usually the store is
    /// unreachable); the evaluation stays claimed until the sweep.
    pub async fn process(&self, eval: Evaluation) -> Result<Disposition> {
        let receipt = eval.receipt.ok_or(FleetError::StaleDelivery(eval.id))?;
        tracing::debug!(
            eval_id = %eval.id,
            job_id = %eval.job_id,
            trigger = %eval.trigger,
            delivery = eval.delivery_count,
            "Processing evaluation"
        );

        let job = match self.jobs.get(&eval.job_id) {
            Ok(job) => job,
            Err(FleetError::JobNotFound(_)) => {
                tracing::warn!(eval_id = %eval.id, job_id = %eval.job_id, "Job vanished, dropping evaluation");
                self.broker.ack(eval.id, receipt).await?;
                return Ok(Disposition::Acked);
            }
            Err(e) => return Err(e),
        };

        let disposition = self.schedule(&eval, receipt, &job).await?;
        if let Disposition::Nacked(NackOutcome::Failed) = disposition {
            self.surface_exhausted(eval.job_id, eval.id).await;
        }
        self.record(eval.id);
        Ok(disposition)
    }

    async fn schedule(&self, eval: &Evaluation, receipt: Uuid, job: &Job) -> Result<Disposition> {
        if eval.trigger == TriggerKind::JobCancelled || job.state == JobState::Cancelled {
            self.release_job(&job.id)?;
            return self.ack(eval, receipt).await;
        }
        if job.state.is_terminal() {
            tracing::debug!(eval_id = %eval.id, job_id = %job.id, state = %job.state, "Job already settled");
            return self.ack(eval, receipt).await;
        }

        let nodes = self.directory.snapshot();
        let proposal = match self.planner.plan(job, eval, &nodes) {
            Ok(proposal) => proposal,
            Err(e) if e.is_permanent() => return self.fail_permanently(eval, receipt, job, e).await,
            Err(e) => {
                tracing::warn!(eval_id = %eval.id, job_id = %job.id, error = %e, "Planning failed");
                return self.nack(eval, receipt).await;
            }
        };

        if proposal.desired == 0 {
            return self.ack(eval, receipt).await;
        }
        if proposal.is_empty() {
            tracing::info!(
                eval_id = %eval.id,
                job_id = %job.id,
                unmet = proposal.unmet_replicas,
                "{}",
                FleetError::NoEligibleNodes { job_id: job.id }
            );
            return self.nack(eval, receipt).await;
        }

        let deadline = Instant::now() + self.negotiation_timeout(job);
        let still_wanted = || {
            !matches!(
                self.jobs.get(&job.id).map(|j| j.state),
                Ok(JobState::Cancelled)
            )
        };
        let plan = self
            .bidding
            .solicit(job, &proposal, deadline, still_wanted)
            .await;

        if plan.is_empty() {
            return self.nack(eval, receipt).await;
        }

        let updated = match self.jobs.apply_plan(&plan) {
            Ok(applied) => {
                if !applied.surplus.is_empty() {
                    tracing::info!(
                        eval_id = %eval.id,
                        job_id = %job.id,
                        surplus = applied.surplus.len(),
                        "Job filled by a concurrent evaluation, releasing surplus winners"
                    );
                    self.release_assignments(&applied.surplus);
                }
                tracing::info!(
                    eval_id = %eval.id,
                    job_id = %job.id,
                    placed = plan.assignments.len() - applied.surplus.len(),
                    unmet = applied.job.shortfall(),
                    state = %applied.job.state,
                    "Plan applied"
                );
                applied.job
            }
            Err(e @ (FleetError::JobCancelled(_) | FleetError::InvalidTransition { .. })) => {
                tracing::info!(eval_id = %eval.id, job_id = %job.id, reason = %e, "Discarding plan");
                self.release_assignments(&plan.assignments);
                return self.ack(eval, receipt).await;
            }
            Err(e) => {
                self.release_assignments(&plan.assignments);
                return Err(e);
            }
        };

        if updated.shortfall() > 0 && !job.allow_partial {
            return self.nack(eval, receipt).await;
        }
        self.ack(eval, receipt).await
    }

    async fn ack(&self, eval: &Evaluation, receipt: Uuid) -> Result<Disposition> {
        self.broker.ack(eval.id, receipt).await?;
        Ok(Disposition::Acked)
    }

    async fn nack(&self, eval: &Evaluation, receipt: Uuid) -> Result<Disposition> {
        let outcome = self.broker.nack(eval.id, receipt).await?;
        Ok(Disposition::Nacked(outcome))
    }

    async fn fail_permanently(
        &self,
        eval: &Evaluation,
        receipt: Uuid,
        job: &Job,
        error: FleetError,
    ) -> Result<Disposition> {
        let reason = error.to_string();
        tracing::warn!(eval_id = %eval.id, job_id = %job.id, reason = %reason, "Job cannot be scheduled");
        self.broker.fail(eval.id, receipt, &reason).await?;
        self.fail_job(&job.id);
        Ok(Disposition::Failed(reason))
    }

    /// Retry budget ran out. The job fails only if nothing else is queued
    /// for it.
    pub async fn surface_exhausted(&self, job_id: Uuid, eval_id: Uuid) {
        if self.broker.has_outstanding(job_id, eval_id).await {
            tracing::info!(job_id = %job_id, eval_id = %eval_id, "Evaluation exhausted, job has other evaluations pending");
            return;
        }
        self.fail_job(&job_id);
    }

    /// Move the job to Failed and hand back whatever it still holds.
    fn fail_job(&self, job_id: &Uuid) {
        match self.jobs.transition(job_id, JobState::Failed) {
            Ok(_) => {
                if let Err(e) = self.release_job(job_id) {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed job kept its reservations");
                }
            }
            Err(FleetError::InvalidTransition { from, .. }) => {
                tracing::debug!(job_id = %job_id, state = %from, "Job already settled, not failing it");
            }
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to mark job failed"),
        }
    }

    /// Copy the evaluation's final broker state into the job's history.
    pub fn record(&self, eval_id: Uuid) {
        let eval = match self.broker.get(eval_id) {
            Ok(Some(eval)) => eval,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(eval_id = %eval_id, error = %e, "Could not read evaluation for history");
                return;
            }
        };
        match self.jobs.record_evaluation(&eval) {
            Ok(()) | Err(FleetError::JobNotFound(_)) => {}
            Err(e) => tracing::warn!(eval_id = %eval_id, error = %e, "Could not record evaluation"),
        }
    }

    fn release_job(&self, job_id: &Uuid) -> Result<()> {
        let released = self.jobs.release_assignments(job_id)?;
        for assignment in &released {
            self.directory
                .release(&assignment.node_id, &assignment.resources);
        }
        if !released.is_empty() {
            tracing::info!(job_id = %job_id, released = released.len(), "Reservations released");
        }
        Ok(())
    }

    fn release_assignments(&self, assignments: &[PlannedAssignment]) {
        for assignment in assignments {
            self.directory
                .release(&assignment.node_id, &assignment.resources);
        }
    }

    /// The job's own negotiation timeout, never longer than the configured one.
    fn negotiation_timeout(&self, job: &Job) -> Duration {
        let configured = self.timeouts.negotiation_timeout;
        job.negotiation_timeout
            .map_or(configured, |t| t.min(configured))
    }
}
