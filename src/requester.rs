use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bidding::{BiddingCoordinator, NodeClient};
use crate::broker::{EnqueueOutcome, EvalBroker};
use crate::config::RequesterConfig;
use crate::error::{FleetError, Result};
use crate::jobstore::{EvaluationRecord, ExecutionOutcome, JobPage, JobStore, ListOptions};
use crate::models::{EvalStatus, Evaluation, Job, JobState, NodeAdvertisement, NodeInfo, TriggerKind};
use crate::nodes::{NodeChange, NodeDirectory};
use crate::random::RandomSource;
use crate::scheduler::{AdvertisedProbes, Planner, ProbeChecker};
use crate::store::KvStore;
use crate::worker::{EvalProcessor, WorkerPool};

/// The orchestrator core as the outside world sees it.
///
/// Wires the job store, node directory, broker, planner and bidding
/// coordinator together, and exposes the entry points the submission,
/// heartbeat and execution layers call.
pub struct Requester {
    config: RequesterConfig,
    jobs: JobStore,
    broker: Arc<EvalBroker>,
    directory: Arc<NodeDirectory>,
    processor: Arc<EvalProcessor>,
    random: Arc<RandomSource>,
}

impl Requester {
    pub fn new(
        config: RequesterConfig,
        store: Arc<dyn KvStore>,
        client: Arc<dyn NodeClient>,
        random: Arc<RandomSource>,
    ) -> Result<Self> {
        Self::with_probe_checker(config, store, client, random, Arc::new(AdvertisedProbes))
    }

    pub fn with_probe_checker(
        config: RequesterConfig,
        store: Arc<dyn KvStore>,
        client: Arc<dyn NodeClient>,
        random: Arc<RandomSource>,
        probes: Arc<dyn ProbeChecker>,
    ) -> Result<Self> {
        config.validate()?;

        let jobs = JobStore::new(store.clone(), config.default_excluded_tags.clone());
        let directory = Arc::new(NodeDirectory::new(config.scheduler.node_liveness_threshold));
        let broker = Arc::new(EvalBroker::new(
            config.broker.clone(),
            config.scheduler.node_rank_randomness_range,
            store,
            random.clone(),
        ));
        let planner = Arc::new(Planner::new(
            config.scheduler.clone(),
            config.capacity.clone(),
            random.clone(),
            probes,
        ));
        let bidding = Arc::new(BiddingCoordinator::new(client, directory.clone()));
        let processor = Arc::new(EvalProcessor::new(
            broker.clone(),
            jobs.clone(),
            directory.clone(),
            planner,
            bidding,
            config.timeouts.clone(),
        ));

        Ok(Self {
            config,
            jobs,
            broker,
            directory,
            processor,
            random,
        })
    }

    pub fn broker(&self) -> &Arc<EvalBroker> {
        &self.broker
    }

    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.directory
    }

    pub fn processor(&self) -> &Arc<EvalProcessor> {
        &self.processor
    }

    /// Reload unfinished evaluations after a restart.
    pub async fn restore(&self) -> Result<usize> {
        self.broker.restore().await
    }

    /// Persist a new job and queue its first evaluation.
    pub async fn submit_job(&self, mut job: Job) -> Result<Uuid> {
        self.normalise(&mut job)?;

        let demand = self
            .jobs
            .outstanding_demand()?
            .add(&job.resources.times(job.count));
        if !self.config.capacity.queue_limits.admits(&demand) {
            tracing::warn!(job_id = %job.id, demand = %demand, "Queue limit reached, rejecting job");
            return Err(FleetError::QueueFull);
        }

        let job_id = job.id;
        self.jobs.create(job)?;
        self.broker
            .enqueue(Evaluation::new(job_id, TriggerKind::JobRegistered))
            .await?;
        Ok(job_id)
    }

    fn normalise(&self, job: &mut Job) -> Result<()> {
        let timeouts = &self.config.timeouts;
        match job.execution_timeout {
            None => job.execution_timeout = Some(timeouts.default_execution_timeout),
            Some(t) if t < timeouts.min_execution_timeout => {
                return Err(FleetError::InvalidJob(format!(
                    "execution timeout {t:?} is below the minimum {:?}",
                    timeouts.min_execution_timeout
                )))
            }
            Some(t) => {
                if let Some(max) = timeouts.max_execution_timeout {
                    if t > max {
                        return Err(FleetError::InvalidJob(format!(
                            "execution timeout {t:?} exceeds the maximum {max:?}"
                        )));
                    }
                }
            }
        }
        if job.negotiation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(FleetError::InvalidJob(
                "negotiation timeout must be non-zero".to_string(),
            ));
        }
        if job.resources.is_zero() {
            job.resources = self.config.capacity.default_job_resources;
        }
        job.state = JobState::Pending;
        job.assignments.clear();
        Ok(())
    }

    /// Mark the job Cancelled, drop its pending evaluations and queue the
    /// evaluation that releases its reservations.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        self.jobs.cancel(&job_id)?;
        self.broker.cancel(job_id).await?;
        self.broker
            .enqueue(Evaluation::new(job_id, TriggerKind::JobCancelled))
            .await?;
        Ok(())
    }

    /// Issue a fresh evaluation for one whose retry budget ran out. The job
    /// must still be unsettled; an exhausted evaluation is never revived on
    /// its own.
    pub async fn retry_evaluation(&self, eval_id: Uuid) -> Result<EnqueueOutcome> {
        let exhausted = self
            .broker
            .get(eval_id)?
            .ok_or(FleetError::EvaluationNotFound(eval_id))?;
        if exhausted.status != EvalStatus::Failed {
            return Err(FleetError::EvaluationNotFailed(eval_id));
        }
        let job = self.jobs.get(&exhausted.job_id)?;
        if job.state.is_terminal() {
            return Err(FleetError::InvalidTransition {
                from: job.state,
                to: JobState::Pending,
            });
        }

        let outcome = self
            .broker
            .enqueue(Evaluation::new(job.id, TriggerKind::RetryOf(eval_id)))
            .await?;
        tracing::info!(job_id = %job.id, retry_of = %eval_id, eval_id = %outcome.id(), "Retry evaluation issued");
        Ok(outcome)
    }

    /// Ingest a node heartbeat. New capacity triggers a rescan of every job
    /// that still has unplaced replicas.
    pub async fn node_heartbeat(&self, info: NodeInfo) -> Result<NodeChange> {
        let node_id = info.id.clone();
        let change = self.directory.upsert(info);
        if change.triggers_rescan() {
            let queued =
                enqueue_for_unmet(&self.broker, &self.jobs, TriggerKind::NodeUpdated, false)
                    .await?;
            if queued > 0 {
                tracing::info!(node_id = %node_id, change = ?change, queued, "Rescan queued");
            }
        }
        Ok(change)
    }

    pub fn deregister_node(&self, node_id: &str) -> Result<()> {
        self.directory.deregister(node_id)
    }

    /// Accept the execution layer's report for one replica and release its
    /// reservation. A failure that fails the whole job releases the rest too.
    pub fn report_execution(
        &self,
        job_id: Uuid,
        node_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<Job> {
        if let Some(finished) = self.jobs.report_execution(&job_id, node_id, outcome)? {
            self.directory
                .release(&finished.node_id, &finished.resources);
        }

        let job = self.jobs.get(&job_id)?;
        if job.state.is_terminal() {
            for assignment in self.jobs.release_assignments(&job_id)? {
                self.directory
                    .release(&assignment.node_id, &assignment.resources);
            }
        }
        Ok(job)
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.jobs.get(&job_id)
    }

    pub fn job_history(&self, job_id: Uuid) -> Result<Vec<EvaluationRecord>> {
        self.jobs.history(&job_id)
    }

    pub fn list_jobs(&self, options: &ListOptions) -> Result<JobPage> {
        self.jobs.list(options)
    }

    pub fn nodes(&self) -> Vec<NodeAdvertisement> {
        self.directory.snapshot()
    }

    /// Run the worker pool, the visibility sweeper and housekeeping until
    /// `shutdown` fires, then wait for every task to drain.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();

        let pool = WorkerPool::new(
            self.processor.clone(),
            self.broker.clone(),
            self.config.worker.clone(),
            self.random.clone(),
            self.config.broker.sweep_interval,
        );
        pool.spawn(&mut tasks, shutdown.clone());

        let housekeeping = Housekeeping {
            broker: self.broker.clone(),
            jobs: self.jobs.clone(),
            directory: self.directory.clone(),
            period: self.config.scheduler.housekeeping_interval,
        };
        tasks.spawn(housekeeping.run(shutdown));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Scheduler task panicked");
            }
        }
        tracing::info!("Requester stopped");
    }
}

/// Queue `trigger` for every unsettled job with unplaced replicas. With
/// `skip_busy`, jobs that already have an evaluation pending or in flight
/// are left alone.
async fn enqueue_for_unmet(
    broker: &EvalBroker,
    jobs: &JobStore,
    trigger: TriggerKind,
    skip_busy: bool,
) -> Result<usize> {
    let mut queued = 0;
    for job in jobs.jobs_needing_capacity()? {
        if skip_busy && broker.has_outstanding(job.id, Uuid::nil()).await {
            continue;
        }
        if let EnqueueOutcome::Enqueued(_) = broker.enqueue(Evaluation::new(job.id, trigger)).await? {
            queued += 1;
        }
    }
    Ok(queued)
}

/// Periodic rescan of starved jobs plus evaluation GC.
struct Housekeeping {
    broker: Arc<EvalBroker>,
    jobs: JobStore,
    directory: Arc<NodeDirectory>,
    period: std::time::Duration,
}

impl Housekeeping {
    async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing is starved yet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let dead = self.directory.dead_nodes();
            if !dead.is_empty() {
                tracing::debug!(nodes = ?dead, "Nodes past liveness threshold");
            }

            match enqueue_for_unmet(&self.broker, &self.jobs, TriggerKind::PeriodicRescan, true)
                .await
            {
                Ok(0) => {}
                Ok(queued) => tracing::info!(queued, "Periodic rescan queued"),
                Err(e) => tracing::warn!(error = %e, "Periodic rescan failed"),
            }

            if let Err(e) = self.broker.gc(self.broker.retention()).await {
                tracing::warn!(error = %e, "Evaluation GC failed");
            }
        }
    }
}
