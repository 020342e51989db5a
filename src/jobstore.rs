use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::models::{
    Assignment, AssignmentState, EvalStatus, Evaluation, Job, JobState, Plan, PlannedAssignment,
    Resources, TriggerKind,
};
use crate::store::{KvStore, StoreError, Table};

const JOBS_TABLE: &str = "jobs";
const MAX_CAS_ATTEMPTS: usize = 16;
const MAX_EVAL_HISTORY: usize = 64;

/// One line of a job's scheduling history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub eval_id: Uuid,
    pub trigger: TriggerKind,
    pub status: EvalStatus,
    pub delivery_count: u32,
    pub description: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    job: Job,
    history: Vec<EvaluationRecord>,
}

/// What the execution layer reports for one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Only jobs carrying at least one of these tags (empty = all)
    pub include_tags: Vec<String>,
    /// Jobs carrying any of these tags are skipped
    pub exclude_tags: Vec<String>,
    /// Also show jobs carrying a default-excluded tag
    pub include_excluded: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Result of [`JobStore::apply_plan`].
#[derive(Debug, Clone)]
pub struct AppliedPlan {
    pub job: Job,
    /// Winners the job no longer had room for
    pub surplus: Vec<PlannedAssignment>,
}

#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: usize,
    pub has_more: bool,
}

/// Durable job records and their evaluation history.
///
/// Every mutation is a read-modify-write on the job's key, committed with a
/// compare-and-swap on the stored version and retried on conflict.
#[derive(Clone)]
pub struct JobStore {
    table: Table<JobRecord>,
    default_excluded_tags: Vec<String>,
}

impl JobStore {
    pub fn new(store: Arc<dyn KvStore>, default_excluded_tags: Vec<String>) -> Self {
        Self {
            table: Table::new(store, JOBS_TABLE),
            default_excluded_tags,
        }
    }

    pub fn create(&self, job: Job) -> Result<()> {
        let job_id = job.id;
        let record = JobRecord {
            job,
            history: Vec::new(),
        };
        match self.table.insert(&job_id.to_string(), &record) {
            Ok(_) => {
                tracing::info!(job_id = %job_id, "Job created");
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => Err(FleetError::InvalidJob(format!(
                "job {job_id} already exists"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, id: &Uuid) -> Result<Job> {
        self.table
            .get(&id.to_string())?
            .map(|v| v.value.job)
            .ok_or(FleetError::JobNotFound(*id))
    }

    pub fn history(&self, id: &Uuid) -> Result<Vec<EvaluationRecord>> {
        self.table
            .get(&id.to_string())?
            .map(|v| v.value.history)
            .ok_or(FleetError::JobNotFound(*id))
    }

    fn update<T>(&self, id: &Uuid, mut mutate: impl FnMut(&mut JobRecord) -> Result<T>) -> Result<T> {
        let key = id.to_string();
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.table.get(&key)?.ok_or(FleetError::JobNotFound(*id))?;
            let mut record = current.value;
            let out = mutate(&mut record)?;
            record.job.modified_at = Utc::now();

            match self.table.swap(&key, current.version, &record) {
                Ok(_) => return Ok(out),
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::debug!(job_id = %id, "Job write conflict, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(FleetError::BrokerUnavailable(format!(
            "job {id} kept conflicting after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    /// Move a job forward. Writing the current state again is a no-op.
    pub fn transition(&self, id: &Uuid, to: JobState) -> Result<Job> {
        self.update(id, |record| {
            let from = record.job.state;
            if from == to {
                return Ok(record.job.clone());
            }
            if !from.can_transition_to(to) {
                return Err(FleetError::InvalidTransition { from, to });
            }
            record.job.state = to;
            tracing::info!(job_id = %id, from = %from, to = %to, "Job state changed");
            Ok(record.job.clone())
        })
    }

    pub fn record_evaluation(&self, eval: &Evaluation) -> Result<()> {
        let entry = EvaluationRecord {
            eval_id: eval.id,
            trigger: eval.trigger,
            status: eval.status,
            delivery_count: eval.delivery_count,
            description: eval.status_description.clone(),
            recorded_at: Utc::now(),
        };
        self.update(&eval.job_id, |record| {
            record.history.push(entry.clone());
            if record.history.len() > MAX_EVAL_HISTORY {
                let overflow = record.history.len() - MAX_EVAL_HISTORY;
                record.history.drain(..overflow);
            }
            Ok(())
        })
    }

    /// Append the plan's winners to the job and advance its state.
    ///
    /// Winners are trimmed to the job's shortfall as of the write, and a
    /// winner on a node that already runs a replica of the job is turned
    /// away too; another evaluation of the same job may have landed first.
    /// Turned-away winners come back in [`AppliedPlan::surplus`] and still
    /// hold their node reservations.
    ///
    /// Fails without writing if the job reached a terminal state while the
    /// round was in flight; the caller owns releasing the reservations.
    pub fn apply_plan(&self, plan: &Plan) -> Result<AppliedPlan> {
        self.update(&plan.job_id, |record| {
            let job = &mut record.job;
            match job.state {
                JobState::Cancelled => return Err(FleetError::JobCancelled(job.id)),
                state if state.is_terminal() => {
                    return Err(FleetError::InvalidTransition {
                        from: state,
                        to: JobState::Running,
                    })
                }
                _ => {}
            }

            let now = Utc::now();
            let mut room = job.shortfall();
            let mut surplus = Vec::new();
            for planned in &plan.assignments {
                let hosted = job
                    .active_assignments()
                    .any(|a| a.node_id == planned.node_id);
                if room == 0 || hosted {
                    surplus.push(planned.clone());
                    continue;
                }
                job.assignments.push(Assignment {
                    node_id: planned.node_id.clone(),
                    eval_id: plan.eval_id,
                    resources: planned.resources,
                    state: AssignmentState::Active,
                    assigned_at: now,
                });
                room -= 1;
            }

            let committed = job.committed_replicas();
            let next = if committed >= job.count {
                JobState::Running
            } else if committed > 0 {
                JobState::PartiallyRunning
            } else {
                job.state
            };
            if job.state.can_transition_to(next) {
                job.state = next;
            }
            Ok(AppliedPlan {
                job: job.clone(),
                surplus,
            })
        })
    }

    /// Mark the job Cancelled. Returns the assignments that still hold a
    /// reservation; they stay Active until [`JobStore::release_assignments`].
    pub fn cancel(&self, id: &Uuid) -> Result<Vec<Assignment>> {
        let active = self.update(id, |record| {
            let from = record.job.state;
            if from == JobState::Cancelled {
                return Ok(record.job.active_assignments().cloned().collect());
            }
            if !from.can_transition_to(JobState::Cancelled) {
                return Err(FleetError::InvalidTransition {
                    from,
                    to: JobState::Cancelled,
                });
            }
            record.job.state = JobState::Cancelled;
            Ok(record.job.active_assignments().cloned().collect::<Vec<_>>())
        })?;
        tracing::info!(job_id = %id, active = active.len(), "Job cancelled");
        Ok(active)
    }

    /// Flip every Active assignment to Released and return them. Each
    /// assignment is returned at most once across concurrent callers.
    pub fn release_assignments(&self, id: &Uuid) -> Result<Vec<Assignment>> {
        self.update(id, |record| {
            let mut released = Vec::new();
            for assignment in record.job.assignments.iter_mut() {
                if assignment.state == AssignmentState::Active {
                    assignment.state = AssignmentState::Released;
                    released.push(assignment.clone());
                }
            }
            Ok(released)
        })
    }

    /// Accept an execution-layer report for the replica on `node_id`.
    ///
    /// Returns the assignment whose reservation should now be released, or
    /// `None` if no active assignment matched.
    pub fn report_execution(
        &self,
        id: &Uuid,
        node_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<Option<Assignment>> {
        self.update(id, |record| {
            let job = &mut record.job;
            let Some(assignment) = job
                .assignments
                .iter_mut()
                .find(|a| a.node_id == node_id && a.state == AssignmentState::Active)
            else {
                return Ok(None);
            };
            assignment.state = match outcome {
                ExecutionOutcome::Completed => AssignmentState::Completed,
                ExecutionOutcome::Failed => AssignmentState::Failed,
            };
            let finished = assignment.clone();

            let completed = job
                .assignments
                .iter()
                .filter(|a| a.state == AssignmentState::Completed)
                .count() as u32;

            let next = match outcome {
                ExecutionOutcome::Completed if completed >= job.count => Some(JobState::Completed),
                ExecutionOutcome::Failed if !job.allow_partial => Some(JobState::Failed),
                _ => None,
            };
            if let Some(next) = next {
                if job.state.can_transition_to(next) {
                    job.state = next;
                }
            }
            Ok(Some(finished))
        })
    }

    pub fn list(&self, options: &ListOptions) -> Result<JobPage> {
        let mut jobs: Vec<Job> = self
            .table
            .scan()?
            .into_iter()
            .map(|(_, v)| v.value.job)
            .filter(|job| self.matches_tags(job, options))
            .collect();
        jobs.sort_by_key(|j| j.created_at);

        let total = jobs.len();
        let page: Vec<Job> = jobs
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        let has_more = options.offset + page.len() < total;

        Ok(JobPage {
            jobs: page,
            total,
            has_more,
        })
    }

    fn matches_tags(&self, job: &Job, options: &ListOptions) -> bool {
        let has = |tag: &String| job.labels.iter().any(|l| l == tag);

        if !options.include_tags.is_empty() && !options.include_tags.iter().any(has) {
            return false;
        }
        if options.exclude_tags.iter().any(has) {
            return false;
        }
        if !options.include_excluded {
            // Explicitly included tags override the default exclusion.
            let hidden = self
                .default_excluded_tags
                .iter()
                .any(|t| has(t) && !options.include_tags.contains(t));
            if hidden {
                return false;
            }
        }
        true
    }

    /// Non-terminal jobs that still have replicas to place.
    pub fn jobs_needing_capacity(&self) -> Result<Vec<Job>> {
        Ok(self
            .table
            .scan()?
            .into_iter()
            .map(|(_, v)| v.value.job)
            .filter(|job| !job.state.is_terminal() && job.shortfall() > 0)
            .collect())
    }

    /// Summed resources of every replica still waiting for placement.
    pub fn outstanding_demand(&self) -> Result<Resources> {
        Ok(self
            .jobs_needing_capacity()?
            .iter()
            .fold(Resources::default(), |acc, job| {
                acc.add(&job.resources.times(job.shortfall()))
            }))
    }
}
