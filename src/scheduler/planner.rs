use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::{CapacityConfig, SchedulerConfig};
use crate::error::{FleetError, Result};
use crate::models::{Evaluation, Job, NodeAdvertisement, Resources};
use crate::random::RandomSource;
use crate::scheduler::probe::{Probe, ProbeChecker};
use crate::scheduler::ranking::{fit_score, Filters};
use crate::scheduler::selector::LabelSelector;

/// A node chosen as a bid target, in rank order.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedNode {
    pub node_id: String,
    /// Fit score plus perturbation
    pub rank: u32,
    pub available: Resources,
}

/// The planner's output for one evaluation.
#[derive(Debug, Clone)]
pub struct PlanProposal {
    pub eval_id: Uuid,
    pub job_id: Uuid,
    /// Replicas this round should place (the job's shortfall)
    pub desired: u32,
    /// Nodes that passed every hard filter
    pub eligible: usize,
    /// Bid targets, best first; at most `over_ask * desired`
    pub candidates: Vec<RankedNode>,
    /// Replicas that cannot be placed even if every eligible node accepts
    pub unmet_replicas: u32,
}

impl PlanProposal {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Turns a job plus a node snapshot into a ranked list of bid targets.
///
/// Commits nothing: the only side effect is drawing from the shared
/// randomness source.
pub struct Planner {
    config: SchedulerConfig,
    capacity: CapacityConfig,
    random: Arc<RandomSource>,
    probes: Arc<dyn ProbeChecker>,
}

impl Planner {
    pub fn new(
        config: SchedulerConfig,
        capacity: CapacityConfig,
        random: Arc<RandomSource>,
        probes: Arc<dyn ProbeChecker>,
    ) -> Self {
        Self {
            config,
            capacity,
            random,
            probes,
        }
    }

    /// Reject jobs that no amount of waiting can place.
    pub fn validate(&self, job: &Job) -> Result<(Vec<LabelSelector>, Vec<Probe>)> {
        if job.count == 0 {
            return Err(FleetError::InvalidJob(format!(
                "job {} requests zero replicas",
                job.id
            )));
        }
        if !self.capacity.job_limits.admits(&job.resources) {
            return Err(FleetError::ResourcesExceedLimits {
                job_id: job.id,
                limit: "per-job",
            });
        }
        if !self.capacity.total_limits.admits(&job.total_resources()) {
            return Err(FleetError::ResourcesExceedLimits {
                job_id: job.id,
                limit: "total",
            });
        }
        if job.network && !job.selection.accept_networked {
            return Err(FleetError::InvalidSelectionPolicy(
                "job needs networking but its policy refuses networked placement".to_string(),
            ));
        }
        if job.is_stateless() && job.selection.reject_stateless {
            return Err(FleetError::InvalidSelectionPolicy(
                "job has no inputs but its policy rejects stateless jobs".to_string(),
            ));
        }

        let selectors = job
            .constraints
            .iter()
            .map(|raw| LabelSelector::parse(raw))
            .collect::<Result<Vec<_>>>()?;
        let probes = Probe::from_policy(&job.selection)?;
        Ok((selectors, probes))
    }

    pub fn plan(
        &self,
        job: &Job,
        eval: &Evaluation,
        nodes: &[NodeAdvertisement],
    ) -> Result<PlanProposal> {
        let (selectors, probes) = self.validate(job)?;
        let desired = job.shortfall();

        let mut proposal = PlanProposal {
            eval_id: eval.id,
            job_id: job.id,
            desired,
            eligible: 0,
            candidates: Vec::new(),
            unmet_replicas: desired,
        };
        if desired == 0 {
            tracing::debug!(job_id = %job.id, "Job fully placed, nothing to plan");
            return Ok(proposal);
        }

        let occupied: HashSet<String> = job
            .active_assignments()
            .map(|a| a.node_id.clone())
            .collect();
        let filters = Filters {
            job,
            selectors: &selectors,
            probes: &probes,
            checker: self.probes.as_ref(),
            occupied: &occupied,
        };

        let mut ranked: Vec<RankedNode> = Vec::new();
        for node in nodes {
            match filters.check(node) {
                Ok(()) => ranked.push(RankedNode {
                    node_id: node.info.id.clone(),
                    rank: fit_score(&job.resources, node),
                    available: node.available(),
                }),
                Err(reason) => {
                    tracing::debug!(
                        eval_id = %eval.id,
                        node_id = %node.info.id,
                        reason = %reason,
                        "Node filtered"
                    );
                }
            }
        }

        self.perturb_top_tier(&mut ranked);
        ranked.sort_by(|a, b| b.rank.cmp(&a.rank).then_with(|| a.node_id.cmp(&b.node_id)));

        let eligible = ranked.len();
        let targets = (self.config.over_ask_factor as usize)
            .saturating_mul(desired as usize)
            .min(eligible);
        ranked.truncate(targets);

        proposal.eligible = eligible;
        proposal.unmet_replicas = desired.saturating_sub(eligible as u32);
        proposal.candidates = ranked;

        tracing::debug!(
            eval_id = %eval.id,
            job_id = %job.id,
            desired,
            eligible,
            targets,
            "Plan proposed"
        );
        Ok(proposal)
    }

    /// Nodes within `range` points of the best score get up to `range` extra
    /// points, so near-ties do not always resolve to the same node.
    fn perturb_top_tier(&self, ranked: &mut [RankedNode]) {
        let range = self.config.node_rank_randomness_range;
        if range == 0 {
            return;
        }
        let Some(best) = ranked.iter().map(|n| n.rank).max() else {
            return;
        };
        for node in ranked.iter_mut() {
            if node.rank.saturating_add(range) >= best {
                node.rank += self.random.jitter(range);
            }
        }
    }
}
