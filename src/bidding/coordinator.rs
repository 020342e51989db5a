use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::bidding::client::{BidRequest, BidResponse, NodeClient};
use crate::error::FleetError;
use crate::models::{Bid, BidOutcome, Job, Plan, PlannedAssignment, RejectReason};
use crate::nodes::NodeDirectory;
use crate::scheduler::PlanProposal;

/// Runs one bidding round against the planner's candidates and commits the
/// winners' reservations.
pub struct BiddingCoordinator {
    client: Arc<dyn NodeClient>,
    directory: Arc<NodeDirectory>,
}

impl BiddingCoordinator {
    pub fn new(client: Arc<dyn NodeClient>, directory: Arc<NodeDirectory>) -> Self {
        Self { client, directory }
    }

    /// Ask every candidate concurrently, wait for all answers or the
    /// deadline, then accept in rank order until `proposal.desired` nodes
    /// hold a reservation.
    ///
    /// `still_wanted` is checked after responses are in and before anything
    /// is reserved; if it returns false every response is discarded.
    pub async fn solicit<F>(
        &self,
        job: &Job,
        proposal: &PlanProposal,
        deadline: Instant,
        still_wanted: F,
    ) -> Plan
    where
        F: Fn() -> bool,
    {
        if proposal.is_empty() || proposal.desired == 0 {
            return Plan::empty(proposal.eval_id, job.id, proposal.desired);
        }

        let mut bids = self.collect_bids(job, proposal, deadline).await;

        if !still_wanted() {
            for bid in bids.iter_mut() {
                bid.outcome = BidOutcome::Rejected(RejectReason::JobCancelled);
            }
            tracing::info!(
                eval_id = %proposal.eval_id,
                job_id = %job.id,
                "Job no longer wants placement, discarding bids"
            );
            self.notify_unselected(&bids, proposal, job);
            return Plan::empty(proposal.eval_id, job.id, proposal.desired);
        }

        let mut assignments = Vec::new();
        for bid in bids.iter_mut() {
            if !bid.is_accepted() {
                continue;
            }
            if assignments.len() as u32 >= proposal.desired {
                break;
            }
            match self.directory.try_reserve(&bid.node_id, &bid.resources) {
                Ok(true) => {
                    tracing::info!(
                        eval_id = %proposal.eval_id,
                        job_id = %job.id,
                        node_id = %bid.node_id,
                        "Bid won"
                    );
                    assignments.push(PlannedAssignment {
                        node_id: bid.node_id.clone(),
                        resources: bid.resources,
                    });
                }
                Ok(false) => {
                    tracing::info!(
                        eval_id = %proposal.eval_id,
                        node_id = %bid.node_id,
                        "Accepted bid lost reservation race, falling through"
                    );
                    bid.outcome = BidOutcome::Rejected(RejectReason::CapacityRace);
                }
                Err(FleetError::NodeNotFound(_)) => {
                    bid.outcome = BidOutcome::Rejected(RejectReason::Unreachable(
                        "node deregistered".to_string(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(node_id = %bid.node_id, error = %e, "Reservation failed");
                    bid.outcome = BidOutcome::Rejected(RejectReason::Unreachable(e.to_string()));
                }
            }
        }

        let winners: Vec<&str> = assignments.iter().map(|a| a.node_id.as_str()).collect();
        let losers: Vec<Bid> = bids
            .iter()
            .filter(|b| b.is_accepted() && !winners.contains(&b.node_id.as_str()))
            .cloned()
            .collect();
        self.notify_unselected(&losers, proposal, job);

        let unmet_replicas = proposal.desired.saturating_sub(assignments.len() as u32);
        tracing::info!(
            eval_id = %proposal.eval_id,
            job_id = %job.id,
            solicited = bids.len(),
            won = assignments.len(),
            unmet = unmet_replicas,
            "Bidding round finished"
        );

        Plan {
            eval_id: proposal.eval_id,
            job_id: job.id,
            assignments,
            unmet_replicas,
        }
    }

    /// Fan out to every candidate and join on all responses or the deadline.
    /// Returned bids keep the candidates' rank order.
    async fn collect_bids(&self, job: &Job, proposal: &PlanProposal, deadline: Instant) -> Vec<Bid> {
        let mut bids: Vec<Bid> = proposal
            .candidates
            .iter()
            .map(|c| Bid {
                eval_id: proposal.eval_id,
                node_id: c.node_id.clone(),
                outcome: BidOutcome::Offered,
                resources: job.resources,
            })
            .collect();

        let mut set = JoinSet::new();
        for (idx, candidate) in proposal.candidates.iter().enumerate() {
            let client = self.client.clone();
            let request = BidRequest {
                eval_id: proposal.eval_id,
                job_id: job.id,
                node_id: candidate.node_id.clone(),
                resources: job.resources,
                engine: job.engine.clone(),
                execution_timeout: job.execution_timeout,
            };
            set.spawn(async move {
                let outcome = match tokio::time::timeout_at(deadline, client.ask_for_bid(request))
                    .await
                {
                    Ok(Ok(BidResponse::Accepted)) => BidOutcome::Accepted,
                    Ok(Ok(BidResponse::Rejected(reason))) => {
                        BidOutcome::Rejected(RejectReason::Declined(reason))
                    }
                    Ok(Err(e)) => BidOutcome::Rejected(RejectReason::Unreachable(e.to_string())),
                    Err(_) => BidOutcome::Rejected(RejectReason::Timeout),
                };
                (idx, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, outcome)) => {
                    if let Some(bid) = bids.get_mut(idx) {
                        bid.outcome = outcome;
                    }
                }
                Err(e) => {
                    tracing::warn!(eval_id = %proposal.eval_id, error = %e, "Bid task failed");
                }
            }
        }

        for bid in bids.iter_mut() {
            // A task that died without reporting never answered.
            if bid.outcome == BidOutcome::Offered {
                bid.outcome = BidOutcome::Rejected(RejectReason::Timeout);
            }
            match &bid.outcome {
                BidOutcome::Rejected(reason) => tracing::info!(
                    eval_id = %bid.eval_id,
                    node_id = %bid.node_id,
                    reason = %reason,
                    "Bid rejected"
                ),
                _ => tracing::info!(
                    eval_id = %bid.eval_id,
                    node_id = %bid.node_id,
                    "Bid accepted"
                ),
            }
        }
        bids
    }

    fn notify_unselected(&self, bids: &[Bid], proposal: &PlanProposal, job: &Job) {
        for bid in bids {
            let client = self.client.clone();
            let node_id = bid.node_id.clone();
            let eval_id = proposal.eval_id;
            let job_id = job.id;
            tokio::spawn(async move {
                client.notify_bid_rejected(&node_id, eval_id, job_id).await;
            });
        }
    }
}
