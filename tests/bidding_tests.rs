//! Integration tests for the bidding coordinator.
//!
//! These tests validate that:
//! - Every candidate is solicited and at most `desired` winners are committed
//! - Silent nodes time out at the negotiation deadline and the round moves on
//! - A node that loses the reservation race is demoted and the round falls
//!   through to the next accepted candidate
//! - Concurrent rounds against a constrained node never over-commit it

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use fleet_scheduler::bidding::{BiddingCoordinator, NodeBehavior, SimulatedNodeClient};
use fleet_scheduler::config::{CapacityConfig, SchedulerConfig};
use fleet_scheduler::models::{Evaluation, Job, NodeInfo, TriggerKind};
use fleet_scheduler::nodes::NodeDirectory;
use fleet_scheduler::random::RandomSource;
use fleet_scheduler::scheduler::{AdvertisedProbes, PlanProposal, Planner};
use test_harness::{assert_eventually, cpu};

struct Round {
    directory: Arc<NodeDirectory>,
    client: Arc<SimulatedNodeClient>,
    planner: Planner,
    coordinator: Arc<BiddingCoordinator>,
}

impl Round {
    fn new(over_ask: u32) -> Self {
        let directory = Arc::new(NodeDirectory::new(Duration::from_secs(30)));
        let client = Arc::new(SimulatedNodeClient::accepting());
        let planner = Planner::new(
            SchedulerConfig {
                over_ask_factor: over_ask,
                node_rank_randomness_range: 0,
                ..SchedulerConfig::default()
            },
            CapacityConfig::default(),
            Arc::new(RandomSource::seeded(3)),
            Arc::new(AdvertisedProbes),
        );
        let coordinator = Arc::new(BiddingCoordinator::new(client.clone(), directory.clone()));
        Self {
            directory,
            client,
            planner,
            coordinator,
        }
    }

    fn add_nodes(&self, count: usize, cores: f64) {
        for i in 1..=count {
            self.directory
                .upsert(NodeInfo::new(format!("node-{i}"), cpu(cores)));
        }
    }

    fn propose(&self, job: &Job) -> PlanProposal {
        let eval = Evaluation::new(job.id, TriggerKind::JobRegistered);
        self.planner
            .plan(job, &eval, &self.directory.snapshot())
            .unwrap()
    }

    fn reserved_cpu(&self) -> f64 {
        self.directory
            .snapshot()
            .iter()
            .map(|n| n.reserved.cpu)
            .sum()
    }
}

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[tokio::test]
async fn test_three_replicas_over_five_nodes() {
    let round = Round::new(2);
    round.add_nodes(5, 1.0);
    let job = Job::new("web", 3, cpu(1.0));

    let proposal = round.propose(&job);
    assert_eq!(proposal.candidates.len(), 5);

    let plan = round
        .coordinator
        .solicit(&job, &proposal, soon(), || true)
        .await;

    assert_eq!(round.client.solicitations_for(proposal.eval_id).len(), 5);
    assert_eq!(plan.assignments.len(), 3);
    assert_eq!(plan.unmet_replicas, 0);
    assert!(plan.is_satisfied());
    assert_eq!(round.reserved_cpu(), 3.0);

    // The two accepted-but-unselected nodes are told so.
    let client = round.client.clone();
    assert_eventually(
        || {
            let client = client.clone();
            async move { client.rejection_notices().len() == 2 }
        },
        Duration::from_secs(1),
        "losing bidders were not notified",
    )
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_node_times_out() {
    let round = Round::new(3);
    round.add_nodes(3, 1.0);
    round.client.set_behavior("node-1", NodeBehavior::Silent);
    let job = Job::new("web", 2, cpu(1.0));
    let proposal = round.propose(&job);

    let started = Instant::now();
    let plan = round
        .coordinator
        .solicit(
            &job,
            &proposal,
            Instant::now() + Duration::from_millis(200),
            || true,
        )
        .await;

    assert!(started.elapsed() >= Duration::from_millis(200));
    let winners: Vec<&str> = plan.assignments.iter().map(|a| a.node_id.as_str()).collect();
    assert_eq!(winners, vec!["node-2", "node-3"]);
    assert_eq!(plan.unmet_replicas, 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_bid_past_deadline_is_discarded() {
    let round = Round::new(3);
    round.add_nodes(1, 1.0);
    round
        .client
        .set_behavior("node-1", NodeBehavior::AcceptAfter(Duration::from_secs(10)));
    let job = Job::new("web", 1, cpu(1.0));
    let proposal = round.propose(&job);

    let plan = round
        .coordinator
        .solicit(&job, &proposal, Instant::now() + Duration::from_secs(1), || true)
        .await;

    assert!(plan.is_empty());
    assert_eq!(plan.unmet_replicas, 1);
    assert_eq!(round.reserved_cpu(), 0.0);
}

#[tokio::test]
async fn test_declines_and_unreachable_nodes_fall_through() {
    let round = Round::new(3);
    round.add_nodes(4, 1.0);
    round
        .client
        .set_behavior("node-1", NodeBehavior::Reject("maintenance".into()));
    round.client.set_behavior("node-2", NodeBehavior::Unreachable);
    let job = Job::new("web", 2, cpu(1.0));
    let proposal = round.propose(&job);

    let plan = round
        .coordinator
        .solicit(&job, &proposal, soon(), || true)
        .await;
    let winners: Vec<&str> = plan.assignments.iter().map(|a| a.node_id.as_str()).collect();
    assert_eq!(winners, vec!["node-3", "node-4"]);
}

#[tokio::test]
async fn test_not_enough_acceptances_reports_shortfall() {
    let round = Round::new(3);
    round.add_nodes(3, 1.0);
    round
        .client
        .set_behavior("node-2", NodeBehavior::Reject("busy".into()));
    round
        .client
        .set_behavior("node-3", NodeBehavior::Reject("busy".into()));
    let job = Job::new("web", 2, cpu(1.0));
    let proposal = round.propose(&job);

    let plan = round
        .coordinator
        .solicit(&job, &proposal, soon(), || true)
        .await;
    assert_eq!(plan.assignments.len(), 1);
    assert_eq!(plan.unmet_replicas, 1);
    assert!(!plan.is_satisfied());
}

#[tokio::test]
async fn test_stale_snapshot_race_for_last_unit() {
    let round = Round::new(3);
    round.add_nodes(1, 1.0);
    let first = Job::new("a", 1, cpu(1.0));
    let second = Job::new("b", 1, cpu(1.0));

    // Both plans see the node with a free core.
    let first_proposal = round.propose(&first);
    let second_proposal = round.propose(&second);
    assert_eq!(first_proposal.candidates.len(), 1);
    assert_eq!(second_proposal.candidates.len(), 1);

    let won = round
        .coordinator
        .solicit(&first, &first_proposal, soon(), || true)
        .await;
    let lost = round
        .coordinator
        .solicit(&second, &second_proposal, soon(), || true)
        .await;

    assert_eq!(won.assignments.len(), 1);
    assert!(lost.is_empty());
    assert_eq!(lost.unmet_replicas, 1);
    assert_eq!(round.reserved_cpu(), 1.0);
}

#[tokio::test]
async fn test_race_loser_falls_through_to_next_candidate() {
    let round = Round::new(3);
    round.directory.upsert(NodeInfo::new("node-1", cpu(1.0)));
    round.directory.upsert(NodeInfo::new("node-2", cpu(4.0)));
    let job = Job::new("web", 1, cpu(1.0));
    let proposal = round.propose(&job);
    assert_eq!(proposal.candidates[0].node_id, "node-1");

    // Someone else takes node-1 between planning and bidding.
    assert!(round.directory.try_reserve("node-1", &cpu(1.0)).unwrap());

    let plan = round
        .coordinator
        .solicit(&job, &proposal, soon(), || true)
        .await;
    assert_eq!(plan.assignments.len(), 1);
    assert_eq!(plan.assignments[0].node_id, "node-2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rounds_never_over_commit() {
    let round = Round::new(1);
    round.directory.upsert(NodeInfo::new("shared", cpu(2.0)));

    let mut rounds = JoinSet::new();
    for i in 0..10 {
        let job = Job::new(format!("job-{i}"), 1, cpu(1.0));
        let proposal = round.propose(&job);
        assert_eq!(proposal.candidates.len(), 1);
        let coordinator = round.coordinator.clone();
        rounds.spawn(async move {
            coordinator
                .solicit(&job, &proposal, soon(), || true)
                .await
        });
    }

    let mut committed = 0;
    while let Some(plan) = rounds.join_next().await {
        committed += plan.unwrap().assignments.len();
    }

    assert_eq!(committed, 2);
    let node = round.directory.get("shared").unwrap();
    assert!(node.reserved.fits_within(&node.total));
    assert_eq!(node.reserved.cpu, 2.0);
}

#[tokio::test]
async fn test_cancelled_job_discards_responses() {
    let round = Round::new(3);
    round.add_nodes(3, 1.0);
    let job = Job::new("web", 2, cpu(1.0));
    let proposal = round.propose(&job);

    let plan = round
        .coordinator
        .solicit(&job, &proposal, soon(), || false)
        .await;

    assert!(plan.is_empty());
    assert_eq!(plan.unmet_replicas, 2);
    assert_eq!(round.reserved_cpu(), 0.0);
    // Nodes were still asked; their answers just did not count.
    assert_eq!(round.client.solicitations_for(proposal.eval_id).len(), 3);
}
