//! Integration tests for the planner.
//!
//! These tests validate that:
//! - The planner asks `min(over_ask * shortfall, eligible)` nodes
//! - Hard filters exclude incapable, mislabelled, full and dead nodes
//! - Only the shortfall is planned when a job is already partly placed
//! - Permanent problems surface as permanent errors before any filtering

mod test_harness;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use fleet_scheduler::config::{CapacityConfig, SchedulerConfig};
use fleet_scheduler::models::{
    Assignment, AssignmentState, Evaluation, InputSource, Job, Locality, NodeAdvertisement,
    NodeInfo, ResourceLimits, Resources, SelectionPolicy, TriggerKind,
};
use fleet_scheduler::nodes::NodeDirectory;
use fleet_scheduler::random::RandomSource;
use fleet_scheduler::scheduler::{AdvertisedProbes, Planner};
use fleet_scheduler::FleetError;
use test_harness::cpu;

fn planner(over_ask: u32, randomness: u32) -> Planner {
    planner_with_limits(over_ask, randomness, CapacityConfig::default())
}

fn planner_with_limits(over_ask: u32, randomness: u32, capacity: CapacityConfig) -> Planner {
    let config = SchedulerConfig {
        over_ask_factor: over_ask,
        node_rank_randomness_range: randomness,
        ..SchedulerConfig::default()
    };
    Planner::new(
        config,
        capacity,
        Arc::new(RandomSource::seeded(11)),
        Arc::new(AdvertisedProbes),
    )
}

fn fleet(nodes: Vec<NodeInfo>) -> Vec<NodeAdvertisement> {
    let directory = NodeDirectory::new(Duration::from_secs(30));
    for node in nodes {
        directory.upsert(node);
    }
    directory.snapshot()
}

fn uniform_fleet(count: usize, cores: f64) -> Vec<NodeAdvertisement> {
    fleet(
        (1..=count)
            .map(|i| NodeInfo::new(format!("node-{i}"), cpu(cores)))
            .collect(),
    )
}

fn eval_for(job: &Job) -> Evaluation {
    Evaluation::new(job.id, TriggerKind::JobRegistered)
}

fn candidate_ids(nodes: &[fleet_scheduler::scheduler::RankedNode]) -> Vec<String> {
    nodes.iter().map(|n| n.node_id.clone()).collect()
}

#[test]
fn test_over_ask_is_factor_times_replicas() {
    let job = Job::new("web", 2, cpu(1.0));
    let proposal = planner(3, 0)
        .plan(&job, &eval_for(&job), &uniform_fleet(10, 2.0))
        .unwrap();

    assert_eq!(proposal.desired, 2);
    assert_eq!(proposal.eligible, 10);
    assert_eq!(proposal.candidates.len(), 6);
    assert_eq!(proposal.unmet_replicas, 0);
}

#[test]
fn test_over_ask_is_capped_at_eligible_nodes() {
    let job = Job::new("web", 3, cpu(1.0));
    let proposal = planner(2, 0)
        .plan(&job, &eval_for(&job), &uniform_fleet(5, 1.0))
        .unwrap();

    assert_eq!(proposal.candidates.len(), 5);
    assert_eq!(proposal.unmet_replicas, 0);
}

#[test]
fn test_zero_eligible_nodes_leaves_every_replica_unmet() {
    let job = Job::new("big", 2, cpu(16.0));
    let proposal = planner(3, 0)
        .plan(&job, &eval_for(&job), &uniform_fleet(4, 2.0))
        .unwrap();

    assert!(proposal.is_empty());
    assert_eq!(proposal.eligible, 0);
    assert_eq!(proposal.unmet_replicas, 2);

    let empty = planner(3, 0).plan(&job, &eval_for(&job), &[]).unwrap();
    assert!(empty.is_empty());
    assert_eq!(empty.unmet_replicas, 2);
}

#[test]
fn test_fewer_eligible_than_replicas_reports_shortfall() {
    let job = Job::new("web", 4, cpu(1.0));
    let proposal = planner(3, 0)
        .plan(&job, &eval_for(&job), &uniform_fleet(3, 1.0))
        .unwrap();

    assert_eq!(proposal.candidates.len(), 3);
    assert_eq!(proposal.unmet_replicas, 1);
}

#[test]
fn test_hard_filters() {
    let nodes = fleet(vec![
        NodeInfo::new("good", cpu(4.0))
            .with_engine("wasm")
            .with_storage("ipfs")
            .with_label("region", "eu")
            .with_networking(true),
        NodeInfo::new("no-wasm", cpu(4.0))
            .with_storage("ipfs")
            .with_label("region", "eu")
            .with_networking(true),
        NodeInfo::new("no-storage", cpu(4.0))
            .with_engine("wasm")
            .with_label("region", "eu")
            .with_networking(true),
        NodeInfo::new("wrong-region", cpu(4.0))
            .with_engine("wasm")
            .with_storage("ipfs")
            .with_label("region", "us")
            .with_networking(true),
        NodeInfo::new("offline-net", cpu(4.0))
            .with_engine("wasm")
            .with_storage("ipfs")
            .with_label("region", "eu"),
        NodeInfo::new("too-small", cpu(0.5))
            .with_engine("wasm")
            .with_storage("ipfs")
            .with_label("region", "eu")
            .with_networking(true),
    ]);

    let job = Job::new("etl", 1, cpu(1.0))
        .with_engine("wasm")
        .with_input(InputSource::new("ipfs", "Qm123"))
        .with_constraint("region=eu")
        .with_network(true)
        .with_selection(SelectionPolicy {
            accept_networked: true,
            ..SelectionPolicy::default()
        });

    let proposal = planner(10, 0).plan(&job, &eval_for(&job), &nodes).unwrap();
    assert_eq!(candidate_ids(&proposal.candidates), vec!["good"]);
}

#[tokio::test(start_paused = true)]
async fn test_dead_nodes_are_not_ranked() {
    let directory = NodeDirectory::new(Duration::from_secs(30));
    directory.upsert(NodeInfo::new("stale", cpu(4.0)));
    tokio::time::advance(Duration::from_secs(31)).await;
    directory.upsert(NodeInfo::new("fresh", cpu(4.0)));

    let job = Job::new("web", 2, cpu(1.0));
    let proposal = planner(3, 0)
        .plan(&job, &eval_for(&job), &directory.snapshot())
        .unwrap();
    assert_eq!(candidate_ids(&proposal.candidates), vec!["fresh"]);
    assert_eq!(proposal.unmet_replicas, 1);
}

#[test]
fn test_local_only_requires_cached_inputs() {
    let nodes = fleet(vec![
        NodeInfo::new("cached", cpu(2.0))
            .with_storage("s3")
            .with_local_data("s3://bucket/data"),
        NodeInfo::new("remote", cpu(2.0)).with_storage("s3"),
    ]);
    let job = Job::new("scan", 1, cpu(1.0))
        .with_input(InputSource::new("s3", "s3://bucket/data"))
        .with_selection(SelectionPolicy {
            locality: Locality::LocalOnly,
            ..SelectionPolicy::default()
        });

    let proposal = planner(3, 0).plan(&job, &eval_for(&job), &nodes).unwrap();
    assert_eq!(candidate_ids(&proposal.candidates), vec!["cached"]);
}

#[test]
fn test_probes_filter_before_ranking() {
    let probe = "https://checks.internal/ready";
    let nodes = fleet(vec![
        NodeInfo::new("probed", cpu(8.0)).with_passed_probe(probe),
        // Tighter fit, would rank first without the probe.
        NodeInfo::new("unprobed", cpu(1.0)),
    ]);
    let job = Job::new("api", 1, cpu(1.0)).with_selection(SelectionPolicy {
        probe_http: Some(probe.to_string()),
        ..SelectionPolicy::default()
    });

    let proposal = planner(3, 0).plan(&job, &eval_for(&job), &nodes).unwrap();
    assert_eq!(candidate_ids(&proposal.candidates), vec!["probed"]);
}

#[test]
fn test_tighter_fit_ranks_first() {
    let nodes = fleet(vec![
        NodeInfo::new("roomy", cpu(16.0)),
        NodeInfo::new("snug", cpu(2.0)),
        NodeInfo::new("medium", cpu(4.0)),
    ]);
    let job = Job::new("web", 1, cpu(1.0));
    let proposal = planner(3, 0).plan(&job, &eval_for(&job), &nodes).unwrap();
    assert_eq!(
        candidate_ids(&proposal.candidates),
        vec!["snug", "medium", "roomy"]
    );
}

#[test]
fn test_randomness_spreads_ties() {
    let nodes = uniform_fleet(6, 4.0);
    let job = Job::new("web", 1, cpu(1.0));
    let planner = planner(1, 5);

    let firsts: HashSet<String> = (0..50)
        .map(|_| {
            planner.plan(&job, &eval_for(&job), &nodes).unwrap().candidates[0]
                .node_id
                .clone()
        })
        .collect();
    assert!(firsts.len() > 1, "identical nodes always ranked the same");
}

#[test]
fn test_only_the_shortfall_is_planned() {
    let mut job = Job::new("web", 3, cpu(1.0));
    job.assignments.push(Assignment {
        node_id: "node-1".to_string(),
        eval_id: Uuid::new_v4(),
        resources: cpu(1.0),
        state: AssignmentState::Active,
        assigned_at: Utc::now(),
    });

    let proposal = planner(1, 0)
        .plan(&job, &eval_for(&job), &uniform_fleet(5, 2.0))
        .unwrap();
    assert_eq!(proposal.desired, 2);
    assert_eq!(proposal.candidates.len(), 2);
    assert!(!candidate_ids(&proposal.candidates).contains(&"node-1".to_string()));
}

#[test]
fn test_fully_placed_job_plans_nothing() {
    let mut job = Job::new("web", 1, cpu(1.0));
    job.assignments.push(Assignment {
        node_id: "node-1".to_string(),
        eval_id: Uuid::new_v4(),
        resources: cpu(1.0),
        state: AssignmentState::Active,
        assigned_at: Utc::now(),
    });

    let proposal = planner(3, 0)
        .plan(&job, &eval_for(&job), &uniform_fleet(3, 2.0))
        .unwrap();
    assert_eq!(proposal.desired, 0);
    assert!(proposal.is_empty());
}

#[test]
fn test_permanent_failures() {
    let capacity = CapacityConfig {
        job_limits: ResourceLimits {
            cpu: Some(4.0),
            ..ResourceLimits::unbounded()
        },
        total_limits: ResourceLimits {
            cpu: Some(10.0),
            ..ResourceLimits::unbounded()
        },
        ..CapacityConfig::default()
    };
    let planner = planner_with_limits(3, 0, capacity);
    let nodes = uniform_fleet(3, 8.0);

    let cases = vec![
        Job::new("zero", 0, cpu(1.0)),
        Job::new("fat-replica", 1, cpu(5.0)),
        Job::new("fat-total", 3, cpu(4.0)),
        Job::new("bad-selector", 1, cpu(1.0)).with_constraint("tier in ()"),
        Job::new("net", 1, cpu(1.0)).with_network(true),
        Job::new("stateless", 1, cpu(1.0)).with_selection(SelectionPolicy {
            reject_stateless: true,
            ..SelectionPolicy::default()
        }),
        Job::new("bad-probe", 1, cpu(1.0)).with_selection(SelectionPolicy {
            probe_http: Some("ftp://nope".to_string()),
            ..SelectionPolicy::default()
        }),
    ];

    for job in cases {
        let err = planner.plan(&job, &eval_for(&job), &nodes).unwrap_err();
        assert!(err.is_permanent(), "{} should fail permanently: {err}", job.name);
    }

    let err = planner
        .plan(
            &Job::new("fat-total", 3, cpu(4.0)),
            &Evaluation::new(Uuid::new_v4(), TriggerKind::JobRegistered),
            &nodes,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        FleetError::ResourcesExceedLimits { limit: "total", .. }
    ));
}

#[test]
fn test_zero_request_fits_anywhere() {
    let job = Job::new("tiny", 1, Resources::default());
    let proposal = planner(3, 0)
        .plan(&job, &eval_for(&job), &uniform_fleet(2, 1.0))
        .unwrap();
    assert_eq!(proposal.candidates.len(), 2);
}
