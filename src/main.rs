use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use fleet_scheduler::bidding::{NodeBehavior, SimulatedNodeClient};
use fleet_scheduler::config::RequesterConfig;
use fleet_scheduler::jobstore::ListOptions;
use fleet_scheduler::models::{parse_bytes, parse_cpu, Job, JobState, NodeInfo, Resources};
use fleet_scheduler::random::RandomSource;
use fleet_scheduler::shutdown::install_shutdown_handler;
use fleet_scheduler::store::MemoryStore;
use fleet_scheduler::Requester;

#[derive(Parser, Debug)]
#[command(name = "fleet-scheduler")]
#[command(version)]
#[command(about = "Evaluation broker and bidding scheduler for compute-over-data fleets")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Schedule jobs onto an in-process fleet of simulated nodes
    Simulate(SimulateArgs),
}

// =============================================================================
// Simulation Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of simulated compute nodes
    #[arg(long, default_value = "5")]
    nodes: usize,

    /// CPU per node (e.g. "4" or "1500m")
    #[arg(long, default_value = "4")]
    node_cpu: String,

    /// Memory per node (e.g. "8Gi")
    #[arg(long, default_value = "8Gi")]
    node_memory: String,

    /// Number of jobs to submit
    #[arg(long, default_value = "3")]
    jobs: usize,

    /// Replicas per job
    #[arg(long, default_value = "2")]
    replicas: u32,

    /// CPU per replica
    #[arg(long, default_value = "1")]
    job_cpu: String,

    /// Scheduling workers (defaults to available parallelism)
    #[arg(long)]
    workers: Option<usize>,

    /// Nodes solicited per desired replica
    #[arg(long, default_value = "3")]
    over_ask: u32,

    /// Seed for ranking and backoff randomness
    #[arg(long)]
    seed: Option<u64>,

    /// Every k-th node declines all bids (0 = none)
    #[arg(long, default_value = "0")]
    reject_every: usize,

    /// Give up after this many seconds
    #[arg(long, default_value = "30")]
    duration: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct PlacementOutput {
    job_id: String,
    name: String,
    state: String,
    desired: u32,
    placed: u32,
    nodes: Vec<String>,
}

#[derive(Serialize)]
struct NodeOutput {
    node_id: String,
    total: String,
    reserved: String,
}

#[derive(Serialize)]
struct SimulationOutput {
    jobs: Vec<PlacementOutput>,
    nodes: Vec<NodeOutput>,
}

// =============================================================================
// Simulation
// =============================================================================

fn is_settled(job: &Job) -> bool {
    job.state.is_terminal() || job.state == JobState::Running
}

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let node_capacity = Resources::new(
        parse_cpu(&args.node_cpu)?,
        parse_bytes(&args.node_memory)?,
        0,
        0,
    );
    let job_resources = Resources::cpu(parse_cpu(&args.job_cpu)?);

    let mut config = RequesterConfig::default().with_over_ask(args.over_ask);
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    let random = Arc::new(match args.seed {
        Some(seed) => RandomSource::seeded(seed),
        None => RandomSource::from_entropy(),
    });

    let client = Arc::new(SimulatedNodeClient::accepting());
    let requester = Arc::new(Requester::new(
        config,
        Arc::new(MemoryStore::new()),
        client.clone(),
        random,
    )?);

    for i in 1..=args.nodes {
        let node_id = format!("node-{i}");
        if args.reject_every > 0 && i % args.reject_every == 0 {
            client.set_behavior(
                node_id.clone(),
                NodeBehavior::Reject("simulated decline".to_string()),
            );
        }
        requester
            .node_heartbeat(NodeInfo::new(node_id, node_capacity))
            .await?;
    }

    let mut job_ids = Vec::with_capacity(args.jobs);
    for i in 1..=args.jobs {
        let job = Job::new(format!("job-{i}"), args.replicas, job_resources);
        job_ids.push(requester.submit_job(job).await?);
    }
    tracing::info!(nodes = args.nodes, jobs = job_ids.len(), "Simulation started");

    let shutdown = install_shutdown_handler();
    let runner = {
        let requester = requester.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { requester.run(shutdown).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration);
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!("Simulation duration elapsed before every job settled");
                break;
            }
            _ = poll.tick() => {
                let page = requester.list_jobs(&ListOptions::default())?;
                if page.jobs.iter().all(is_settled) {
                    break;
                }
            }
        }
    }
    shutdown.cancel();
    runner.await?;

    let jobs = requester.list_jobs(&ListOptions {
        include_excluded: true,
        ..ListOptions::default()
    })?;
    let output = SimulationOutput {
        jobs: jobs
            .jobs
            .iter()
            .map(|job| PlacementOutput {
                job_id: job.id.to_string(),
                name: job.name.clone(),
                state: job.state.to_string(),
                desired: job.count,
                placed: job.committed_replicas(),
                nodes: job
                    .active_assignments()
                    .map(|a| a.node_id.clone())
                    .collect(),
            })
            .collect(),
        nodes: requester
            .nodes()
            .iter()
            .map(|node| NodeOutput {
                node_id: node.info.id.clone(),
                total: node.total.to_string(),
                reserved: node.reserved.to_string(),
            })
            .collect(),
    };

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<38} {:<10} {:<18} {:<8} NODES",
                "JOB ID", "NAME", "STATE", "PLACED"
            );
            println!("{}", "-".repeat(90));
            for job in &output.jobs {
                println!(
                    "{:<38} {:<10} {:<18} {:<8} {}",
                    job.job_id,
                    job.name,
                    job.state,
                    format!("{}/{}", job.placed, job.desired),
                    job.nodes.join(",")
                );
            }
            println!();
            println!("{:<12} {:<32} RESERVED", "NODE", "TOTAL");
            println!("{}", "-".repeat(70));
            for node in &output.nodes {
                println!("{:<12} {:<32} {}", node.node_id, node.total, node.reserved);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Simulate(simulate_args) => run_simulation(simulate_args).await?,
    }
    Ok(())
}
