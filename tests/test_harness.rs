//! Test harness for scheduler integration tests.
//!
//! Builds a requester over an in-memory store and a simulated fleet, with
//! timeouts shrunk so end-to-end scenarios settle in well under a second.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fleet_scheduler::bidding::SimulatedNodeClient;
use fleet_scheduler::broker::EvalBroker;
use fleet_scheduler::config::{BrokerConfig, RequesterConfig};
use fleet_scheduler::models::{Job, NodeInfo, Resources};
use fleet_scheduler::random::RandomSource;
use fleet_scheduler::store::MemoryStore;
use fleet_scheduler::Requester;

/// Requester configuration with shorter timeouts for faster tests
pub fn test_config() -> RequesterConfig {
    let mut config = RequesterConfig::default()
        .with_workers(2)
        .with_randomness_range(0)
        .with_negotiation_timeout(Duration::from_millis(300));
    config.broker.visibility_timeout = Duration::from_secs(2);
    config.broker.initial_retry_delay = Duration::from_millis(20);
    config.broker.subsequent_retry_delay = Duration::from_millis(100);
    config.broker.sweep_interval = Duration::from_millis(50);
    config.worker.dequeue_timeout = Duration::from_millis(100);
    config.worker.dequeue_base_backoff = Duration::from_millis(10);
    config.worker.dequeue_max_backoff = Duration::from_millis(50);
    config.scheduler.housekeeping_interval = Duration::from_millis(200);
    config
}

/// Broker with a seeded randomness source over the given store
pub fn test_broker(config: BrokerConfig, store: Arc<MemoryStore>) -> EvalBroker {
    EvalBroker::new(config, 0, store, Arc::new(RandomSource::seeded(7)))
}

pub fn cpu(cores: f64) -> Resources {
    Resources::cpu(cores)
}

/// Handle to a requester plus its simulated fleet
pub struct TestFleet {
    pub requester: Arc<Requester>,
    pub client: Arc<SimulatedNodeClient>,
    pub store: Arc<MemoryStore>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TestFleet {
    pub fn new(config: RequesterConfig) -> Self {
        Self::with_client(config, Arc::new(SimulatedNodeClient::accepting()))
    }

    pub fn with_client(config: RequesterConfig, client: Arc<SimulatedNodeClient>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let requester = Requester::new(
            config,
            store.clone(),
            client.clone(),
            Arc::new(RandomSource::seeded(42)),
        )
        .expect("test config is valid");
        Self {
            requester: Arc::new(requester),
            client,
            store,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    /// Register `count` identical nodes named `node-1..=node-count`
    pub async fn add_nodes(&self, count: usize, capacity: Resources) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for i in 1..=count {
            let id = format!("node-{i}");
            self.requester
                .node_heartbeat(NodeInfo::new(id.clone(), capacity))
                .await
                .expect("heartbeat accepted");
            ids.push(id);
        }
        ids
    }

    pub async fn submit(&self, job: Job) -> Uuid {
        self.requester.submit_job(job).await.expect("job accepted")
    }

    /// Start the worker pool, sweeper and housekeeping in the background
    pub fn start(&mut self) {
        let requester = self.requester.clone();
        let shutdown = self.shutdown.clone();
        self.handle = Some(tokio::spawn(async move { requester.run(shutdown).await }));
    }

    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("requester drained in time")
                .expect("requester task did not panic");
        }
    }

    pub fn job(&self, id: Uuid) -> Job {
        self.requester.get_job(id).expect("job exists")
    }

    /// Sum of reservations across the fleet
    pub fn reserved(&self) -> Resources {
        self.requester
            .nodes()
            .iter()
            .fold(Resources::default(), |acc, n| acc.add(&n.reserved))
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
