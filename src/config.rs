use std::time::Duration;

use crate::error::{FleetError, Result};
use crate::models::{ResourceLimits, Resources};

/// Evaluation broker delivery and retry settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a dequeued evaluation stays hidden before it is presumed abandoned
    pub visibility_timeout: Duration,
    /// Backoff after the first failed delivery
    pub initial_retry_delay: Duration,
    /// Upper bound on retry backoff
    pub subsequent_retry_delay: Duration,
    /// Deliveries allowed past the first before the evaluation fails
    pub max_retry_count: u32,
    /// How often expired deliveries are reclaimed
    pub sweep_interval: Duration,
    /// How long terminal evaluations are kept in the store
    pub retention: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            initial_retry_delay: Duration::from_secs(1),
            subsequent_retry_delay: Duration::from_secs(30),
            max_retry_count: 10,
            sweep_interval: Duration::from_secs(1),
            retention: Duration::from_secs(600),
        }
    }
}

/// Scheduling worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// Longest a worker blocks on an empty queue before looping
    pub dequeue_timeout: Duration,
    /// Backoff bounds after a failed dequeue (broker unavailable)
    pub dequeue_base_backoff: Duration,
    pub dequeue_max_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            dequeue_timeout: Duration::from_secs(5),
            dequeue_base_backoff: Duration::from_secs(1),
            dequeue_max_backoff: Duration::from_secs(30),
        }
    }
}

/// Planner and ranking settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Nodes solicited per desired replica
    pub over_ask_factor: u32,
    /// Bounded randomness applied to node ranks and retry jitter
    pub node_rank_randomness_range: u32,
    /// Nodes without a heartbeat for this long are not ranked
    pub node_liveness_threshold: Duration,
    /// Period of the rescan and evaluation GC loop
    pub housekeeping_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            over_ask_factor: 3,
            node_rank_randomness_range: 5,
            node_liveness_threshold: Duration::from_secs(30),
            housekeeping_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobTimeoutConfig {
    /// Longest a bidding round may wait for node responses
    pub negotiation_timeout: Duration,
    pub min_execution_timeout: Duration,
    /// `None` means no upper bound
    pub max_execution_timeout: Option<Duration>,
    pub default_execution_timeout: Duration,
}

impl Default for JobTimeoutConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(180),
            min_execution_timeout: Duration::from_millis(500),
            max_execution_timeout: None,
            default_execution_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapacityConfig {
    /// Cluster-wide ceiling on what a single job may request in total
    pub total_limits: ResourceLimits,
    /// Ceiling on a single replica's request
    pub job_limits: ResourceLimits,
    /// Ceiling on the summed unmet demand of all queued jobs
    pub queue_limits: ResourceLimits,
    /// Applied when a job requests no resources at all
    pub default_job_resources: Resources,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            total_limits: ResourceLimits::unbounded(),
            job_limits: ResourceLimits::unbounded(),
            queue_limits: ResourceLimits::unbounded(),
            default_job_resources: Resources::new(0.1, 100 * 1024 * 1024, 0, 0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequesterConfig {
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub timeouts: JobTimeoutConfig,
    pub capacity: CapacityConfig,
    /// Tags hidden from job listings unless explicitly requested
    pub default_excluded_tags: Vec<String>,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            timeouts: JobTimeoutConfig::default(),
            capacity: CapacityConfig::default(),
            default_excluded_tags: vec!["canary".to_string()],
        }
    }
}

impl RequesterConfig {
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker.worker_count = worker_count;
        self
    }

    pub fn with_over_ask(mut self, factor: u32) -> Self {
        self.scheduler.over_ask_factor = factor;
        self
    }

    pub fn with_randomness_range(mut self, range: u32) -> Self {
        self.scheduler.node_rank_randomness_range = range;
        self
    }

    pub fn with_max_retries(mut self, max_retry_count: u32) -> Self {
        self.broker.max_retry_count = max_retry_count;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.negotiation_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.worker_count == 0 {
            return Err(FleetError::Config("worker count must be at least 1".into()));
        }
        if self.scheduler.over_ask_factor == 0 {
            return Err(FleetError::Config(
                "over-ask factor must be at least 1".into(),
            ));
        }
        if self.broker.initial_retry_delay > self.broker.subsequent_retry_delay {
            return Err(FleetError::Config(
                "initial retry delay exceeds subsequent retry delay".into(),
            ));
        }
        if self.worker.dequeue_base_backoff > self.worker.dequeue_max_backoff {
            return Err(FleetError::Config(
                "dequeue base backoff exceeds max backoff".into(),
            ));
        }
        if self.broker.visibility_timeout.is_zero() {
            return Err(FleetError::Config(
                "visibility timeout must be non-zero".into(),
            ));
        }
        if let Some(max) = self.timeouts.max_execution_timeout {
            if self.timeouts.min_execution_timeout > max {
                return Err(FleetError::Config(
                    "min execution timeout exceeds max execution timeout".into(),
                ));
            }
        }
        Ok(())
    }
}
