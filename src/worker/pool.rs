use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::backoff::retry_delay;
use crate::broker::{EvalBroker, NackOutcome};
use crate::config::WorkerConfig;
use crate::random::RandomSource;
use crate::worker::processor::EvalProcessor;

/// Fixed-size set of scheduling workers plus the visibility sweeper.
pub struct WorkerPool {
    processor: Arc<EvalProcessor>,
    broker: Arc<EvalBroker>,
    config: WorkerConfig,
    random: Arc<RandomSource>,
    sweep_interval: std::time::Duration,
}

impl WorkerPool {
    pub fn new(
        processor: Arc<EvalProcessor>,
        broker: Arc<EvalBroker>,
        config: WorkerConfig,
        random: Arc<RandomSource>,
        sweep_interval: std::time::Duration,
    ) -> Self {
        Self {
            processor,
            broker,
            config,
            random,
            sweep_interval,
        }
    }

    /// Spawn `worker_count` workers and one sweeper into `tasks`. Each exits
    /// once `shutdown` fires; a worker finishes its current evaluation first.
    pub fn spawn(&self, tasks: &mut JoinSet<()>, shutdown: CancellationToken) {
        for worker_id in 0..self.config.worker_count {
            let worker = Worker {
                id: worker_id,
                processor: self.processor.clone(),
                broker: self.broker.clone(),
                config: self.config.clone(),
                random: self.random.clone(),
            };
            let shutdown = shutdown.clone();
            tasks.spawn(async move { worker.run(shutdown).await });
        }

        let processor = self.processor.clone();
        let broker = self.broker.clone();
        let interval = self.sweep_interval;
        tasks.spawn(async move { sweeper_loop(broker, processor, interval, shutdown).await });

        tracing::info!(workers = self.config.worker_count, "Worker pool started");
    }
}

struct Worker {
    id: usize,
    processor: Arc<EvalProcessor>,
    broker: Arc<EvalBroker>,
    config: WorkerConfig,
    random: Arc<RandomSource>,
}

impl Worker {
    async fn run(self, shutdown: CancellationToken) {
        let mut consecutive_failures = 0u32;

        loop {
            let dequeued = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.broker.dequeue(self.config.dequeue_timeout) => result,
            };

            match dequeued {
                Ok(Some(eval)) => {
                    consecutive_failures = 0;
                    let eval_id = eval.id;
                    if let Err(e) = self.processor.process(eval).await {
                        tracing::warn!(
                            worker = self.id,
                            eval_id = %eval_id,
                            error = %e,
                            "Evaluation left claimed, sweep will reclaim it"
                        );
                    }
                }
                Ok(None) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let ceiling = retry_delay(
                        self.config.dequeue_base_backoff,
                        self.config.dequeue_max_backoff,
                        consecutive_failures,
                    );
                    let delay = self
                        .random
                        .duration_between(self.config.dequeue_base_backoff, ceiling);
                    tracing::warn!(
                        worker = self.id,
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        "Dequeue failed"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::debug!(worker = self.id, "Worker stopped");
    }
}

async fn sweeper_loop(
    broker: Arc<EvalBroker>,
    processor: Arc<EvalProcessor>,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let outcomes = match broker.sweep().await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                tracing::warn!(error = %e, "Visibility sweep failed");
                continue;
            }
        };
        for swept in outcomes {
            if swept.outcome == NackOutcome::Failed {
                processor.surface_exhausted(swept.job_id, swept.eval_id).await;
            }
            processor.record(swept.eval_id);
        }
    }
}
