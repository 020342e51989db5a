use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::backoff::retry_delay;
use crate::config::BrokerConfig;
use crate::error::{FleetError, Result};
use crate::models::{EvalStatus, Evaluation, TriggerKind};
use crate::random::RandomSource;
use crate::store::{KvStore, StoreError, Table};

const EVALUATIONS_TABLE: &str = "evaluations";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(Uuid),
    /// An equivalent pending evaluation already exists
    Duplicate(Uuid),
}

impl EnqueueOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { delay: Duration },
    /// Retry budget exhausted
    Failed,
}

/// An expired delivery reclaimed by [`EvalBroker::sweep`].
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub eval_id: Uuid,
    pub job_id: Uuid,
    pub outcome: NackOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub terminal: usize,
}

#[derive(Debug)]
struct Entry {
    eval: Evaluation,
    version: u64,
}

type ReadyKey = (u32, u64, Uuid);

#[derive(Debug, Default)]
struct BrokerState {
    /// Pending and in-flight evaluations
    active: HashMap<Uuid, Entry>,
    /// Pending and dequeue-able, ordered by (priority, create_index)
    ready: BTreeSet<ReadyKey>,
    /// Pending but backing off until the instant
    delayed: BTreeSet<(Instant, Uuid)>,
    /// Delivered, keyed by visibility deadline
    in_flight: BTreeSet<(Instant, Uuid)>,
    /// Dedup index over pending evaluations
    pending_keys: HashMap<(Uuid, TriggerKind), Uuid>,
    /// Terminal evaluations awaiting GC: (finished at, id, stored version)
    terminal: VecDeque<(Instant, Uuid, u64)>,
}

impl BrokerState {
    fn ready_key(eval: &Evaluation) -> ReadyKey {
        (eval.priority, eval.create_index, eval.id)
    }

    fn promote_delayed(&mut self, now: Instant) {
        while let Some(&(ready_at, id)) = self.delayed.iter().next() {
            if ready_at > now {
                break;
            }
            self.delayed.remove(&(ready_at, id));
            if let Some(entry) = self.active.get(&id) {
                self.ready.insert(Self::ready_key(&entry.eval));
            }
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.delayed.iter().next().map(|(at, _)| *at)
    }

    fn insert_pending(&mut self, entry: Entry, ready_at: Instant, now: Instant) {
        let id = entry.eval.id;
        self.pending_keys
            .entry(entry.eval.dedup_key())
            .or_insert(id);
        if ready_at <= now {
            self.ready.insert(Self::ready_key(&entry.eval));
        } else {
            self.delayed.insert((ready_at, id));
        }
        self.active.insert(id, entry);
    }

    fn forget_pending_key(&mut self, eval: &Evaluation) {
        let key = eval.dedup_key();
        if self.pending_keys.get(&key) == Some(&eval.id) {
            self.pending_keys.remove(&key);
        }
    }

    /// Remove a pending evaluation from every pending index.
    fn unlink_pending(&mut self, eval: &Evaluation) {
        self.ready.remove(&Self::ready_key(eval));
        self.delayed.retain(|(_, id)| *id != eval.id);
        self.forget_pending_key(eval);
    }

    fn unlink_in_flight(&mut self, id: Uuid) {
        self.in_flight.retain(|(_, eval_id)| *eval_id != id);
    }
}

/// Durable priority queue of evaluations with at-least-once delivery.
///
/// Every status change is written to the store with a compare-and-swap before
/// the in-memory indexes move, so a failed write leaves the broker exactly as
/// it was. In particular a failed ack leaves the evaluation claimed until the
/// visibility sweep reclaims it.
pub struct EvalBroker {
    config: BrokerConfig,
    /// Shared with node ranking: jitter is up to this many percent of the delay
    jitter_range: u32,
    table: Table<Evaluation>,
    random: Arc<RandomSource>,
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl EvalBroker {
    pub fn new(
        config: BrokerConfig,
        jitter_range: u32,
        store: Arc<dyn KvStore>,
        random: Arc<RandomSource>,
    ) -> Self {
        Self {
            config,
            jitter_range,
            table: Table::new(store, EVALUATIONS_TABLE),
            random,
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
        }
    }

    /// Reload non-terminal evaluations after a restart. Deliveries that were
    /// in flight when the previous process died become pending again.
    pub async fn restore(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut restored = 0;

        for (key, stored) in self.table.scan()? {
            let mut eval = stored.value;
            eval.create_index = stored.create_index;
            if state.active.contains_key(&eval.id) {
                continue;
            }
            if eval.status.is_terminal() {
                state.terminal.push_back((now, eval.id, stored.version));
                continue;
            }

            let mut version = stored.version;
            if eval.status == EvalStatus::InProgress {
                eval.status = EvalStatus::Pending;
                eval.receipt = None;
                eval.visibility_deadline = None;
                version = self.table.swap(&key, version, &eval)?;
            }

            let ready_at = eval
                .wait_until
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .map_or(now, |remaining| now + remaining);
            state.insert_pending(Entry { eval, version }, ready_at, now);
            restored += 1;
        }

        if restored > 0 {
            tracing::info!(restored, "Restored pending evaluations");
            self.notify.notify_waiters();
        }
        Ok(restored)
    }

    pub async fn enqueue(&self, mut eval: Evaluation) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.pending_keys.get(&eval.dedup_key()) {
            tracing::debug!(
                job_id = %eval.job_id,
                trigger = %eval.trigger,
                existing = %existing,
                "Duplicate evaluation suppressed"
            );
            return Ok(EnqueueOutcome::Duplicate(*existing));
        }

        eval.status = EvalStatus::Pending;
        eval.receipt = None;
        eval.visibility_deadline = None;
        eval.create_index = self.table.insert(&eval.id.to_string(), &eval)?;

        tracing::info!(
            eval_id = %eval.id,
            job_id = %eval.job_id,
            trigger = %eval.trigger,
            priority = eval.priority,
            "Evaluation enqueued"
        );
        let id = eval.id;
        let now = Instant::now();
        state.insert_pending(Entry { eval, version: 1 }, now, now);
        drop(state);

        self.notify.notify_waiters();
        Ok(EnqueueOutcome::Enqueued(id))
    }

    /// Block up to `wait` for a ready evaluation. An empty queue is not an
    /// error: it yields `Ok(None)` once the wait elapses.
    pub async fn dequeue(&self, wait: Duration) -> Result<Option<Evaluation>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if let Some(eval) = self.claim_next(&mut state, now)? {
                    return Ok(Some(eval));
                }
                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_ready_at()
                    .map_or(deadline, |ready_at| ready_at.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    fn claim_next(&self, state: &mut BrokerState, now: Instant) -> Result<Option<Evaluation>> {
        state.promote_delayed(now);
        let Some(&ready_key) = state.ready.iter().next() else {
            return Ok(None);
        };
        let id = ready_key.2;
        let Some(entry) = state.active.get(&id) else {
            state.ready.remove(&ready_key);
            return Ok(None);
        };

        let mut claimed = entry.eval.clone();
        claimed.status = EvalStatus::InProgress;
        claimed.delivery_count += 1;
        claimed.receipt = Some(Uuid::new_v4());
        claimed.wait_until = None;
        claimed.visibility_deadline = wall_clock_after(self.config.visibility_timeout);
        let version = self.table.swap(&id.to_string(), entry.version, &claimed)?;

        state.ready.remove(&ready_key);
        state.forget_pending_key(&claimed);
        state
            .in_flight
            .insert((now + self.config.visibility_timeout, id));
        state.active.insert(
            id,
            Entry {
                eval: claimed.clone(),
                version,
            },
        );

        tracing::debug!(
            eval_id = %id,
            job_id = %claimed.job_id,
            delivery = claimed.delivery_count,
            "Evaluation dequeued"
        );
        Ok(Some(claimed))
    }

    fn claimed_entry<'a>(
        state: &'a BrokerState,
        eval_id: Uuid,
        receipt: Uuid,
    ) -> Result<&'a Entry> {
        let entry = state
            .active
            .get(&eval_id)
            .ok_or(FleetError::EvaluationNotFound(eval_id))?;
        if entry.eval.status != EvalStatus::InProgress || entry.eval.receipt != Some(receipt) {
            return Err(FleetError::StaleDelivery(eval_id));
        }
        Ok(entry)
    }

    pub async fn ack(&self, eval_id: Uuid, receipt: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = Self::claimed_entry(&state, eval_id, receipt)?;

        let mut done = entry.eval.clone();
        done.status = EvalStatus::Complete;
        done.receipt = None;
        done.visibility_deadline = None;
        let version = self.table.swap(&eval_id.to_string(), entry.version, &done)?;

        state.unlink_in_flight(eval_id);
        state.active.remove(&eval_id);
        state.terminal.push_back((Instant::now(), eval_id, version));
        tracing::info!(eval_id = %eval_id, job_id = %done.job_id, "Evaluation acked");
        Ok(())
    }

    pub async fn nack(&self, eval_id: Uuid, receipt: Uuid) -> Result<NackOutcome> {
        let mut state = self.state.lock().await;
        Self::claimed_entry(&state, eval_id, receipt)?;
        let outcome = self.retry_or_fail(&mut state, eval_id, Instant::now())?;
        drop(state);

        if matches!(outcome, NackOutcome::Requeued { .. }) {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    /// Fail a delivered evaluation immediately without spending retry budget.
    pub async fn fail(&self, eval_id: Uuid, receipt: Uuid, reason: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::claimed_entry(&state, eval_id, receipt)?;
        self.finish_failed(&mut state, eval_id, reason.to_string())
    }

    fn retry_or_fail(
        &self,
        state: &mut BrokerState,
        eval_id: Uuid,
        now: Instant,
    ) -> Result<NackOutcome> {
        let entry = state
            .active
            .get(&eval_id)
            .ok_or(FleetError::EvaluationNotFound(eval_id))?;

        if entry.eval.delivery_count > self.config.max_retry_count {
            let reason = format!(
                "retry budget exhausted after {} deliveries",
                entry.eval.delivery_count
            );
            self.finish_failed(state, eval_id, reason)?;
            return Ok(NackOutcome::Failed);
        }

        let base = retry_delay(
            self.config.initial_retry_delay,
            self.config.subsequent_retry_delay,
            entry.eval.delivery_count,
        );
        let delay = self.random.jittered_delay(base, self.jitter_range);

        let mut retry = entry.eval.clone();
        retry.status = EvalStatus::Pending;
        retry.receipt = None;
        retry.visibility_deadline = None;
        retry.wait_until = wall_clock_after(delay);
        let version = self
            .table
            .swap(&eval_id.to_string(), entry.version, &retry)?;

        tracing::info!(
            eval_id = %eval_id,
            job_id = %retry.job_id,
            delivery = retry.delivery_count,
            delay_ms = delay.as_millis() as u64,
            "Evaluation requeued"
        );
        state.unlink_in_flight(eval_id);
        state.insert_pending(
            Entry {
                eval: retry,
                version,
            },
            now + delay,
            now,
        );
        Ok(NackOutcome::Requeued { delay })
    }

    fn finish_failed(&self, state: &mut BrokerState, eval_id: Uuid, reason: String) -> Result<()> {
        let entry = state
            .active
            .get(&eval_id)
            .ok_or(FleetError::EvaluationNotFound(eval_id))?;

        let mut failed = entry.eval.clone();
        failed.status = EvalStatus::Failed;
        failed.receipt = None;
        failed.visibility_deadline = None;
        failed.status_description = Some(reason);
        let version = self
            .table
            .swap(&eval_id.to_string(), entry.version, &failed)?;

        tracing::warn!(
            eval_id = %eval_id,
            job_id = %failed.job_id,
            reason = failed.status_description.as_deref().unwrap_or_default(),
            "Evaluation failed"
        );
        state.unlink_in_flight(eval_id);
        state.active.remove(&eval_id);
        state.terminal.push_back((Instant::now(), eval_id, version));
        Ok(())
    }

    /// Drop every pending evaluation of a job, except cancel-class ones.
    /// In-flight deliveries are left to their workers.
    pub async fn cancel(&self, job_id: Uuid) -> Result<usize> {
        let mut state = self.state.lock().await;
        let doomed: Vec<Uuid> = state
            .active
            .values()
            .filter(|e| {
                e.eval.job_id == job_id
                    && e.eval.status == EvalStatus::Pending
                    && e.eval.trigger != TriggerKind::JobCancelled
            })
            .map(|e| e.eval.id)
            .collect();

        let now = Instant::now();
        for id in &doomed {
            let Some(entry) = state.active.get(id) else {
                continue;
            };
            let mut cancelled = entry.eval.clone();
            cancelled.status = EvalStatus::Cancelled;
            cancelled.status_description = Some("job cancelled".to_string());
            let version = self.table.swap(&id.to_string(), entry.version, &cancelled)?;

            state.unlink_pending(&cancelled);
            state.active.remove(id);
            state.terminal.push_back((now, *id, version));
        }

        if !doomed.is_empty() {
            tracing::info!(job_id = %job_id, cancelled = doomed.len(), "Pending evaluations cancelled");
        }
        Ok(doomed.len())
    }

    /// Reclaim deliveries whose visibility deadline passed without an ack or
    /// nack, treating each as an implicit nack.
    pub async fn sweep(&self) -> Result<Vec<SweepOutcome>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired: Vec<Uuid> = state
            .in_flight
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|(_, id)| *id)
            .collect();

        let mut outcomes = Vec::with_capacity(expired.len());
        for eval_id in expired {
            let Some(job_id) = state.active.get(&eval_id).map(|e| e.eval.job_id) else {
                state.unlink_in_flight(eval_id);
                continue;
            };
            tracing::warn!(eval_id = %eval_id, job_id = %job_id, "Visibility timeout elapsed, reclaiming");
            let outcome = self.retry_or_fail(&mut state, eval_id, now)?;
            outcomes.push(SweepOutcome {
                eval_id,
                job_id,
                outcome,
            });
        }
        drop(state);

        if outcomes
            .iter()
            .any(|o| matches!(o.outcome, NackOutcome::Requeued { .. }))
        {
            self.notify.notify_waiters();
        }
        Ok(outcomes)
    }

    /// Delete terminal evaluations older than `retention` from the store.
    pub async fn gc(&self, retention: Duration) -> Result<usize> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut removed = 0;

        while let Some(&(finished_at, id, version)) = state.terminal.front() {
            if finished_at + retention > now {
                break;
            }
            match self.table.delete(&id.to_string(), version) {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            state.terminal.pop_front();
            removed += 1;
        }

        if removed > 0 {
            tracing::debug!(removed, "Terminal evaluations collected");
        }
        Ok(removed)
    }

    /// Whether the job has any other pending or in-flight evaluation.
    pub async fn has_outstanding(&self, job_id: Uuid, excluding: Uuid) -> bool {
        self.state
            .lock()
            .await
            .active
            .values()
            .any(|e| e.eval.job_id == job_id && e.eval.id != excluding)
    }

    /// Latest stored copy of an evaluation, terminal ones included until GC.
    pub fn get(&self, eval_id: Uuid) -> Result<Option<Evaluation>> {
        Ok(self.table.get(&eval_id.to_string())?.map(|stored| {
            let mut eval = stored.value;
            eval.create_index = stored.create_index;
            eval
        }))
    }

    /// Pending plus in-flight evaluations.
    pub async fn len(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> BrokerStats {
        let state = self.state.lock().await;
        BrokerStats {
            ready: state.ready.len(),
            delayed: state.delayed.len(),
            in_flight: state.in_flight.len(),
            terminal: state.terminal.len(),
        }
    }

    pub fn retention(&self) -> Duration {
        self.config.retention
    }
}

fn wall_clock_after(delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
}
