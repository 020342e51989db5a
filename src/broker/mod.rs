//! Evaluation broker: the durable work queue feeding the scheduling workers.
//!
//! - **Ordering**: total order by `(priority, create_index)`; lower priority
//!   values dequeue first, FIFO within a priority
//! - **Delivery**: at-least-once. A dequeued evaluation is hidden for the
//!   visibility timeout; [`EvalBroker::sweep`] reclaims it if the worker never
//!   acks or nacks
//! - **Retry**: nack requeues with `min(base * 2^(n-1), max)` backoff plus
//!   jitter, until the retry budget is spent and the evaluation fails
//! - **Idempotence**: an enqueue equivalent to a pending evaluation (same job,
//!   same trigger) is dropped
//!
//! # Delivery receipts
//!
//! Each dequeue issues a fresh receipt. Ack and nack must present it, so a
//! worker that stalled past its visibility deadline cannot settle a later
//! redelivery of the same evaluation.

pub mod backoff;
pub mod eval_broker;

pub use eval_broker::{BrokerStats, EnqueueOutcome, EvalBroker, NackOutcome, SweepOutcome};
