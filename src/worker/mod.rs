//! Scheduling workers.
//!
//! Each worker loops on dequeue, one scheduling attempt, then ack or nack:
//!
//! 1. [`EvalProcessor::process`] loads the job and snapshots the node directory
//! 2. The planner ranks eligible nodes and picks bid targets
//! 3. The bidding coordinator solicits them and reserves winners' capacity
//! 4. The plan is applied to the job store; the evaluation is acked if the
//!    job is satisfied (or partial placement is allowed), nacked otherwise
//!
//! Workers hold no lock across dequeue and ack. Recovery from a crashed
//! worker is purely time-based through the broker's visibility sweep, which
//! [`WorkerPool`] runs alongside the workers.

pub mod pool;
pub mod processor;

pub use pool::WorkerPool;
pub use processor::{Disposition, EvalProcessor};
