//! Core records shared by every scheduling component.
//!
//! - [`Job`]: the client's request, owned by the job store
//! - [`Evaluation`]: a unit of scheduling work, owned by the broker
//! - [`NodeAdvertisement`]: a compute node's capacity and capabilities
//! - [`Bid`] and [`Plan`]: the ephemeral and committed results of a bidding round

pub mod evaluation;
pub mod job;
pub mod node;
pub mod plan;
pub mod resources;

pub use evaluation::{EvalStatus, Evaluation, TriggerKind, CANCEL_PRIORITY, DEFAULT_PRIORITY};
pub use job::{
    Assignment, AssignmentState, InputSource, Job, JobState, Locality, SelectionPolicy,
};
pub use node::{NodeAdvertisement, NodeInfo};
pub use plan::{Bid, BidOutcome, Plan, PlannedAssignment, RejectReason};
pub use resources::{parse_bytes, parse_cpu, ResourceLimits, Resources};
