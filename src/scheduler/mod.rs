//! Planner: from a job and a node snapshot to a ranked list of bid targets.
//!
//! 1. **Validate**: permanent failures (limits, contradictory policy,
//!    unparseable selectors or probes) are raised before touching nodes
//! 2. **Filter**: liveness, capabilities, label selectors, networking,
//!    locality, probes, then available capacity
//! 3. **Rank**: bin-packing fit score with a bounded random nudge for the
//!    top tier
//! 4. **Over-ask**: keep `over_ask_factor * shortfall` candidates

pub mod planner;
pub mod probe;
pub mod ranking;
pub mod selector;

pub use planner::{PlanProposal, Planner, RankedNode};
pub use probe::{AdvertisedProbes, Probe, ProbeChecker};
pub use ranking::NodeRejection;
pub use selector::LabelSelector;
