//! Bidding: solicit the planner's candidates, then commit winners.
//!
//! Every candidate is asked concurrently and the round waits for all
//! answers or the negotiation deadline, whichever comes first. Accepted
//! bids are then taken in rank order; each winner's capacity is reserved
//! with a compare-and-commit against the node directory, and a bid that
//! loses that race falls through to the next accepted candidate.

pub mod client;
pub mod coordinator;
pub mod simulated;

pub use client::{BidRequest, BidResponse, NodeClient};
pub use coordinator::BiddingCoordinator;
pub use simulated::{NodeBehavior, SimulatedNodeClient};
