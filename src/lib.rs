pub mod bidding;
pub mod broker;
pub mod config;
pub mod error;
pub mod jobstore;
pub mod models;
pub mod nodes;
pub mod random;
pub mod requester;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{FleetError, Result};
pub use requester::Requester;
