use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::Resources;

/// What a node is asked to commit to.
#[derive(Debug, Clone, PartialEq)]
pub struct BidRequest {
    pub eval_id: Uuid,
    pub job_id: Uuid,
    pub node_id: String,
    pub resources: Resources,
    pub engine: String,
    pub execution_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BidResponse {
    Accepted,
    Rejected(String),
}

/// Reaches compute nodes. The transport behind it is not the scheduler's
/// concern; an error means the node could not be asked at all.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn ask_for_bid(&self, request: BidRequest) -> Result<BidResponse>;

    /// Tell a node its accepted bid was not selected. Best effort.
    async fn notify_bid_rejected(&self, node_id: &str, eval_id: Uuid, job_id: Uuid);
}
