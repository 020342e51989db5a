use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::bidding::client::{BidRequest, BidResponse, NodeClient};
use crate::error::{FleetError, Result};

/// How a simulated node answers a bid request.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeBehavior {
    Accept,
    /// Accept after a delay
    AcceptAfter(Duration),
    Reject(String),
    /// Never answers
    Silent,
    /// Cannot be reached at all
    Unreachable,
}

/// In-process stand-in for a fleet of compute nodes. Used by the CLI's
/// simulation and by tests.
pub struct SimulatedNodeClient {
    default: NodeBehavior,
    behaviors: Mutex<HashMap<String, NodeBehavior>>,
    solicited: Mutex<Vec<BidRequest>>,
    rejected: Mutex<Vec<(String, Uuid)>>,
}

impl SimulatedNodeClient {
    pub fn new(default: NodeBehavior) -> Self {
        Self {
            default,
            behaviors: Mutex::new(HashMap::new()),
            solicited: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::new(NodeBehavior::Accept)
    }

    pub fn set_behavior(&self, node_id: impl Into<String>, behavior: NodeBehavior) {
        self.behaviors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id.into(), behavior);
    }

    fn behavior_for(&self, node_id: &str) -> NodeBehavior {
        self.behaviors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// Every bid request received so far, in arrival order.
    pub fn solicitations(&self) -> Vec<BidRequest> {
        self.solicited
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn solicitations_for(&self, eval_id: Uuid) -> Vec<BidRequest> {
        self.solicitations()
            .into_iter()
            .filter(|r| r.eval_id == eval_id)
            .collect()
    }

    /// `(node_id, eval_id)` pairs told their accepted bid lost.
    pub fn rejection_notices(&self) -> Vec<(String, Uuid)> {
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl NodeClient for SimulatedNodeClient {
    async fn ask_for_bid(&self, request: BidRequest) -> Result<BidResponse> {
        let behavior = self.behavior_for(&request.node_id);
        let node_id = request.node_id.clone();
        self.solicited
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        match behavior {
            NodeBehavior::Accept => Ok(BidResponse::Accepted),
            NodeBehavior::AcceptAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(BidResponse::Accepted)
            }
            NodeBehavior::Reject(reason) => Ok(BidResponse::Rejected(reason)),
            NodeBehavior::Silent => std::future::pending().await,
            NodeBehavior::Unreachable => Err(FleetError::NodeNotFound(node_id)),
        }
    }

    async fn notify_bid_rejected(&self, node_id: &str, eval_id: Uuid, _job_id: Uuid) {
        self.rejected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((node_id.to_string(), eval_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Resources;

    fn request(node: &str) -> BidRequest {
        BidRequest {
            eval_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            node_id: node.to_string(),
            resources: Resources::cpu(1.0),
            engine: "docker".to_string(),
            execution_timeout: None,
        }
    }

    #[tokio::test]
    async fn per_node_behavior_overrides_default() {
        let client = SimulatedNodeClient::accepting();
        client.set_behavior("b", NodeBehavior::Reject("busy".into()));

        assert_eq!(
            client.ask_for_bid(request("a")).await.unwrap(),
            BidResponse::Accepted
        );
        assert_eq!(
            client.ask_for_bid(request("b")).await.unwrap(),
            BidResponse::Rejected("busy".into())
        );
        assert_eq!(client.solicitations().len(), 2);
    }

    #[tokio::test]
    async fn unreachable_node_errors() {
        let client = SimulatedNodeClient::new(NodeBehavior::Unreachable);
        assert!(client.ask_for_bid(request("a")).await.is_err());
    }
}
