use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::models::Resources;

/// What a compute node reports about itself on every heartbeat.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub capacity: Resources,
    pub engines: BTreeSet<String>,
    pub publishers: BTreeSet<String>,
    pub storages: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
    /// Node is able to run jobs with network access
    pub networking: bool,
    /// Data references cached on the node
    pub local_data: BTreeSet<String>,
    /// Probe predicates the node reported passing
    pub passed_probes: BTreeSet<String>,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, capacity: Resources) -> Self {
        Self {
            id: id.into(),
            capacity,
            engines: BTreeSet::from(["docker".to_string()]),
            publishers: BTreeSet::from(["noop".to_string()]),
            storages: BTreeSet::new(),
            ..Default::default()
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engines.insert(engine.into());
        self
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publishers.insert(publisher.into());
        self
    }

    pub fn with_storage(mut self, storage: impl Into<String>) -> Self {
        self.storages.insert(storage.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_networking(mut self, networking: bool) -> Self {
        self.networking = networking;
        self
    }

    pub fn with_local_data(mut self, reference: impl Into<String>) -> Self {
        self.local_data.insert(reference.into());
        self
    }

    pub fn with_passed_probe(mut self, probe: impl Into<String>) -> Self {
        self.passed_probes.insert(probe.into());
        self
    }
}

/// Point-in-time view of a node as seen by the planner.
#[derive(Debug, Clone)]
pub struct NodeAdvertisement {
    pub info: NodeInfo,
    /// Effective total capacity (never below `reserved`)
    pub total: Resources,
    /// Sum of active assignments
    pub reserved: Resources,
    pub last_heartbeat: Instant,
    /// Heartbeat seen within the liveness threshold
    pub alive: bool,
}

impl NodeAdvertisement {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn available(&self) -> Resources {
        self.total.saturating_sub(&self.reserved)
    }
}
