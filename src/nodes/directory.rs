use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{FleetError, Result};
use crate::models::{NodeAdvertisement, NodeInfo, Resources};

/// Result of ingesting a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeChange {
    Added,
    /// Total capacity grew along at least one dimension
    CapacityIncreased,
    /// Node was past the liveness threshold and is back
    Revived,
    Refreshed,
}

impl NodeChange {
    /// Whether previously unmet jobs deserve another look.
    pub fn triggers_rescan(&self) -> bool {
        !matches!(self, NodeChange::Refreshed)
    }
}

#[derive(Debug)]
struct SlotState {
    info: NodeInfo,
    total: Resources,
    reserved: Resources,
    last_heartbeat: Instant,
    /// False once deregistered. The slot lingers while reservations made
    /// before deregistration are still outstanding.
    registered: bool,
}

impl SlotState {
    fn advertisement(&self, liveness_threshold: Duration) -> NodeAdvertisement {
        NodeAdvertisement {
            info: self.info.clone(),
            total: self.total,
            reserved: self.reserved,
            last_heartbeat: self.last_heartbeat,
            alive: self.last_heartbeat.elapsed() < liveness_threshold,
        }
    }
}

/// Per-node reservation counters. The slot mutex is the compare-and-commit
/// point for that node only.
#[derive(Debug)]
struct NodeSlot {
    state: Mutex<SlotState>,
}

impl NodeSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // Counters are updated in one assignment each, so a poisoned slot is
        // still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Live view of every registered compute node.
///
/// Invariant: `reserved <= total` on every dimension of every node. The map
/// lock is only held to find a slot; reservations contend per node, never
/// across the whole fleet.
#[derive(Debug)]
pub struct NodeDirectory {
    nodes: RwLock<HashMap<String, Arc<NodeSlot>>>,
    liveness_threshold: Duration,
}

impl NodeDirectory {
    pub fn new(liveness_threshold: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            liveness_threshold,
        }
    }

    fn slot(&self, node_id: &str) -> Option<Arc<NodeSlot>> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .cloned()
    }

    /// Ingest a heartbeat, registering the node if it is new.
    ///
    /// A node coming back after deregistration keeps the reservations of
    /// assignments that never released.
    pub fn upsert(&self, info: NodeInfo) -> NodeChange {
        if let Some(slot) = self.slot(&info.id) {
            let mut state = slot.lock();
            if !state.registered {
                return rejoin(&mut state, info);
            }
            let was_alive = state.last_heartbeat.elapsed() < self.liveness_threshold;
            let previous_total = state.total;

            let total = clamp_to_reserved(&info, &state.reserved);
            state.total = total;
            state.info = info;
            state.last_heartbeat = Instant::now();

            return if !was_alive {
                tracing::info!(node_id = %state.info.id, "Node revived");
                NodeChange::Revived
            } else if total.any_greater_than(&previous_total) {
                tracing::info!(node_id = %state.info.id, capacity = %total, "Node capacity increased");
                NodeChange::CapacityIncreased
            } else {
                NodeChange::Refreshed
            };
        }

        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        // Another heartbeat for the same node may have raced us here.
        if let Some(slot) = nodes.get(&info.id) {
            let mut state = slot.lock();
            if !state.registered {
                return rejoin(&mut state, info);
            }
            state.total = clamp_to_reserved(&info, &state.reserved);
            state.info = info;
            state.last_heartbeat = Instant::now();
            return NodeChange::Refreshed;
        }

        tracing::info!(node_id = %info.id, capacity = %info.capacity, "Node registered");
        let node_id = info.id.clone();
        nodes.insert(
            node_id,
            Arc::new(NodeSlot {
                state: Mutex::new(SlotState {
                    total: info.capacity,
                    info,
                    reserved: Resources::default(),
                    last_heartbeat: Instant::now(),
                    registered: true,
                }),
            }),
        );
        NodeChange::Added
    }

    /// Remove a node from planning. If assignments on it still hold
    /// reservations the counters are kept until they are released, so the
    /// node cannot be handed out twice should it re-register.
    pub fn deregister(&self, node_id: &str) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = nodes.get(node_id).cloned() else {
            return Err(FleetError::NodeNotFound(node_id.to_string()));
        };
        let mut state = slot.lock();
        if !state.registered {
            return Err(FleetError::NodeNotFound(node_id.to_string()));
        }
        if state.reserved.is_zero() {
            drop(state);
            nodes.remove(node_id);
            tracing::info!(node_id, "Node deregistered");
        } else {
            state.registered = false;
            tracing::warn!(
                node_id,
                reserved = %state.reserved,
                "Node deregistered with reservations outstanding, keeping its counters"
            );
        }
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<NodeAdvertisement> {
        let slot = self.slot(node_id)?;
        let state = slot.lock();
        state
            .registered
            .then(|| state.advertisement(self.liveness_threshold))
    }

    /// Copy of every node, sorted by id. Reservations may move on as soon as
    /// this returns; the planner treats it as a hint, the reservation step is
    /// authoritative.
    pub fn snapshot(&self) -> Vec<NodeAdvertisement> {
        let slots: Vec<Arc<NodeSlot>> = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut nodes: Vec<NodeAdvertisement> = slots
            .iter()
            .filter_map(|slot| {
                let state = slot.lock();
                state
                    .registered
                    .then(|| state.advertisement(self.liveness_threshold))
            })
            .collect();
        nodes.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        nodes
    }

    /// Atomically reserve `resources` on a node if it still has headroom.
    ///
    /// Returns `Ok(false)` when a concurrent reservation got there first.
    pub fn try_reserve(&self, node_id: &str, resources: &Resources) -> Result<bool> {
        let slot = self
            .slot(node_id)
            .ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))?;
        let mut state = slot.lock();
        if !state.registered {
            return Err(FleetError::NodeNotFound(node_id.to_string()));
        }

        let after = state.reserved.add(resources);
        if !after.fits_within(&state.total) {
            tracing::debug!(
                node_id,
                reserved = %state.reserved,
                requested = %resources,
                "Reservation refused, node has no headroom"
            );
            return Ok(false);
        }
        state.reserved = after;
        tracing::debug!(node_id, reserved = %state.reserved, "Reservation committed");
        Ok(true)
    }

    /// Return reserved capacity to a node. A deregistered node is forgotten
    /// once its last reservation is returned.
    pub fn release(&self, node_id: &str, resources: &Resources) -> bool {
        let Some(slot) = self.slot(node_id) else {
            tracing::debug!(node_id, "Release for unknown node ignored");
            return false;
        };
        let retired = {
            let mut state = slot.lock();
            state.reserved = state.reserved.saturating_sub(resources);
            tracing::debug!(node_id, reserved = %state.reserved, "Reservation released");
            !state.registered && state.reserved.is_zero()
        };
        if retired {
            self.forget_if_drained(node_id);
        }
        true
    }

    fn forget_if_drained(&self, node_id: &str) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let drained = nodes.get(node_id).is_some_and(|slot| {
            let state = slot.lock();
            !state.registered && state.reserved.is_zero()
        });
        if drained {
            nodes.remove(node_id);
            tracing::info!(node_id, "Deregistered node drained");
        }
    }

    /// Ids of nodes past the liveness threshold.
    pub fn dead_nodes(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|n| !n.alive)
            .map(|n| n.info.id)
            .collect()
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|slot| slot.lock().registered)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn rejoin(state: &mut SlotState, info: NodeInfo) -> NodeChange {
    state.total = clamp_to_reserved(&info, &state.reserved);
    state.info = info;
    state.last_heartbeat = Instant::now();
    state.registered = true;
    tracing::info!(
        node_id = %state.info.id,
        reserved = %state.reserved,
        "Node re-registered with reservations still outstanding"
    );
    NodeChange::Added
}

fn clamp_to_reserved(info: &NodeInfo, reserved: &Resources) -> Resources {
    let total = info.capacity.max(reserved);
    if total != info.capacity {
        tracing::warn!(
            node_id = %info.id,
            advertised = %info.capacity,
            reserved = %reserved,
            "Advertised capacity below reservations, clamping"
        );
    }
    total
}
