use std::collections::HashSet;

use crate::models::{Job, Locality, NodeAdvertisement, Resources};
use crate::scheduler::probe::{Probe, ProbeChecker};
use crate::scheduler::selector::LabelSelector;

/// Why a node was filtered out before ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRejection {
    NotAlive,
    EngineUnsupported(String),
    PublisherUnsupported(String),
    StorageUnsupported(String),
    LabelMismatch(String),
    NoNetworking,
    DataNotLocal(String),
    ProbeFailed(String),
    InsufficientCapacity,
    AlreadyAssigned,
}

impl std::fmt::Display for NodeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRejection::NotAlive => write!(f, "node missed heartbeats"),
            NodeRejection::EngineUnsupported(e) => write!(f, "engine {e} not supported"),
            NodeRejection::PublisherUnsupported(p) => write!(f, "publisher {p} not supported"),
            NodeRejection::StorageUnsupported(s) => write!(f, "storage {s} not supported"),
            NodeRejection::LabelMismatch(sel) => write!(f, "selector {sel} not satisfied"),
            NodeRejection::NoNetworking => write!(f, "node does not run networked jobs"),
            NodeRejection::DataNotLocal(r) => write!(f, "input {r} not held locally"),
            NodeRejection::ProbeFailed(p) => write!(f, "probe {p} not passed"),
            NodeRejection::InsufficientCapacity => write!(f, "insufficient available capacity"),
            NodeRejection::AlreadyAssigned => write!(f, "already runs a replica of this job"),
        }
    }
}

/// Everything the hard filters need, parsed once per plan.
pub(crate) struct Filters<'a> {
    pub job: &'a Job,
    pub selectors: &'a [LabelSelector],
    pub probes: &'a [Probe],
    pub checker: &'a dyn ProbeChecker,
    pub occupied: &'a HashSet<String>,
}

impl Filters<'_> {
    /// Apply every hard constraint. Probes run last, right before capacity,
    /// so a probe never admits a node that other filters already refused.
    pub fn check(&self, node: &NodeAdvertisement) -> Result<(), NodeRejection> {
        let job = self.job;
        let info = &node.info;

        if !node.alive {
            return Err(NodeRejection::NotAlive);
        }
        if self.occupied.contains(&info.id) {
            return Err(NodeRejection::AlreadyAssigned);
        }
        if !info.engines.contains(&job.engine) {
            return Err(NodeRejection::EngineUnsupported(job.engine.clone()));
        }
        if !info.publishers.contains(&job.publisher) {
            return Err(NodeRejection::PublisherUnsupported(job.publisher.clone()));
        }
        if let Some(input) = job
            .inputs
            .iter()
            .find(|input| !info.storages.contains(&input.storage))
        {
            return Err(NodeRejection::StorageUnsupported(input.storage.clone()));
        }
        if let Some(selector) = self.selectors.iter().find(|s| !s.matches(&info.labels)) {
            return Err(NodeRejection::LabelMismatch(selector.to_string()));
        }
        if job.network && !info.networking {
            return Err(NodeRejection::NoNetworking);
        }
        if job.selection.locality == Locality::LocalOnly {
            if let Some(input) = job
                .inputs
                .iter()
                .find(|input| !info.local_data.contains(&input.reference))
            {
                return Err(NodeRejection::DataNotLocal(input.reference.clone()));
            }
        }
        if let Some(probe) = self
            .probes
            .iter()
            .find(|probe| !self.checker.admits(probe, job, node))
        {
            return Err(NodeRejection::ProbeFailed(probe.key().to_string()));
        }
        if !job.resources.fits_within(&node.available()) {
            return Err(NodeRejection::InsufficientCapacity);
        }
        Ok(())
    }
}

/// Bin-packing fit score in `[0, 100]`: the less headroom a node keeps after
/// placing `requested`, the higher it ranks. Only requested dimensions count.
pub fn fit_score(requested: &Resources, node: &NodeAdvertisement) -> u32 {
    let available = node.available();
    let total = node.total;

    let dims = [
        (requested.cpu, available.cpu, total.cpu),
        (
            requested.memory as f64,
            available.memory as f64,
            total.memory as f64,
        ),
        (
            requested.disk as f64,
            available.disk as f64,
            total.disk as f64,
        ),
        (requested.gpu as f64, available.gpu as f64, total.gpu as f64),
    ];

    let headrooms: Vec<f64> = dims
        .iter()
        .filter(|(req, _, total)| *req > 0.0 && *total > 0.0)
        .map(|(req, avail, total)| ((avail - req) / total).clamp(0.0, 1.0))
        .collect();

    if headrooms.is_empty() {
        return 0;
    }
    let mean = headrooms.iter().sum::<f64>() / headrooms.len() as f64;
    ((1.0 - mean) * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeInfo;
    use tokio::time::Instant;

    fn node(total: Resources, reserved: Resources) -> NodeAdvertisement {
        NodeAdvertisement {
            info: NodeInfo::new("n", total),
            total,
            reserved,
            last_heartbeat: Instant::now(),
            alive: true,
        }
    }

    #[test]
    fn tighter_fit_scores_higher() {
        let req = Resources::cpu(1.0);
        let roomy = node(Resources::cpu(8.0), Resources::default());
        let snug = node(Resources::cpu(2.0), Resources::default());
        let exact = node(Resources::cpu(2.0), Resources::cpu(1.0));

        assert!(fit_score(&req, &snug) > fit_score(&req, &roomy));
        assert_eq!(fit_score(&req, &exact), 100);
    }

    #[test]
    fn empty_request_scores_zero() {
        let n = node(Resources::cpu(4.0), Resources::default());
        assert_eq!(fit_score(&Resources::default(), &n), 0);
    }
}
