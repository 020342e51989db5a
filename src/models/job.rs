use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    PartiallyRunning,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::PartiallyRunning => 1,
            JobState::Running => 2,
            JobState::Completed | JobState::Failed | JobState::Cancelled => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Transitions only move forward. Cancelled is reachable from any
    /// non-terminal state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::PartiallyRunning => write!(f, "partially_running"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Locality {
    /// Run on any node regardless of where the input data lives
    #[default]
    Anywhere,
    /// Only run on nodes that hold every input locally
    LocalOnly,
}

/// Which nodes a job is willing to land on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SelectionPolicy {
    pub locality: Locality,
    /// Allow placement of jobs that need network access
    pub accept_networked: bool,
    /// Refuse to schedule jobs with no inputs
    pub reject_stateless: bool,
    /// URL the node must have reported passing
    pub probe_http: Option<String>,
    /// Command the node must have reported passing
    pub probe_exec: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSource {
    /// Storage provider type, e.g. "ipfs", "s3", "urldownload"
    pub storage: String,
    /// Opaque reference into that storage (CID, URL, bucket key)
    pub reference: String,
}

impl InputSource {
    pub fn new(storage: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            storage: storage.into(),
            reference: reference.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentState {
    Active,
    Completed,
    Failed,
    /// Reservation returned to the node (cancellation or rollback)
    Released,
}

/// A committed placement of one replica on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub node_id: String,
    pub eval_id: Uuid,
    pub resources: Resources,
    pub state: AssignmentState,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    /// Desired replica count
    pub count: u32,
    /// Per-replica resource request
    pub resources: Resources,
    pub engine: String,
    pub publisher: String,
    pub inputs: Vec<InputSource>,
    /// Whether the workload needs network access
    pub network: bool,
    /// Free-form tags, used for list filtering
    pub labels: Vec<String>,
    /// Node label selectors, e.g. "region=eu-west" or "gpu"
    pub constraints: Vec<String>,
    pub selection: SelectionPolicy,
    /// Accept fewer than `count` replicas instead of retrying for the rest
    pub allow_partial: bool,
    pub negotiation_timeout: Option<Duration>,
    pub execution_timeout: Option<Duration>,
    pub state: JobState,
    pub assignments: Vec<Assignment>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Job {
    pub fn new(name: impl Into<String>, count: u32, resources: Resources) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            count,
            resources,
            engine: "docker".to_string(),
            publisher: "noop".to_string(),
            inputs: Vec::new(),
            network: false,
            labels: Vec::new(),
            constraints: Vec::new(),
            selection: SelectionPolicy::default(),
            allow_partial: false,
            negotiation_timeout: None,
            execution_timeout: None,
            state: JobState::Pending,
            assignments: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = publisher.into();
        self
    }

    pub fn with_input(mut self, input: InputSource) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn with_constraint(mut self, selector: impl Into<String>) -> Self {
        self.constraints.push(selector.into());
        self
    }

    pub fn with_selection(mut self, selection: SelectionPolicy) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_network(mut self, network: bool) -> Self {
        self.network = network;
        self
    }

    pub fn with_partial(mut self, allow_partial: bool) -> Self {
        self.allow_partial = allow_partial;
        self
    }

    pub fn is_stateless(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Assignments still holding a reservation on their node.
    pub fn active_assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments
            .iter()
            .filter(|a| a.state == AssignmentState::Active)
    }

    /// Replicas that are placed or already finished successfully.
    pub fn committed_replicas(&self) -> u32 {
        self.assignments
            .iter()
            .filter(|a| matches!(a.state, AssignmentState::Active | AssignmentState::Completed))
            .count() as u32
    }

    /// Replicas still to be placed.
    pub fn shortfall(&self) -> u32 {
        self.count.saturating_sub(self.committed_replicas())
    }

    /// Resources of the whole job across all replicas.
    pub fn total_resources(&self) -> Resources {
        self.resources.times(self.count)
    }
}
