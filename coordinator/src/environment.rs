//! Live cluster snapshot and scheduled task shapes.
//!
//! Everything here is fetched fresh on each tick and never persisted.

use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use clusterroll_common::{NodeName, Timestamp};

/// Cluster node state as reported by the cluster service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeLiveState {
    Up,
    Down,
    Paused,
    Joining,
    Other(String),
}

impl NodeLiveState {
    /// Parse the cluster service's string form.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            x if x.eq_ignore_ascii_case("Up") => NodeLiveState::Up,
            x if x.eq_ignore_ascii_case("Down") => NodeLiveState::Down,
            x if x.eq_ignore_ascii_case("Paused") => NodeLiveState::Paused,
            x if x.eq_ignore_ascii_case("Joining") => NodeLiveState::Joining,
            other => NodeLiveState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for NodeLiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeLiveState::Up => write!(f, "Up"),
            NodeLiveState::Down => write!(f, "Down"),
            NodeLiveState::Paused => write!(f, "Paused"),
            NodeLiveState::Joining => write!(f, "Joining"),
            NodeLiveState::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Drain status of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatusInfo {
    Normal,
    DrainInProgress,
    DrainCompleted,
    DrainFailed,
    Other(String),
}

impl NodeStatusInfo {
    /// Parse the cluster service's string form.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            x if x.eq_ignore_ascii_case("Normal") => NodeStatusInfo::Normal,
            x if x.eq_ignore_ascii_case("DrainInProgress") => NodeStatusInfo::DrainInProgress,
            x if x.eq_ignore_ascii_case("DrainCompleted") => NodeStatusInfo::DrainCompleted,
            x if x.eq_ignore_ascii_case("DrainFailed") => NodeStatusInfo::DrainFailed,
            other => NodeStatusInfo::Other(other.to_string()),
        }
    }
}

impl fmt::Display for NodeStatusInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatusInfo::Normal => write!(f, "Normal"),
            NodeStatusInfo::DrainInProgress => write!(f, "DrainInProgress"),
            NodeStatusInfo::DrainCompleted => write!(f, "DrainCompleted"),
            NodeStatusInfo::DrainFailed => write!(f, "DrainFailed"),
            NodeStatusInfo::Other(s) => write!(f, "{}", s),
        }
    }
}

/// One row of the cluster node table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: NodeName,
    pub state: NodeLiveState,
    pub status: NodeStatusInfo,
}

impl NodeStatus {
    pub fn new(name: impl Into<NodeName>, state: NodeLiveState, status: NodeStatusInfo) -> Self {
        Self {
            name: name.into(),
            state,
            status,
        }
    }

    /// Up and not draining.
    pub fn is_healthy(&self) -> bool {
        self.state == NodeLiveState::Up && self.status == NodeStatusInfo::Normal
    }

    /// Matches an expected state/status pair.
    pub fn is(&self, state: &NodeLiveState, status: &NodeStatusInfo) -> bool {
        &self.state == state && &self.status == status
    }
}

/// A background storage job (resync, rebalance) still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageJob {
    pub name: String,
    pub state: String,
    pub percent_complete: u8,
}

/// How hard to drain a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainMode {
    /// Blocking drain, fails if a role refuses to move.
    Graceful,
    /// Blocking drain that forces stuck roles off the node.
    Forced,
}

/// The coordinator's cluster-wide scheduled task as read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTask {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub start_boundary: Option<Timestamp>,
}

/// When a task fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTrigger {
    /// Once at `start`, then every `interval` for `duration`.
    Repeating {
        start: Timestamp,
        interval: Duration,
        duration: Duration,
    },
    /// At every boot of the local machine.
    AtStartup,
}

/// A task to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub name: String,
    pub description: String,
    pub execute: String,
    pub arguments: Vec<String>,
    pub trigger: TaskTrigger,
    pub enabled: bool,
}

impl TaskDefinition {
    /// Arguments joined for a command line, quoting any that contain spaces.
    pub fn argument_line(&self) -> String {
        self.arguments
            .iter()
            .map(|arg| {
                if arg.contains(' ') {
                    format!("\"{}\"", arg)
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Everything the state machine looks at, gathered for the local node.
#[derive(Debug, Clone)]
pub struct Environment {
    /// The node running this tick.
    pub local_node: NodeName,
    /// Cluster node table.
    pub nodes: Vec<NodeStatus>,
    /// Storage jobs still running on the local node.
    pub storage_jobs: Vec<StorageJob>,
    /// Current owner of the quorum ("Cluster Group") resource group.
    pub quorum_owner: NodeName,
    /// Local node boot time.
    pub last_boot: Timestamp,
    /// Start boundary of the coordinator task's trigger.
    pub task_start_boundary: Option<Timestamp>,
}

impl Environment {
    /// Live status of the local node.
    pub fn local_status(&self) -> Option<&NodeStatus> {
        self.node(&self.local_node)
    }

    /// Live status of any node.
    pub fn node(&self, name: &NodeName) -> Option<&NodeStatus> {
        self.nodes.iter().find(|n| &n.name == name)
    }

    /// Check if the local node owns the quorum group.
    pub fn owns_quorum(&self) -> bool {
        self.quorum_owner == self.local_node
    }
}
