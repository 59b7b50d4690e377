//! Error types for the rolling-restart coordinator.

use crate::{NodeName, RestartState};
use thiserror::Error;

/// Main error type for coordinator operations.
#[derive(Error, Debug)]
pub enum ClusterRollError {
    /// A cluster management call failed.
    #[error("Cluster API error: {0}")]
    ClusterApi(String),

    /// A scheduled task call failed.
    #[error("Task scheduler error: {0}")]
    TaskScheduler(String),

    /// A host call (boot time, restart) failed.
    #[error("Host control error: {0}")]
    HostControl(String),

    /// State could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Node absent from the state blob or the live node table.
    #[error("Node not found in state: {0}")]
    MissingNode(NodeName),

    /// The same node appears twice.
    #[error("Duplicate node entry: {0}")]
    DuplicateNode(NodeName),

    /// Unrecognized restart state string.
    #[error("Unknown restart state: {0:?}")]
    UnknownState(String),

    /// Coordinator task missing when it was expected.
    #[error("Scheduled task not found: {0}")]
    TaskNotFound(String),

    /// Coordinator task already registered.
    #[error("Scheduled task already exists: {0}")]
    TaskAlreadyExists(String),

    /// A node is not Up/Normal.
    #[error("Cluster unhealthy: node {node} is {state}/{status}")]
    ClusterUnhealthy {
        node: NodeName,
        state: String,
        status: String,
    },

    /// Coordinator executable not found on a node.
    #[error("Coordinator not present at {path} on node {node}")]
    ScriptMissing { node: NodeName, path: String },

    /// Invalid state transition.
    #[error("Invalid transition for {node} from {from} to {to}")]
    InvalidTransition {
        node: NodeName,
        from: RestartState,
        to: RestartState,
    },

    /// The stored state changed between read and write.
    #[error("State changed concurrently: {0}")]
    StaleState(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ClusterRollError {
    /// Check if this error clears up by itself on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterRollError::ClusterApi(_)
                | ClusterRollError::TaskScheduler(_)
                | ClusterRollError::HostControl(_)
                | ClusterRollError::Serialization(_)
                | ClusterRollError::Io(_)
                | ClusterRollError::StaleState(_)
        )
    }

    /// Get a stable error code for reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            ClusterRollError::ClusterApi(_) => "CLUSTER_API",
            ClusterRollError::TaskScheduler(_) => "TASK_SCHEDULER",
            ClusterRollError::HostControl(_) => "HOST_CONTROL",
            ClusterRollError::Serialization(_) => "SERIALIZATION",
            ClusterRollError::Io(_) => "IO",
            ClusterRollError::MissingNode(_) => "MISSING_NODE",
            ClusterRollError::DuplicateNode(_) => "DUPLICATE_NODE",
            ClusterRollError::UnknownState(_) => "UNKNOWN_STATE",
            ClusterRollError::TaskNotFound(_) => "TASK_NOT_FOUND",
            ClusterRollError::TaskAlreadyExists(_) => "TASK_ALREADY_EXISTS",
            ClusterRollError::ClusterUnhealthy { .. } => "CLUSTER_UNHEALTHY",
            ClusterRollError::ScriptMissing { .. } => "SCRIPT_MISSING",
            ClusterRollError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ClusterRollError::StaleState(_) => "STALE_STATE",
            ClusterRollError::Configuration(_) => "CONFIGURATION",
        }
    }
}

impl From<serde_json::Error> for ClusterRollError {
    fn from(e: serde_json::Error) -> Self {
        ClusterRollError::Serialization(e.to_string())
    }
}

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, ClusterRollError>;
