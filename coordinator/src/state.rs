//! Rollout-level state, as seen by an operator.

use serde::{Deserialize, Serialize};

use clusterroll_common::{NodeEntry, NodeName, Progress, StateBlob, Timestamp};

use crate::environment::ClusterTask;

/// Overall phase of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloutPhase {
    /// No coordinator task registered.
    NotStarted,
    /// Task registered but disabled.
    Suspended,
    /// Nodes still restarting.
    InProgress,
    /// Every node complete, waiting for the quorum owner to clean up.
    Converged,
}

/// Snapshot returned by the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutStatus {
    pub phase: RolloutPhase,
    pub task_enabled: Option<bool>,
    pub start_boundary: Option<Timestamp>,
    pub current_turn: Option<NodeName>,
    pub progress: Progress,
    pub nodes: Vec<NodeEntry>,
}

impl RolloutStatus {
    /// Nothing registered.
    pub fn not_started() -> Self {
        Self {
            phase: RolloutPhase::NotStarted,
            task_enabled: None,
            start_boundary: None,
            current_turn: None,
            progress: Progress::default(),
            nodes: Vec::new(),
        }
    }

    /// Build from the task and the blob it carries.
    pub fn from_parts(task: &ClusterTask, blob: &StateBlob) -> Self {
        let phase = if blob.all_complete() {
            RolloutPhase::Converged
        } else if !task.enabled {
            RolloutPhase::Suspended
        } else {
            RolloutPhase::InProgress
        };

        Self {
            phase,
            task_enabled: Some(task.enabled),
            start_boundary: task.start_boundary,
            current_turn: blob.current_turn().map(|e| e.name.clone()),
            progress: blob.progress(),
            nodes: blob.entries().to_vec(),
        }
    }
}
