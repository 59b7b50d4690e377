//! Simulation scenarios.

use serde::{Deserialize, Serialize};

use clusterroll_common::RestartState;
use clusterroll_coordinator::RolloutPhase;

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Register the rollout through the control plane.
    Start { suspended: bool },
    /// Run a fixed number of rounds.
    Rounds { count: u32 },
    /// Run rounds until the coordinator task is gone.
    RunUntilConverged,
    /// Inject a fault.
    InjectFault { fault: FaultType },
    /// Clear every injected fault and restore node health.
    ClearFault,
    /// Disable the coordinator task.
    Suspend,
    /// Enable the coordinator task.
    Resume,
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Types of faults that can be injected. Nodes are addressed by index in
/// name order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FaultType {
    /// Graceful drains fail, the forced retry succeeds.
    FlakyDrain { times: u32 },
    /// Node table reads fail.
    ClusterApiOutage { times: u32 },
    /// A storage job runs on a node for a number of rounds.
    StorageJob { node: usize, rounds: u32 },
    /// Every resume starts a resync on all nodes.
    Resync { rounds: u32 },
    /// A node is down.
    NodeDown { node: usize },
    /// The coordinator executable is missing on a node.
    MissingScript { node: usize },
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// The coordinator task is (or is not) registered.
    TaskRegistered(bool),
    /// Rollout phase as reported by `status`.
    Phase(RolloutPhase),
    /// A node's persisted state.
    NodeState { node: usize, state: RestartState },
    /// Every node rebooted exactly once.
    EveryNodeRebootedOnce,
    /// The task was removed once, by the quorum owner.
    CleanedUpByQuorumOwner,
}

impl Scenario {
    /// Names accepted by `load`.
    pub const NAMES: [&'static str; 5] = [
        "rolling-restart",
        "storage-jobs",
        "flaky-drain",
        "degraded-start",
        "suspend-resume",
    ];

    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "rolling-restart" => Ok(Self::rolling_restart()),
            "storage-jobs" => Ok(Self::storage_jobs()),
            "flaky-drain" => Ok(Self::flaky_drain()),
            "degraded-start" => Ok(Self::degraded_start()),
            "suspend-resume" => Ok(Self::suspend_resume()),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    fn converged() -> Vec<ScenarioStep> {
        vec![
            ScenarioStep::RunUntilConverged,
            ScenarioStep::Assert {
                condition: AssertCondition::TaskRegistered(false),
            },
            ScenarioStep::Assert {
                condition: AssertCondition::EveryNodeRebootedOnce,
            },
            ScenarioStep::Assert {
                condition: AssertCondition::CleanedUpByQuorumOwner,
            },
        ]
    }

    /// Healthy cluster, no interference.
    fn rolling_restart() -> Self {
        let mut steps = vec![ScenarioStep::Start { suspended: false }];
        steps.extend(Self::converged());
        Self {
            name: "rolling-restart".to_string(),
            description: "Every node restarts in name order".to_string(),
            steps,
        }
    }

    /// Storage jobs hold nodes back.
    fn storage_jobs() -> Self {
        let mut steps = vec![
            ScenarioStep::InjectFault {
                fault: FaultType::Resync { rounds: 4 },
            },
            ScenarioStep::InjectFault {
                fault: FaultType::StorageJob { node: 0, rounds: 3 },
            },
            ScenarioStep::Start { suspended: false },
            ScenarioStep::Rounds { count: 2 },
            ScenarioStep::Assert {
                condition: AssertCondition::NodeState {
                    node: 0,
                    state: RestartState::Pending,
                },
            },
        ];
        steps.extend(Self::converged());
        Self {
            name: "storage-jobs".to_string(),
            description: "Drain and completion wait for storage jobs".to_string(),
            steps,
        }
    }

    /// Drains and API reads fail intermittently.
    fn flaky_drain() -> Self {
        let mut steps = vec![
            ScenarioStep::Start { suspended: false },
            ScenarioStep::InjectFault {
                fault: FaultType::FlakyDrain { times: 2 },
            },
            ScenarioStep::InjectFault {
                fault: FaultType::ClusterApiOutage { times: 3 },
            },
        ];
        steps.extend(Self::converged());
        Self {
            name: "flaky-drain".to_string(),
            description: "Forced drain retry and API outages".to_string(),
            steps,
        }
    }

    /// Start is refused until the cluster is healthy.
    fn degraded_start() -> Self {
        let mut steps = vec![
            ScenarioStep::InjectFault {
                fault: FaultType::NodeDown { node: 1 },
            },
            ScenarioStep::Start { suspended: false },
            ScenarioStep::Assert {
                condition: AssertCondition::TaskRegistered(false),
            },
            ScenarioStep::ClearFault,
            ScenarioStep::InjectFault {
                fault: FaultType::MissingScript { node: 0 },
            },
            ScenarioStep::Start { suspended: false },
            ScenarioStep::Assert {
                condition: AssertCondition::Phase(RolloutPhase::NotStarted),
            },
            ScenarioStep::ClearFault,
            ScenarioStep::Start { suspended: false },
        ];
        steps.extend(Self::converged());
        Self {
            name: "degraded-start".to_string(),
            description: "Start checks cluster health and script presence".to_string(),
            steps,
        }
    }

    /// Operator pauses the rollout mid-flight.
    fn suspend_resume() -> Self {
        let mut steps = vec![
            ScenarioStep::Start { suspended: true },
            ScenarioStep::Rounds { count: 3 },
            ScenarioStep::Assert {
                condition: AssertCondition::NodeState {
                    node: 0,
                    state: RestartState::Pending,
                },
            },
            ScenarioStep::Resume,
            ScenarioStep::Rounds { count: 2 },
            ScenarioStep::Suspend,
            ScenarioStep::Assert {
                condition: AssertCondition::Phase(RolloutPhase::Suspended),
            },
            ScenarioStep::Rounds { count: 10 },
            ScenarioStep::Assert {
                condition: AssertCondition::NodeState {
                    node: 0,
                    state: RestartState::ReadyToRestart,
                },
            },
            ScenarioStep::Resume,
        ];
        steps.extend(Self::converged());
        Self {
            name: "suspend-resume".to_string(),
            description: "Suspend freezes the rollout, resume continues it".to_string(),
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_named_scenario_loads() {
        for name in Scenario::NAMES {
            let scenario = Scenario::load(name).unwrap();
            assert_eq!(scenario.name, name);
            assert!(!scenario.steps.is_empty());
        }
        assert!(Scenario::load("bogus").is_err());
    }
}
