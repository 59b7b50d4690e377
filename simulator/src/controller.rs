//! Simulation controller.

use std::collections::BTreeMap;

use chrono::Duration;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use clusterroll_common::{now, NodeName, RestartState, StateBlob};
use clusterroll_coordinator::environment::{NodeLiveState, NodeStatusInfo};
use clusterroll_coordinator::memory::{ClusterEvent, Fault, MemoryCluster, MemoryNode};
use clusterroll_coordinator::{
    ControlPlane, Decision, Driver, TaskConfig, TaskDescriptionStore, TickOutcome,
};

use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, FaultType, Scenario, ScenarioStep};

type SimDriver = Driver<MemoryNode, MemoryNode, TaskDescriptionStore<MemoryNode>, MemoryNode>;
type SimControl = ControlPlane<MemoryNode, MemoryNode, TaskDescriptionStore<MemoryNode>>;

/// Controls the simulation.
pub struct SimulationController {
    /// Simulated cluster.
    cluster: MemoryCluster,
    /// Node names in order.
    names: Vec<NodeName>,
    /// Task configuration shared by every node.
    task: TaskConfig,
    /// Random number generator for tick order.
    rng: StdRng,
    /// Round limit for `RunUntilConverged`.
    max_rounds: u32,
    /// Simulation metrics.
    metrics: SimulationMetrics,
}

impl SimulationController {
    /// Create a cluster of `node_count` healthy nodes.
    pub fn new(node_count: usize, seed: Option<u64>, max_rounds: u32) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let names: Vec<NodeName> = (1..=node_count.max(1))
            .map(|i| NodeName::new(format!("HV{:02}", i)))
            .collect();

        info!("Initializing simulation with {} nodes", names.len());

        Self {
            cluster: MemoryCluster::new(names.clone(), now()),
            names,
            task: TaskConfig {
                resume_retry_delay: std::time::Duration::ZERO,
                ..TaskConfig::default()
            },
            rng,
            max_rounds,
            metrics: SimulationMetrics::new(),
        }
    }

    fn driver(&self, name: &NodeName) -> SimDriver {
        let handle = self.cluster.handle(name.clone());
        let store = TaskDescriptionStore::new(handle.clone(), self.task.name.clone());
        Driver::new(handle.clone(), handle.clone(), store, handle, self.task.clone())
    }

    /// Control plane as run by an operator on the first node.
    fn control(&self) -> SimControl {
        let handle = self.cluster.handle(self.names[0].clone());
        let store = TaskDescriptionStore::new(handle.clone(), self.task.name.clone());
        ControlPlane::new(handle.clone(), handle, store, self.task.clone())
    }

    fn node(&self, index: usize) -> NodeName {
        self.names[index % self.names.len()].clone()
    }

    /// Persisted blob, if the task exists.
    fn snapshot(&self) -> Option<StateBlob> {
        self.cluster
            .cluster_task()
            .and_then(|task| StateBlob::parse(&task.description).ok())
    }

    /// Run a scenario.
    pub async fn run_scenario(&mut self, scenario: Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        for step in &scenario.steps {
            self.execute_step(step).await?;
        }

        Ok(())
    }

    /// One minute of cluster time: reboots finish, then every live node
    /// ticks once in random order.
    pub async fn round(&mut self) -> anyhow::Result<()> {
        self.cluster.advance_clock(Duration::minutes(1));
        for name in self.cluster.rebooting_nodes() {
            self.metrics.record_boot();
            if let Err(e) = self.cluster.boot(&name, &self.task).await {
                warn!(node = %name, error = %e, "Resume at boot failed");
                self.metrics.record_error();
            }
        }

        let mut order = self.names.clone();
        order.shuffle(&mut self.rng);

        for name in order {
            if self.cluster.is_rebooting(&name) {
                continue;
            }
            let before = self.snapshot();
            let result = self.driver(&name).tick().await;
            let after = self.snapshot();

            if let Err(violation) = check_invariants(&name, before.as_ref(), after.as_ref()) {
                self.metrics.record_violation();
                return Err(anyhow::anyhow!(violation));
            }

            match result {
                Ok(report) => match report.outcome {
                    TickOutcome::Decided(
                        Decision::Advance { from, to, .. } | Decision::Record { from, to, .. },
                    ) => {
                        debug!(node = %name, from = %from, to = %to, "Transition");
                        self.metrics.record_transition();
                    }
                    TickOutcome::Decided(Decision::Wait(_)) => self.metrics.record_wait(),
                    TickOutcome::Decided(Decision::Cleanup) => self.metrics.record_cleanup(),
                    _ => self.metrics.record_idle(),
                },
                Err(e) => {
                    // Ticks after cleanup find no task; that is the end state.
                    if self.cluster.cluster_task().is_some() {
                        warn!(node = %name, error = %e, "Tick failed");
                        self.metrics.record_error();
                    }
                }
            }
        }

        self.metrics.record_round();
        Ok(())
    }

    /// Run rounds until the coordinator task has removed itself.
    pub async fn run_until_converged(&mut self) -> anyhow::Result<u32> {
        let mut rounds = 0;
        while self.cluster.cluster_task().is_some() {
            if rounds >= self.max_rounds {
                return Err(anyhow::anyhow!(
                    "Rollout did not converge within {} rounds",
                    self.max_rounds
                ));
            }
            self.round().await?;
            rounds += 1;
        }
        info!("Converged after {} rounds", rounds);
        Ok(rounds)
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Start { suspended } => {
                let at = self.cluster.clock();
                match self.control().start_at(*suspended, None, at).await {
                    Ok(blob) => info!("Rollout started for {} nodes", blob.len()),
                    Err(e) => {
                        info!(error = %e, "Start refused");
                        self.metrics.record_refused_start();
                    }
                }
            }
            ScenarioStep::Rounds { count } => {
                for _ in 0..*count {
                    self.round().await?;
                }
            }
            ScenarioStep::RunUntilConverged => {
                self.run_until_converged().await?;
            }
            ScenarioStep::InjectFault { fault } => {
                info!("Injecting fault {:?}", fault);
                self.inject(fault);
            }
            ScenarioStep::ClearFault => {
                info!("Clearing faults");
                self.cluster.clear_faults();
                self.cluster.clear_storage_jobs();
                self.cluster.set_resync_rounds(None);
                for name in &self.names {
                    self.cluster.set_script_present(name, true);
                    if !self.cluster.is_rebooting(name) {
                        self.cluster
                            .set_node_state(name, NodeLiveState::Up, NodeStatusInfo::Normal);
                    }
                }
            }
            ScenarioStep::Suspend => self.control().suspend().await?,
            ScenarioStep::Resume => self.control().resume().await?,
            ScenarioStep::Assert { condition } => {
                self.check(condition).await?;
                info!("Assertion held: {:?}", condition);
            }
        }

        Ok(())
    }

    fn inject(&self, fault: &FaultType) {
        match fault {
            FaultType::FlakyDrain { times } => self.cluster.inject(Fault::Drain, *times),
            FaultType::ClusterApiOutage { times } => self.cluster.inject(Fault::ReadNodes, *times),
            FaultType::StorageJob { node, rounds } => {
                self.cluster
                    .add_storage_job(&self.node(*node), "Repair", *rounds)
            }
            FaultType::Resync { rounds } => self.cluster.set_resync_rounds(Some(*rounds)),
            FaultType::NodeDown { node } => self.cluster.set_node_state(
                &self.node(*node),
                NodeLiveState::Down,
                NodeStatusInfo::Normal,
            ),
            FaultType::MissingScript { node } => {
                self.cluster.set_script_present(&self.node(*node), false)
            }
        }
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        let events = self.cluster.events();
        match condition {
            AssertCondition::TaskRegistered(expected) => {
                let registered = self.cluster.cluster_task().is_some();
                anyhow::ensure!(
                    registered == *expected,
                    "Expected task registered = {}, found {}",
                    expected,
                    registered
                );
            }
            AssertCondition::Phase(expected) => {
                let phase = self.control().status().await?.phase;
                anyhow::ensure!(
                    phase == *expected,
                    "Expected phase {:?}, found {:?}",
                    expected,
                    phase
                );
            }
            AssertCondition::NodeState { node, state } => {
                let name = self.node(*node);
                let actual = self.snapshot().and_then(|blob| blob.state_of(&name));
                anyhow::ensure!(
                    actual == Some(*state),
                    "Expected {} in state {}, found {:?}",
                    name,
                    state,
                    actual
                );
            }
            AssertCondition::EveryNodeRebootedOnce => {
                let mut restarts: BTreeMap<NodeName, u32> =
                    self.names.iter().map(|n| (n.clone(), 0)).collect();
                for event in &events {
                    if let ClusterEvent::Restarted(name) = event {
                        *restarts.entry(name.clone()).or_default() += 1;
                    }
                }
                if let Some((name, count)) = restarts.iter().find(|(_, count)| **count != 1) {
                    anyhow::bail!("{} restarted {} times", name, count);
                }
            }
            AssertCondition::CleanedUpByQuorumOwner => {
                let removals: Vec<&NodeName> = events
                    .iter()
                    .filter_map(|e| match e {
                        ClusterEvent::TaskUnregistered { by, .. } => Some(by),
                        _ => None,
                    })
                    .collect();
                let owner = self.cluster.quorum_owner();
                anyhow::ensure!(
                    removals == vec![&owner],
                    "Expected one removal by {}, found {:?}",
                    owner,
                    removals
                );
            }
        }
        Ok(())
    }

    /// Get simulation metrics.
    pub fn get_metrics(&self) -> SimulationMetrics {
        self.metrics.clone()
    }
}

/// Check what a single tick on `node` did to the persisted blob.
///
/// Only `node`'s own entry may change, by exactly one step forward.
fn check_invariants(
    node: &NodeName,
    before: Option<&StateBlob>,
    after: Option<&StateBlob>,
) -> Result<(), String> {
    let (before, after) = match (before, after) {
        (Some(b), Some(a)) => (b, a),
        _ => return Ok(()),
    };

    for entry in after.entries() {
        let old = before.state_of(&entry.name).unwrap_or(RestartState::Pending);
        if old == entry.state {
            continue;
        }
        if &entry.name != node {
            return Err(format!(
                "{} changed the entry of {} ({} -> {})",
                node, entry.name, old, entry.state
            ));
        }
        if old.next() != Some(entry.state) {
            return Err(format!(
                "{} moved from {} to {}",
                entry.name, old, entry.state
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariants_reject_foreign_write() {
        let before = StateBlob::new(["A", "B"]).unwrap();
        let mut after = before.clone();
        after
            .advance(&NodeName::new("B"), RestartState::Paused)
            .unwrap();

        assert!(check_invariants(&NodeName::new("B"), Some(&before), Some(&after)).is_ok());
        assert!(check_invariants(&NodeName::new("A"), Some(&before), Some(&after)).is_err());
    }

    #[test]
    fn test_invariants_reject_skipped_state() {
        let before = StateBlob::new(["A"]).unwrap();
        let after = StateBlob::parse(r#"[{"Name":"A","State":"ReadyToRestart"}]"#).unwrap();
        assert!(check_invariants(&NodeName::new("A"), Some(&before), Some(&after)).is_err());
    }

    #[tokio::test]
    async fn test_every_scenario_converges() {
        for name in Scenario::NAMES {
            let mut controller = SimulationController::new(3, Some(7), 500);
            controller
                .run_scenario(Scenario::load(name).unwrap())
                .await
                .unwrap_or_else(|e| panic!("scenario {} failed: {:#}", name, e));

            let metrics = controller.get_metrics();
            assert_eq!(metrics.invariant_violations, 0);
            assert_eq!(metrics.reboots, 3);
            assert_eq!(metrics.cleanups, 1);
        }
    }

    #[tokio::test]
    async fn test_single_node_cluster() {
        let mut controller = SimulationController::new(1, Some(1), 50);
        controller
            .run_scenario(Scenario::load("rolling-restart").unwrap())
            .await
            .unwrap();
        assert!(controller.cluster.cluster_task().is_none());
    }
}
