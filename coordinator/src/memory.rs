//! In-memory cluster used by tests and the simulator.
//!
//! `MemoryCluster` holds the shared world: node table, simulated clock,
//! quorum group, the cluster-wide task and per-node local tasks.
//! `MemoryNode` is one node's view of it and implements every adapter trait
//! the way that node would see the real services.

use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use clusterroll_common::{ClusterRollError, NodeName, Result, Timestamp};

use crate::cluster::{ClusterApi, HostControl};
use crate::config::TaskConfig;
use crate::control::ControlPlane;
use crate::environment::{
    ClusterTask, DrainMode, NodeLiveState, NodeStatus, NodeStatusInfo, StorageJob,
    TaskDefinition, TaskTrigger,
};
use crate::scheduler::TaskScheduler;
use crate::store::TaskDescriptionStore;

/// Failure points that can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Graceful drain fails.
    Drain,
    /// Forced drain fails.
    ForcedDrain,
    /// Resume fails.
    Resume,
    /// Node table read fails.
    ReadNodes,
    /// Cluster task read fails, as while the cluster service starts.
    ReadTask,
    /// Task description update fails.
    WriteDescription,
    /// Restart fails.
    Restart,
}

/// Side effects recorded by the simulated services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Drained { node: NodeName, mode: DrainMode },
    Resumed(NodeName),
    Restarted(NodeName),
    Booted(NodeName),
    QuorumMoved { from: NodeName, to: NodeName },
    TaskRegistered { task: String, arguments: Vec<String> },
    TaskUnregistered { task: String, by: NodeName },
    TaskEnabled { task: String, enabled: bool },
    DescriptionWritten { by: NodeName },
    LocalTaskRegistered { node: NodeName, task: String },
    LocalTaskRemoved { node: NodeName, task: String },
}

#[derive(Debug, Clone)]
struct SimNode {
    state: NodeLiveState,
    status: NodeStatusInfo,
    last_boot: Timestamp,
    rebooting: bool,
    paused_before_reboot: bool,
    script_present: bool,
}

#[derive(Debug, Clone)]
struct SimJob {
    job: StorageJob,
    rounds_left: u32,
}

struct Inner {
    clock: RwLock<Timestamp>,
    nodes: DashMap<NodeName, SimNode>,
    storage_jobs: DashMap<NodeName, Vec<SimJob>>,
    quorum_owner: RwLock<NodeName>,
    cluster_task: RwLock<Option<ClusterTask>>,
    local_tasks: DashMap<(NodeName, String), TaskDefinition>,
    faults: DashMap<Fault, u32>,
    resync_rounds: RwLock<Option<u32>>,
    events: Mutex<Vec<ClusterEvent>>,
}

/// Shared simulated cluster.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl MemoryCluster {
    /// Create a healthy cluster of `names`, all booted a day before `clock`.
    /// The first node in name order owns the quorum group.
    pub fn new<I, N>(names: I, clock: Timestamp) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeName>,
    {
        let nodes = DashMap::new();
        let mut sorted: Vec<NodeName> = names.into_iter().map(Into::into).collect();
        sorted.sort();
        for name in &sorted {
            nodes.insert(
                name.clone(),
                SimNode {
                    state: NodeLiveState::Up,
                    status: NodeStatusInfo::Normal,
                    last_boot: clock - Duration::days(1),
                    rebooting: false,
                    paused_before_reboot: false,
                    script_present: true,
                },
            );
        }
        let owner = sorted
            .first()
            .cloned()
            .unwrap_or_else(|| NodeName::new(""));

        Self {
            inner: Arc::new(Inner {
                clock: RwLock::new(clock),
                nodes,
                storage_jobs: DashMap::new(),
                quorum_owner: RwLock::new(owner),
                cluster_task: RwLock::new(None),
                local_tasks: DashMap::new(),
                faults: DashMap::new(),
                resync_rounds: RwLock::new(None),
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    /// One node's view of the cluster.
    pub fn handle(&self, name: impl Into<NodeName>) -> MemoryNode {
        MemoryNode {
            cluster: self.clone(),
            name: name.into(),
        }
    }

    /// Node names in order.
    pub fn node_names(&self) -> Vec<NodeName> {
        let mut names: Vec<NodeName> = self.inner.nodes.iter().map(|n| n.key().clone()).collect();
        names.sort();
        names
    }

    /// Current simulated time.
    pub fn clock(&self) -> Timestamp {
        *self.inner.clock.read()
    }

    /// Move the clock forward and age storage jobs by one round.
    pub fn advance_clock(&self, by: Duration) {
        *self.inner.clock.write() += by;
        for mut jobs in self.inner.storage_jobs.iter_mut() {
            for job in jobs.iter_mut() {
                job.rounds_left = job.rounds_left.saturating_sub(1);
            }
            jobs.retain(|job| job.rounds_left > 0);
        }
    }

    /// Live status of a node.
    pub fn node_status(&self, name: &NodeName) -> Option<NodeStatus> {
        self.inner
            .nodes
            .get(name)
            .map(|n| NodeStatus::new(name.clone(), n.state.clone(), n.status.clone()))
    }

    /// Force a node's live state.
    pub fn set_node_state(&self, name: &NodeName, state: NodeLiveState, status: NodeStatusInfo) {
        if let Some(mut node) = self.inner.nodes.get_mut(name) {
            node.state = state;
            node.status = status;
        }
    }

    /// Check if a node is mid-reboot.
    pub fn is_rebooting(&self, name: &NodeName) -> bool {
        self.inner
            .nodes
            .get(name)
            .map(|n| n.rebooting)
            .unwrap_or(false)
    }

    /// Nodes currently mid-reboot.
    pub fn rebooting_nodes(&self) -> Vec<NodeName> {
        let mut names: Vec<NodeName> = self
            .inner
            .nodes
            .iter()
            .filter(|n| n.rebooting)
            .map(|n| n.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Finish a reboot: the node rejoins (still paused if it was) with a
    /// new boot time, then its at-startup tasks run the way `clusterroll`
    /// would run them with `task` as its configuration.
    pub async fn boot(&self, name: &NodeName, task: &TaskConfig) -> Result<()> {
        let clock = self.clock();
        {
            let mut node = match self.inner.nodes.get_mut(name) {
                Some(node) if node.rebooting => node,
                _ => return Ok(()),
            };
            node.rebooting = false;
            node.last_boot = clock;
            node.status = NodeStatusInfo::Normal;
            node.state = if node.paused_before_reboot {
                NodeLiveState::Paused
            } else {
                NodeLiveState::Up
            };
        }
        self.record(ClusterEvent::Booted(name.clone()));

        let startup: Vec<TaskDefinition> = self
            .inner
            .local_tasks
            .iter()
            .filter(|t| &t.key().0 == name && t.trigger == TaskTrigger::AtStartup)
            .map(|t| t.value().clone())
            .collect();
        let handle = self.handle(name.clone());
        for helper in startup {
            if !helper.arguments.iter().any(|arg| arg == "resume") {
                continue;
            }
            let control = ControlPlane::new(
                handle.clone(),
                handle.clone(),
                TaskDescriptionStore::new(handle.clone(), task.name.clone()),
                task.clone(),
            );
            if helper.arguments.iter().any(|arg| arg == "--at-boot") {
                control.resume_after_boot().await?;
            } else {
                control.resume().await?;
            }
        }
        Ok(())
    }

    /// Owner of the quorum group.
    pub fn quorum_owner(&self) -> NodeName {
        self.inner.quorum_owner.read().clone()
    }

    /// Move the quorum group.
    pub fn set_quorum_owner(&self, name: &NodeName) {
        *self.inner.quorum_owner.write() = name.clone();
    }

    /// Add a storage job on `node` that finishes after `rounds` clock steps.
    pub fn add_storage_job(&self, node: &NodeName, name: &str, rounds: u32) {
        self.inner.storage_jobs.entry(node.clone()).or_default().push(SimJob {
            job: StorageJob {
                name: name.to_string(),
                state: "Running".to_string(),
                percent_complete: 0,
            },
            rounds_left: rounds.max(1),
        });
    }

    /// Drop all storage jobs.
    pub fn clear_storage_jobs(&self) {
        self.inner.storage_jobs.clear();
    }

    /// When set, resuming a node starts a resync job on every node.
    pub fn set_resync_rounds(&self, rounds: Option<u32>) {
        *self.inner.resync_rounds.write() = rounds;
    }

    /// Make the next `times` calls at `fault` fail.
    pub fn inject(&self, fault: Fault, times: u32) {
        self.inner.faults.insert(fault, times);
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.inner.faults.clear();
    }

    /// Pretend the coordinator executable is missing on `node`.
    pub fn set_script_present(&self, name: &NodeName, present: bool) {
        if let Some(mut node) = self.inner.nodes.get_mut(name) {
            node.script_present = present;
        }
    }

    /// The cluster-wide task, if registered.
    pub fn cluster_task(&self) -> Option<ClusterTask> {
        self.inner.cluster_task.read().clone()
    }

    /// A local task registered on `node`.
    pub fn local_task(&self, node: &NodeName, name: &str) -> Option<TaskDefinition> {
        self.inner
            .local_tasks
            .get(&(node.clone(), name.to_string()))
            .map(|t| t.value().clone())
    }

    /// Names of local tasks registered on `node`.
    pub fn local_tasks(&self, node: &NodeName) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .local_tasks
            .iter()
            .filter(|t| &t.key().0 == node)
            .map(|t| t.key().1.clone())
            .collect();
        names.sort();
        names
    }

    /// Everything that happened so far.
    pub fn events(&self) -> Vec<ClusterEvent> {
        self.inner.events.lock().clone()
    }

    fn record(&self, event: ClusterEvent) {
        debug!(event = ?event, "Simulated cluster event");
        self.inner.events.lock().push(event);
    }

    fn take_fault(&self, fault: Fault) -> bool {
        let mut hit = false;
        if let Some(mut remaining) = self.inner.faults.get_mut(&fault) {
            if *remaining > 0 {
                *remaining -= 1;
                hit = true;
            }
        }
        hit
    }

    fn enable_cluster_task(&self, enabled: bool) -> Option<String> {
        let mut guard = self.inner.cluster_task.write();
        let task = guard.as_mut()?;
        task.enabled = enabled;
        let name = task.name.clone();
        drop(guard);
        self.record(ClusterEvent::TaskEnabled {
            task: name.clone(),
            enabled,
        });
        Some(name)
    }

    /// Hand the quorum group to the first other node that is up.
    fn fail_over_quorum(&self, from: &NodeName) {
        if &self.quorum_owner() != from {
            return;
        }
        let target = self
            .node_names()
            .into_iter()
            .filter(|n| n != from)
            .find(|n| {
                self.inner
                    .nodes
                    .get(n)
                    .map(|node| node.state == NodeLiveState::Up)
                    .unwrap_or(false)
            });
        if let Some(to) = target {
            self.set_quorum_owner(&to);
            self.record(ClusterEvent::QuorumMoved {
                from: from.clone(),
                to,
            });
        }
    }
}

/// One node's handle on a `MemoryCluster`.
#[derive(Clone)]
pub struct MemoryNode {
    cluster: MemoryCluster,
    name: NodeName,
}

impl MemoryNode {
    fn unknown(&self, node: &NodeName) -> ClusterRollError {
        ClusterRollError::ClusterApi(format!("node {} not found", node))
    }
}

impl ClusterApi for MemoryNode {
    async fn nodes(&self) -> Result<Vec<NodeStatus>> {
        if self.cluster.take_fault(Fault::ReadNodes) {
            return Err(ClusterRollError::ClusterApi(
                "cluster service unreachable".to_string(),
            ));
        }
        Ok(self
            .cluster
            .node_names()
            .iter()
            .filter_map(|n| self.cluster.node_status(n))
            .collect())
    }

    async fn storage_jobs(&self, node: &NodeName) -> Result<Vec<StorageJob>> {
        Ok(self
            .cluster
            .inner
            .storage_jobs
            .get(node)
            .map(|jobs| jobs.iter().map(|j| j.job.clone()).collect())
            .unwrap_or_default())
    }

    async fn quorum_owner(&self) -> Result<NodeName> {
        Ok(self.cluster.quorum_owner())
    }

    async fn suspend_node(&self, node: &NodeName, mode: DrainMode) -> Result<()> {
        let fault = match mode {
            DrainMode::Graceful => Fault::Drain,
            DrainMode::Forced => Fault::ForcedDrain,
        };
        if self.cluster.take_fault(fault) {
            if let Some(mut sim) = self.cluster.inner.nodes.get_mut(node) {
                sim.state = NodeLiveState::Paused;
                sim.status = NodeStatusInfo::DrainFailed;
            }
            return Err(ClusterRollError::ClusterApi(format!(
                "drain of {} failed",
                node
            )));
        }
        {
            let mut sim = self
                .cluster
                .inner
                .nodes
                .get_mut(node)
                .ok_or_else(|| self.unknown(node))?;
            sim.state = NodeLiveState::Paused;
            sim.status = NodeStatusInfo::DrainCompleted;
        }
        self.cluster.record(ClusterEvent::Drained {
            node: node.clone(),
            mode,
        });
        self.cluster.fail_over_quorum(node);
        Ok(())
    }

    async fn resume_node(&self, node: &NodeName) -> Result<()> {
        if self.cluster.take_fault(Fault::Resume) {
            return Err(ClusterRollError::ClusterApi(format!(
                "resume of {} failed",
                node
            )));
        }
        {
            let mut sim = self
                .cluster
                .inner
                .nodes
                .get_mut(node)
                .ok_or_else(|| self.unknown(node))?;
            sim.state = NodeLiveState::Up;
            sim.status = NodeStatusInfo::Normal;
        }
        self.cluster.record(ClusterEvent::Resumed(node.clone()));

        let resync = *self.cluster.inner.resync_rounds.read();
        if let Some(rounds) = resync {
            for name in self.cluster.node_names() {
                self.cluster.add_storage_job(&name, "Resync", rounds);
            }
        }
        Ok(())
    }

    async fn script_present(&self, node: &NodeName, _path: &str) -> Result<bool> {
        self.cluster
            .inner
            .nodes
            .get(node)
            .map(|n| n.script_present)
            .ok_or_else(|| self.unknown(node))
    }
}

impl HostControl for MemoryNode {
    fn local_node(&self) -> NodeName {
        self.name.clone()
    }

    async fn last_boot_time(&self) -> Result<Timestamp> {
        self.cluster
            .inner
            .nodes
            .get(&self.name)
            .map(|n| n.last_boot)
            .ok_or_else(|| ClusterRollError::HostControl(format!("unknown host {}", self.name)))
    }

    async fn restart(&self) -> Result<()> {
        if self.cluster.take_fault(Fault::Restart) {
            return Err(ClusterRollError::HostControl(
                "restart refused".to_string(),
            ));
        }
        {
            let mut node = self
                .cluster
                .inner
                .nodes
                .get_mut(&self.name)
                .ok_or_else(|| ClusterRollError::HostControl(format!("unknown host {}", self.name)))?;
            node.paused_before_reboot = node.state == NodeLiveState::Paused;
            node.rebooting = true;
            node.state = NodeLiveState::Down;
            node.status = NodeStatusInfo::Normal;
        }
        self.cluster.record(ClusterEvent::Restarted(self.name.clone()));
        self.cluster.fail_over_quorum(&self.name);
        Ok(())
    }
}

impl TaskScheduler for MemoryNode {
    async fn cluster_task(&self, name: &str) -> Result<Option<ClusterTask>> {
        if self.cluster.take_fault(Fault::ReadTask) {
            return Err(ClusterRollError::TaskScheduler(
                "cluster service is not running".to_string(),
            ));
        }
        Ok(self
            .cluster
            .cluster_task()
            .filter(|task| task.name.eq_ignore_ascii_case(name)))
    }

    async fn register_cluster_task(&self, definition: &TaskDefinition) -> Result<()> {
        let mut guard = self.cluster.inner.cluster_task.write();
        if guard.is_some() {
            return Err(ClusterRollError::TaskScheduler(format!(
                "task {} already registered",
                definition.name
            )));
        }
        let start_boundary = match &definition.trigger {
            TaskTrigger::Repeating { start, .. } => Some(*start),
            TaskTrigger::AtStartup => None,
        };
        *guard = Some(ClusterTask {
            name: definition.name.clone(),
            description: definition.description.clone(),
            enabled: definition.enabled,
            start_boundary,
        });
        drop(guard);
        self.cluster.record(ClusterEvent::TaskRegistered {
            task: definition.name.clone(),
            arguments: definition.arguments.clone(),
        });
        Ok(())
    }

    async fn set_description(&self, name: &str, description: &str) -> Result<()> {
        if self.cluster.take_fault(Fault::WriteDescription) {
            return Err(ClusterRollError::TaskScheduler(
                "task update failed".to_string(),
            ));
        }
        {
            let mut guard = self.cluster.inner.cluster_task.write();
            let task = guard
                .as_mut()
                .filter(|task| task.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| ClusterRollError::TaskNotFound(name.to_string()))?;
            task.description = description.to_string();
        }
        self.cluster.record(ClusterEvent::DescriptionWritten {
            by: self.name.clone(),
        });
        Ok(())
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let registered = self
            .cluster
            .cluster_task()
            .map(|task| task.name.eq_ignore_ascii_case(name))
            .unwrap_or(false);
        if !registered {
            return Err(ClusterRollError::TaskNotFound(name.to_string()));
        }
        self.cluster.enable_cluster_task(enabled);
        Ok(())
    }

    async fn unregister_cluster_task(&self, name: &str) -> Result<()> {
        {
            let mut guard = self.cluster.inner.cluster_task.write();
            let registered = guard
                .as_ref()
                .map(|task| task.name.eq_ignore_ascii_case(name))
                .unwrap_or(false);
            if !registered {
                return Err(ClusterRollError::TaskNotFound(name.to_string()));
            }
            *guard = None;
        }
        self.cluster.record(ClusterEvent::TaskUnregistered {
            task: name.to_string(),
            by: self.name.clone(),
        });
        Ok(())
    }

    async fn register_local_task(&self, definition: &TaskDefinition) -> Result<()> {
        self.cluster.inner.local_tasks.insert(
            (self.name.clone(), definition.name.clone()),
            definition.clone(),
        );
        self.cluster.record(ClusterEvent::LocalTaskRegistered {
            node: self.name.clone(),
            task: definition.name.clone(),
        });
        Ok(())
    }

    async fn unregister_local_task(&self, name: &str) -> Result<()> {
        let removed = self
            .cluster
            .inner
            .local_tasks
            .remove(&(self.name.clone(), name.to_string()));
        if removed.is_some() {
            self.cluster.record(ClusterEvent::LocalTaskRemoved {
                node: self.name.clone(),
                task: name.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_drain_moves_quorum() {
        let cluster = MemoryCluster::new(["A", "B", "C"], Utc::now());
        let a = cluster.handle("A");
        assert_eq!(cluster.quorum_owner(), NodeName::new("A"));

        a.suspend_node(&NodeName::new("A"), DrainMode::Graceful)
            .await
            .unwrap();

        let status = cluster.node_status(&NodeName::new("A")).unwrap();
        assert!(status.is(&NodeLiveState::Paused, &NodeStatusInfo::DrainCompleted));
        assert_eq!(cluster.quorum_owner(), NodeName::new("B"));
    }

    fn roll_task() -> TaskConfig {
        TaskConfig {
            name: "Roll".into(),
            helper_name: "Roll-Resume".into(),
            resume_attempts: 3,
            resume_retry_delay: std::time::Duration::ZERO,
            ..TaskConfig::default()
        }
    }

    async fn rebooting_node(cluster: &MemoryCluster, start: Timestamp) -> MemoryNode {
        let a = cluster.handle("A");
        let name = NodeName::new("A");

        a.register_cluster_task(&TaskDefinition {
            name: "Roll".into(),
            description: "[]".into(),
            execute: "clusterroll.exe".into(),
            arguments: vec!["tick".into()],
            trigger: TaskTrigger::Repeating {
                start,
                interval: Duration::minutes(1),
                duration: Duration::days(2),
            },
            enabled: true,
        })
        .await
        .unwrap();
        a.register_local_task(&TaskDefinition {
            name: "Roll-Resume".into(),
            description: String::new(),
            execute: "clusterroll.exe".into(),
            arguments: roll_task().resume_arguments(),
            trigger: TaskTrigger::AtStartup,
            enabled: true,
        })
        .await
        .unwrap();

        a.suspend_node(&name, DrainMode::Graceful).await.unwrap();
        a.set_enabled("Roll", false).await.unwrap();
        a.restart().await.unwrap();
        assert!(cluster.is_rebooting(&name));
        assert_eq!(
            cluster.node_status(&name).unwrap().state,
            NodeLiveState::Down
        );
        a
    }

    #[tokio::test]
    async fn test_reboot_keeps_pause_and_runs_startup_tasks() {
        let start = Utc::now();
        let cluster = MemoryCluster::new(["A", "B"], start);
        let a = rebooting_node(&cluster, start).await;
        let name = NodeName::new("A");

        cluster.advance_clock(Duration::minutes(1));
        cluster.boot(&name, &roll_task()).await.unwrap();

        let status = cluster.node_status(&name).unwrap();
        assert!(status.is(&NodeLiveState::Paused, &NodeStatusInfo::Normal));
        assert_eq!(a.last_boot_time().await.unwrap(), cluster.clock());
        assert!(cluster.cluster_task().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_resume_at_boot_waits_for_cluster_service() {
        let start = Utc::now();
        let cluster = MemoryCluster::new(["A", "B"], start);
        rebooting_node(&cluster, start).await;
        let name = NodeName::new("A");

        // The first two task reads fail while the service comes up.
        cluster.inject(Fault::ReadTask, 2);
        cluster.boot(&name, &roll_task()).await.unwrap();
        assert!(cluster.cluster_task().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_resume_at_boot_gives_up_after_attempts() {
        let start = Utc::now();
        let cluster = MemoryCluster::new(["A", "B"], start);
        rebooting_node(&cluster, start).await;

        cluster.inject(Fault::ReadTask, 3);
        let err = cluster
            .boot(&NodeName::new("A"), &roll_task())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!cluster.cluster_task().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let cluster = MemoryCluster::new(["A"], Utc::now());
        let a = cluster.handle("A");
        cluster.inject(Fault::ReadNodes, 1);

        assert!(a.nodes().await.is_err());
        assert_eq!(a.nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_jobs_age_out() {
        let cluster = MemoryCluster::new(["A"], Utc::now());
        let a = cluster.handle("A");
        let name = NodeName::new("A");
        cluster.add_storage_job(&name, "Repair", 2);

        assert_eq!(a.storage_jobs(&name).await.unwrap().len(), 1);
        cluster.advance_clock(Duration::minutes(1));
        assert_eq!(a.storage_jobs(&name).await.unwrap().len(), 1);
        cluster.advance_clock(Duration::minutes(1));
        assert!(a.storage_jobs(&name).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_local_task_is_idempotent() {
        let cluster = MemoryCluster::new(["A"], Utc::now());
        let a = cluster.handle("A");
        a.unregister_local_task("missing").await.unwrap();
        assert!(cluster.local_tasks(&NodeName::new("A")).is_empty());
    }
}
