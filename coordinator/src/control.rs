//! Operator commands.
//!
//! These run once, interactively, and surface every failure to the caller.
//! Only `start` registers the coordinator task; the others act on an
//! existing one.

use chrono::Duration;
use tracing::{info, instrument, warn};

use clusterroll_common::{
    now, time::constants::trigger_duration, ClusterRollError, Result, StateBlob, Timestamp,
};

use crate::cluster::ClusterApi;
use crate::config::TaskConfig;
use crate::environment::{TaskDefinition, TaskTrigger};
use crate::scheduler::TaskScheduler;
use crate::state::RolloutStatus;
use crate::store::StateStore;

/// Operator-facing control of the rollout.
pub struct ControlPlane<C, T, S> {
    cluster: C,
    scheduler: T,
    store: S,
    task: TaskConfig,
}

impl<C, T, S> ControlPlane<C, T, S>
where
    C: ClusterApi,
    T: TaskScheduler,
    S: StateStore,
{
    /// Create a new control plane.
    pub fn new(cluster: C, scheduler: T, store: S, task: TaskConfig) -> Self {
        Self {
            cluster,
            scheduler,
            store,
            task,
        }
    }

    /// Register the coordinator task and initialize the state.
    pub async fn start(&self, suspended: bool, path: Option<&str>) -> Result<StateBlob> {
        self.start_at(suspended, path, now()).await
    }

    /// `start` with an explicit trigger start time.
    #[instrument(skip(self))]
    pub async fn start_at(
        &self,
        suspended: bool,
        path: Option<&str>,
        at: Timestamp,
    ) -> Result<StateBlob> {
        if self.scheduler.cluster_task(&self.task.name).await?.is_some() {
            return Err(ClusterRollError::TaskAlreadyExists(self.task.name.clone()));
        }

        let nodes = self.cluster.nodes().await?;
        if let Some(bad) = nodes.iter().find(|n| !n.is_healthy()) {
            return Err(ClusterRollError::ClusterUnhealthy {
                node: bad.name.clone(),
                state: bad.state.to_string(),
                status: bad.status.to_string(),
            });
        }

        let executable = path.unwrap_or(&self.task.executable);
        for node in &nodes {
            if !self.cluster.script_present(&node.name, executable).await? {
                return Err(ClusterRollError::ScriptMissing {
                    node: node.name.clone(),
                    path: executable.to_string(),
                });
            }
        }

        let blob = StateBlob::new(nodes.iter().map(|n| n.name.clone()))?;
        let interval = Duration::from_std(self.task.interval)
            .map_err(|e| ClusterRollError::Configuration(e.to_string()))?;
        let definition = TaskDefinition {
            name: self.task.name.clone(),
            description: blob.to_json()?,
            execute: executable.to_string(),
            arguments: self.task.tick_arguments(),
            trigger: TaskTrigger::Repeating {
                start: at,
                interval,
                duration: trigger_duration(blob.len()),
            },
            enabled: !suspended,
        };

        self.scheduler.register_cluster_task(&definition).await?;
        self.store.reset(&blob).await?;

        info!(
            task = %self.task.name,
            nodes = blob.len(),
            suspended,
            arguments = %definition.argument_line(),
            "Rolling restart registered"
        );
        Ok(blob)
    }

    /// Remove the coordinator task. A missing task is not an error.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        match self.scheduler.unregister_cluster_task(&self.task.name).await {
            Ok(()) => {
                info!(task = %self.task.name, "Coordinator task removed");
                Ok(())
            }
            Err(ClusterRollError::TaskNotFound(_)) => {
                warn!(task = %self.task.name, "Coordinator task was not registered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Put every node back to the start without re-registering the task.
    #[instrument(skip(self))]
    pub async fn restart(&self) -> Result<StateBlob> {
        self.require_task().await?;
        let mut blob = self
            .store
            .load()
            .await?
            .ok_or_else(|| ClusterRollError::TaskNotFound(self.task.name.clone()))?
            .value;
        blob.reset();
        self.store.reset(&blob).await?;
        info!(task = %self.task.name, nodes = blob.len(), "Rollout state reset");
        Ok(blob)
    }

    /// Stop ticks from doing anything, leaving the state as it is.
    #[instrument(skip(self))]
    pub async fn suspend(&self) -> Result<()> {
        self.require_task().await?;
        self.scheduler.set_enabled(&self.task.name, false).await?;
        info!(task = %self.task.name, "Rollout suspended");
        Ok(())
    }

    /// Let ticks run again.
    #[instrument(skip(self))]
    pub async fn resume(&self) -> Result<()> {
        self.require_task().await?;
        self.scheduler.set_enabled(&self.task.name, true).await?;
        info!(task = %self.task.name, "Rollout resumed");
        Ok(())
    }

    /// `resume` as run by the at-startup helper. The cluster service may
    /// still be starting, so retryable failures are retried a bounded number
    /// of times before giving up.
    #[instrument(skip(self))]
    pub async fn resume_after_boot(&self) -> Result<()> {
        let attempts = self.task.resume_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.resume().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "Resume failed, retrying");
                    tokio::time::sleep(self.task.resume_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Current rollout status.
    pub async fn status(&self) -> Result<RolloutStatus> {
        let task = match self.scheduler.cluster_task(&self.task.name).await? {
            Some(task) => task,
            None => return Ok(RolloutStatus::not_started()),
        };
        let blob = match self.store.load().await? {
            Some(stored) => stored.value,
            None => StateBlob::parse(&task.description)?,
        };
        Ok(RolloutStatus::from_parts(&task, &blob))
    }

    async fn require_task(&self) -> Result<()> {
        self.scheduler
            .cluster_task(&self.task.name)
            .await?
            .map(|_| ())
            .ok_or_else(|| ClusterRollError::TaskNotFound(self.task.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{NodeLiveState, NodeStatusInfo};
    use crate::memory::{ClusterEvent, Fault, MemoryCluster, MemoryNode};
    use crate::state::RolloutPhase;
    use crate::store::TaskDescriptionStore;
    use chrono::Utc;
    use clusterroll_common::{NodeName, RestartState};

    fn control(
        cluster: &MemoryCluster,
    ) -> ControlPlane<MemoryNode, MemoryNode, TaskDescriptionStore<MemoryNode>> {
        let handle = cluster.handle("A");
        let task = TaskConfig {
            resume_retry_delay: std::time::Duration::ZERO,
            ..TaskConfig::default()
        };
        let store = TaskDescriptionStore::new(handle.clone(), task.name.clone());
        ControlPlane::new(handle.clone(), handle, store, task)
    }

    #[tokio::test]
    async fn test_start_registers_task_with_blob() {
        let cluster = MemoryCluster::new(["B", "A", "C"], Utc::now());
        let control = control(&cluster);

        let blob = control.start(false, None).await.unwrap();
        assert_eq!(blob.len(), 3);

        let task = cluster.cluster_task().unwrap();
        assert!(task.enabled);
        assert!(task.start_boundary.is_some());
        assert_eq!(
            task.description,
            r#"[{"Name":"A","State":""},{"Name":"B","State":""},{"Name":"C","State":""}]"#
        );
    }

    #[tokio::test]
    async fn test_start_refuses_existing_task() {
        let cluster = MemoryCluster::new(["A", "B"], Utc::now());
        let control = control(&cluster);
        control.start(false, None).await.unwrap();

        let err = control.start(false, None).await.unwrap_err();
        assert!(matches!(err, ClusterRollError::TaskAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_start_refuses_unhealthy_cluster() {
        let cluster = MemoryCluster::new(["A", "B"], Utc::now());
        cluster.set_node_state(
            &NodeName::new("B"),
            NodeLiveState::Paused,
            NodeStatusInfo::DrainCompleted,
        );
        let control = control(&cluster);

        let err = control.start(false, None).await.unwrap_err();
        assert!(matches!(err, ClusterRollError::ClusterUnhealthy { .. }));
        assert!(cluster.cluster_task().is_none());
    }

    #[tokio::test]
    async fn test_start_refuses_missing_script() {
        let cluster = MemoryCluster::new(["A", "B"], Utc::now());
        cluster.set_script_present(&NodeName::new("B"), false);
        let control = control(&cluster);

        let err = control.start(false, Some("D:\\roll.exe")).await.unwrap_err();
        match err {
            ClusterRollError::ScriptMissing { node, path } => {
                assert_eq!(node, NodeName::new("B"));
                assert_eq!(path, "D:\\roll.exe");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(cluster.cluster_task().is_none());
    }

    #[tokio::test]
    async fn test_suspend_resume_and_status() {
        let cluster = MemoryCluster::new(["A", "B"], Utc::now());
        let control = control(&cluster);

        assert_eq!(
            control.status().await.unwrap().phase,
            RolloutPhase::NotStarted
        );
        assert!(control.suspend().await.is_err());

        control.start(true, None).await.unwrap();
        assert_eq!(
            control.status().await.unwrap().phase,
            RolloutPhase::Suspended
        );

        control.resume().await.unwrap();
        let status = control.status().await.unwrap();
        assert_eq!(status.phase, RolloutPhase::InProgress);
        assert_eq!(status.current_turn, Some(NodeName::new("A")));
        assert_eq!(status.progress.pending, 2);
    }

    #[tokio::test]
    async fn test_restart_resets_state() {
        let cluster = MemoryCluster::new(["A", "B"], Utc::now());
        let control = control(&cluster);
        let mut blob = control.start(false, None).await.unwrap();

        blob.advance(&NodeName::new("A"), RestartState::Paused).unwrap();
        control.store.reset(&blob).await.unwrap();

        let reset = control.restart().await.unwrap();
        assert_eq!(reset.state_of(&NodeName::new("A")), Some(RestartState::Pending));
        assert!(cluster.cluster_task().unwrap().description.contains(r#""State":"""#));
    }

    #[tokio::test]
    async fn test_start_registers_forwarded_arguments() {
        let cluster = MemoryCluster::new(["A", "B"], Utc::now());
        let handle = cluster.handle("A");
        let task = TaskConfig {
            forwarded_arguments: vec!["--state-file".into(), "S:\\roll.json".into()],
            ..TaskConfig::default()
        };
        let store = TaskDescriptionStore::new(handle.clone(), task.name.clone());
        ControlPlane::new(handle.clone(), handle, store, task)
            .start(false, None)
            .await
            .unwrap();

        let registered = cluster.events().into_iter().find_map(|e| match e {
            ClusterEvent::TaskRegistered { arguments, .. } => Some(arguments),
            _ => None,
        });
        assert_eq!(
            registered,
            Some(vec![
                "--state-file".to_string(),
                "S:\\roll.json".to_string(),
                "tick".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_resume_after_boot_stops_on_missing_task() {
        let cluster = MemoryCluster::new(["A"], Utc::now());
        let control = control(&cluster);
        cluster.inject(Fault::ReadTask, 1);

        // One retry for the outage, then the missing task is final.
        let err = control.resume_after_boot().await.unwrap_err();
        assert!(matches!(err, ClusterRollError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let cluster = MemoryCluster::new(["A"], Utc::now());
        let control = control(&cluster);
        control.start(false, None).await.unwrap();

        control.stop().await.unwrap();
        assert!(cluster.cluster_task().is_none());
        control.stop().await.unwrap();
    }
}
