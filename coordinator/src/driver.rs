//! One scheduled tick on one node.
//!
//! The driver gathers the environment, asks the state machine what to do,
//! and applies the answer. Any failure aborts the tick with the stored state
//! untouched; the next tick retries from the same point. A drain or resume
//! that ran but was never recorded is picked up by the state machine as a
//! `Record` decision on that next tick.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use clusterroll_common::{now, ClusterRollError, NodeName, Result, StateBlob, Timestamp};

use crate::cluster::{ClusterApi, HostControl};
use crate::config::TaskConfig;
use crate::environment::{DrainMode, Environment, TaskDefinition, TaskTrigger};
use crate::machine::{self, Action, Decision};
use crate::scheduler::TaskScheduler;
use crate::store::StateStore;

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TickOutcome {
    /// The state machine ran.
    Decided(Decision),
    /// The coordinator task is disabled, nothing was evaluated.
    Suspended,
}

/// Machine-readable result of a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub node: NodeName,
    pub at: Timestamp,
    pub outcome: TickOutcome,
    /// Whether the tick wrote state.
    pub persisted: bool,
}

impl TickReport {
    /// Check if the tick changed anything.
    pub fn changed(&self) -> bool {
        match &self.outcome {
            TickOutcome::Decided(decision) => !decision.is_noop(),
            TickOutcome::Suspended => false,
        }
    }
}

/// Runs ticks against a set of adapters.
pub struct Driver<C, T, S, H> {
    cluster: C,
    scheduler: T,
    store: S,
    host: H,
    task: TaskConfig,
}

impl<C, T, S, H> Driver<C, T, S, H>
where
    C: ClusterApi,
    T: TaskScheduler,
    S: StateStore,
    H: HostControl,
{
    /// Create a new driver.
    pub fn new(cluster: C, scheduler: T, store: S, host: H, task: TaskConfig) -> Self {
        Self {
            cluster,
            scheduler,
            store,
            host,
            task,
        }
    }

    /// Run one tick.
    #[instrument(skip(self), fields(node = %self.host.local_node()))]
    pub async fn tick(&self) -> Result<TickReport> {
        let local = self.host.local_node();

        let task = self
            .scheduler
            .cluster_task(&self.task.name)
            .await?
            .ok_or_else(|| ClusterRollError::TaskNotFound(self.task.name.clone()))?;

        if !task.enabled {
            debug!(task = %self.task.name, "Coordinator task disabled, skipping tick");
            return Ok(self.report(local, TickOutcome::Suspended, false));
        }

        let stored = self
            .store
            .load()
            .await?
            .ok_or_else(|| ClusterRollError::TaskNotFound(self.task.name.clone()))?;
        let mut blob = stored.value;

        let env = self
            .environment(local.clone(), &blob, task.start_boundary)
            .await?;
        let decision = machine::tick(&blob, &env)?;

        let persisted = match &decision {
            Decision::Advance {
                node,
                from,
                to,
                action,
            } => {
                info!(node = %node, from = %from, to = %to, action = ?action, "Advancing node");
                blob.advance(node, *to)?;
                self.apply(*action, &stored.version, &blob).await?;
                true
            }
            Decision::Record { node, from, to } => {
                warn!(node = %node, from = %from, to = %to, "Recording a step that completed without being saved");
                blob.advance(node, *to)?;
                self.store.compare_and_swap(&stored.version, &blob).await?;
                true
            }
            Decision::Cleanup => {
                info!(task = %self.task.name, "All nodes complete, removing coordinator task");
                self.scheduler
                    .unregister_cluster_task(&self.task.name)
                    .await?;
                false
            }
            Decision::Wait(reason) => {
                warn!(reason = ?reason, "Precondition not met, waiting for next tick");
                false
            }
            Decision::NotMyTurn { current } => {
                debug!(current = %current, "Not this node's turn");
                false
            }
            Decision::Idle { quorum_owner } => {
                debug!(quorum_owner = %quorum_owner, "Rollout converged, cleanup belongs to quorum owner");
                false
            }
        };

        Ok(self.report(local, TickOutcome::Decided(decision), persisted))
    }

    /// Gather the live snapshot for `local`.
    async fn environment(
        &self,
        local: NodeName,
        blob: &StateBlob,
        task_start_boundary: Option<Timestamp>,
    ) -> Result<Environment> {
        let nodes = self.cluster.nodes().await?;
        let quorum_owner = self.cluster.quorum_owner().await?;
        let last_boot = self.host.last_boot_time().await?;

        // Storage jobs only matter while it is this node's turn.
        let my_turn = blob
            .current_turn()
            .map(|entry| entry.name == local)
            .unwrap_or(false);
        let storage_jobs = if my_turn {
            self.cluster.storage_jobs(&local).await?
        } else {
            Vec::new()
        };

        Ok(Environment {
            local_node: local,
            nodes,
            storage_jobs,
            quorum_owner,
            last_boot,
            task_start_boundary,
        })
    }

    /// Run `action` and persist `blob`, in the order the action needs.
    ///
    /// Either way nothing touches the node unless the state read at the
    /// start of the tick is still the stored one.
    async fn apply(&self, action: Action, version: &S::Version, blob: &StateBlob) -> Result<()> {
        if action.persist_first() {
            self.store.compare_and_swap(version, blob).await?;
            return self.perform(action).await;
        }

        self.store.ensure_current(version).await?;
        self.perform(action).await?;
        self.store.compare_and_swap(version, blob).await?;
        Ok(())
    }

    async fn perform(&self, action: Action) -> Result<()> {
        let local = self.host.local_node();
        match action {
            Action::Drain => self.drain(&local).await,
            Action::RegisterResumeTask => {
                let helper = self.resume_helper();
                info!(task = %helper.name, "Registering resume-after-reboot task");
                self.scheduler.register_local_task(&helper).await
            }
            Action::Reboot => {
                // The resume helper turns the task back on at boot.
                if let Err(e) = self.scheduler.set_enabled(&self.task.name, false).await {
                    warn!(error = %e, "Could not disable coordinator task before restart");
                }
                info!(node = %local, "Restarting node");
                self.host.restart().await
            }
            Action::Resume => {
                info!(node = %local, "Resuming node");
                self.cluster.resume_node(&local).await
            }
            Action::RemoveResumeTask => {
                info!(task = %self.task.helper_name, "Removing resume-after-reboot task");
                self.scheduler
                    .unregister_local_task(&self.task.helper_name)
                    .await
            }
        }
    }

    /// Blocking drain, retried once with force.
    async fn drain(&self, node: &NodeName) -> Result<()> {
        info!(node = %node, "Draining node");
        match self.cluster.suspend_node(node, DrainMode::Graceful).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(node = %node, error = %e, "Drain failed, retrying with force");
                self.cluster.suspend_node(node, DrainMode::Forced).await
            }
        }
    }

    /// Local task that runs `resume` at boot.
    pub fn resume_helper(&self) -> TaskDefinition {
        TaskDefinition {
            name: self.task.helper_name.clone(),
            description: format!("Re-enables {} after a rolling restart reboot", self.task.name),
            execute: self.task.executable.clone(),
            arguments: self.task.resume_arguments(),
            trigger: TaskTrigger::AtStartup,
            enabled: true,
        }
    }

    fn report(&self, node: NodeName, outcome: TickOutcome, persisted: bool) -> TickReport {
        TickReport {
            node,
            at: now(),
            outcome,
            persisted,
        }
    }
}
