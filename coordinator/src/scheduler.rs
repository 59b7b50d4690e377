//! Scheduled task seam.
//!
//! The coordinator runs from a cluster-wide task that fires on every node,
//! plus a node-local task that re-enables it after a reboot.

use clusterroll_common::Result;

use crate::environment::{ClusterTask, TaskDefinition};

/// Scheduled task calls used by the coordinator.
#[allow(async_fn_in_trait)]
pub trait TaskScheduler {
    /// Read the cluster-wide task, if registered.
    async fn cluster_task(&self, name: &str) -> Result<Option<ClusterTask>>;

    /// Register a cluster-wide task.
    async fn register_cluster_task(&self, definition: &TaskDefinition) -> Result<()>;

    /// Replace the description of the cluster-wide task.
    async fn set_description(&self, name: &str, description: &str) -> Result<()>;

    /// Enable or disable the cluster-wide task.
    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()>;

    /// Remove the cluster-wide task.
    async fn unregister_cluster_task(&self, name: &str) -> Result<()>;

    /// Register a task on the local machine only.
    async fn register_local_task(&self, definition: &TaskDefinition) -> Result<()>;

    /// Remove a local task. A missing task is not an error.
    async fn unregister_local_task(&self, name: &str) -> Result<()>;
}
