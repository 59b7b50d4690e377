//! Seams to the cluster service and the local host.

use clusterroll_common::{NodeName, Result, Timestamp};

use crate::environment::{DrainMode, NodeStatus, StorageJob};

/// Failover cluster management calls used by the coordinator.
#[allow(async_fn_in_trait)]
pub trait ClusterApi {
    /// Cluster node table.
    async fn nodes(&self) -> Result<Vec<NodeStatus>>;

    /// Storage jobs still running that involve `node`.
    async fn storage_jobs(&self, node: &NodeName) -> Result<Vec<StorageJob>>;

    /// Owner of the quorum resource group.
    async fn quorum_owner(&self) -> Result<NodeName>;

    /// Pause `node` and drain its roles, blocking until the drain ends.
    async fn suspend_node(&self, node: &NodeName, mode: DrainMode) -> Result<()>;

    /// Resume `node`, leaving roles where they are.
    async fn resume_node(&self, node: &NodeName) -> Result<()>;

    /// Check that the coordinator executable exists at `path` on `node`.
    async fn script_present(&self, node: &NodeName, path: &str) -> Result<bool>;
}

/// Calls against the machine the coordinator runs on.
#[allow(async_fn_in_trait)]
pub trait HostControl {
    /// Cluster name of this machine.
    fn local_node(&self) -> NodeName;

    /// When this machine last booted.
    async fn last_boot_time(&self) -> Result<Timestamp>;

    /// Force a restart. On a real host this does not return.
    async fn restart(&self) -> Result<()>;
}
