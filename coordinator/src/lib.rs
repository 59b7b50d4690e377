//! ClusterRoll Coordinator
//!
//! Restarts failover cluster nodes one at a time. Every
//! node runs a tick once a minute from a cluster-wide scheduled task; the
//! rollout state is shared through a small persisted blob.

pub mod cluster;
pub mod config;
pub mod control;
pub mod driver;
pub mod environment;
pub mod machine;
pub mod memory;
pub mod powershell;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod transcript;

pub use cluster::{ClusterApi, HostControl};
pub use config::{CoordinatorConfig, StoreConfig, TaskConfig, TranscriptConfig};
pub use control::ControlPlane;
pub use driver::{Driver, TickOutcome, TickReport};
pub use machine::{Action, Decision, WaitReason};
pub use scheduler::TaskScheduler;
pub use state::{RolloutPhase, RolloutStatus};
pub use store::{FileStateStore, StateStore, TaskDescriptionStore, Versioned};
