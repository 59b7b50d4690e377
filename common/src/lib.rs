//! ClusterRoll Common Types
//!
//! Shared types for the rolling-restart coordinator: node identifiers,
//! the per-node restart state machine, the persisted state blob and errors.

pub mod identifiers;
pub mod state;
pub mod blob;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use state::*;
pub use blob::*;
pub use error::*;
pub use time::*;
