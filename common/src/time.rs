//! Time utilities and constants for the rolling restart.

use chrono::{DateTime, Duration, Utc};

/// Protocol timing constants.
pub mod constants {
    use super::Duration;

    /// How often every node runs a tick (1 minute).
    pub fn tick_interval() -> Duration {
        Duration::minutes(1)
    }

    /// How long the repeating trigger stays active for a cluster of
    /// `node_count` nodes: one day per node.
    pub fn trigger_duration(node_count: usize) -> Duration {
        Duration::days(node_count.max(1) as i64)
    }

    /// How many days of transcripts are kept.
    pub const TRANSCRIPT_RETENTION_DAYS: u32 = 30;
}

/// A timestamp, always UTC.
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Check that a node booted at or after `boundary`.
///
/// A `Restarted` entry is only trusted when the node actually rebooted
/// after the coordinator task's start boundary.
pub fn booted_since(last_boot: Timestamp, boundary: Timestamp) -> bool {
    last_boot >= boundary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_duration_scales_with_nodes() {
        assert_eq!(constants::trigger_duration(4), Duration::days(4));
        assert_eq!(constants::trigger_duration(0), Duration::days(1));
    }

    #[test]
    fn test_booted_since() {
        let boundary = now();
        assert!(booted_since(boundary, boundary));
        assert!(booted_since(boundary + Duration::minutes(3), boundary));
        assert!(!booted_since(boundary - Duration::hours(1), boundary));
    }
}
