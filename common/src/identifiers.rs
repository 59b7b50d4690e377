//! Identifier types for cluster nodes and rollouts.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Name of a cluster node.
///
/// Cluster node names are case-insensitive, so equality, hashing and
/// ordering all compare the ASCII-lowercased name. The original spelling
/// is kept for display and serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    /// Create a new node name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the name against a raw string, ignoring case.
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }

    /// Validate the node name format.
    pub fn is_valid(&self) -> bool {
        // DNS host label: up to 63 letters, digits and hyphens
        !self.0.is_empty()
            && self.0.len() <= 63
            && self.0.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    }

    fn sort_key(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.bytes().map(|b| b.to_ascii_lowercase())
    }
}

impl PartialEq for NodeName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for NodeName {}

impl Hash for NodeName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.sort_key() {
            state.write_u8(b);
        }
        state.write_u8(0xff);
    }
}

impl PartialOrd for NodeName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(other.sort_key())
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier for one rollout, assigned when the coordinator is started.
/// Uses UUID v7 so ids sort by start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new run ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_node_name_case_insensitive() {
        assert_eq!(NodeName::new("HV-NODE01"), NodeName::new("hv-node01"));
        assert!(NodeName::new("Node1").matches("NODE1"));

        let mut set = HashSet::new();
        set.insert(NodeName::new("Alpha"));
        assert!(set.contains(&NodeName::new("ALPHA")));
    }

    #[test]
    fn test_node_name_ordering() {
        let mut names = vec![
            NodeName::new("node-c"),
            NodeName::new("Node-A"),
            NodeName::new("NODE-b"),
        ];
        names.sort();
        let sorted: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
        assert_eq!(sorted, vec!["Node-A", "NODE-b", "node-c"]);
    }

    #[test]
    fn test_node_name_display_keeps_spelling() {
        assert_eq!(NodeName::new("HvNode01").to_string(), "HvNode01");
    }

    #[test]
    fn test_node_name_validation() {
        assert!(NodeName::new("HV-NODE01").is_valid());
        assert!(!NodeName::new("").is_valid());
        assert!(!NodeName::new("node_01").is_valid());
    }

    #[test]
    fn test_run_id_parse() {
        let uuid_str = "019456ab-1234-7def-8901-234567890abc";
        let id = RunId::parse(uuid_str).unwrap();
        assert_eq!(id.to_string(), uuid_str);
        assert_ne!(RunId::new(), RunId::new());
    }
}
