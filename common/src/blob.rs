//! The persisted rollout state: one entry per cluster node.
//!
//! On the wire this is a compact JSON array of `{"Name": .., "State": ..}`
//! objects. The blob is small on purpose, since the original medium is a
//! scheduled task description field.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{ClusterRollError, NodeName, RestartState, Result};

/// Restart state of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    #[serde(rename = "Name")]
    pub name: NodeName,
    #[serde(rename = "State", default)]
    pub state: RestartState,
}

impl NodeEntry {
    /// Create a new entry.
    pub fn new(name: impl Into<NodeName>, state: RestartState) -> Self {
        Self {
            name: name.into(),
            state,
        }
    }
}

/// Count of nodes in each restart state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub pending: usize,
    pub paused: usize,
    pub ready_to_restart: usize,
    pub restarted: usize,
    pub resumed: usize,
    pub complete: usize,
}

impl Progress {
    /// Total number of nodes.
    pub fn total(&self) -> usize {
        self.pending
            + self.paused
            + self.ready_to_restart
            + self.restarted
            + self.resumed
            + self.complete
    }
}

/// Ordered collection of node entries, sorted by node name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StateBlob {
    entries: Vec<NodeEntry>,
}

impl StateBlob {
    /// Build the initial blob: every node `Pending`.
    pub fn new<I, N>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeName>,
    {
        let entries = names
            .into_iter()
            .map(|name| NodeEntry::new(name, RestartState::Pending))
            .collect();
        Self::from_entries(entries)
    }

    /// Build a blob from explicit entries, rejecting duplicate names.
    pub fn from_entries(mut entries: Vec<NodeEntry>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(&entry.name) {
                return Err(ClusterRollError::DuplicateNode(entry.name.clone()));
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { entries })
    }

    /// Parse the persisted JSON form.
    ///
    /// Accepts a single object as well as an array, since a one-node
    /// collection is often written unwrapped by other tooling.
    pub fn parse(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json.trim())?;
        let entries: Vec<NodeEntry> = match value {
            serde_json::Value::Array(_) => serde_json::from_value(value)?,
            serde_json::Value::Object(_) => vec![serde_json::from_value(value)?],
            other => {
                return Err(ClusterRollError::Serialization(format!(
                    "expected a JSON array of node entries, got {}",
                    other
                )))
            }
        };
        Self::from_entries(entries)
    }

    /// Compact JSON form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.entries)?)
    }

    /// Entries in name order.
    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the blob has no nodes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a node's entry.
    pub fn entry(&self, name: &NodeName) -> Option<&NodeEntry> {
        self.entries.iter().find(|e| &e.name == name)
    }

    /// Look up a node's state.
    pub fn state_of(&self, name: &NodeName) -> Option<RestartState> {
        self.entry(name).map(|e| e.state)
    }

    /// The node whose turn it is: first entry, in name order, not yet
    /// `Complete`.
    pub fn current_turn(&self) -> Option<&NodeEntry> {
        self.entries.iter().find(|e| !e.state.is_final())
    }

    /// Check if every node has finished.
    pub fn all_complete(&self) -> bool {
        self.entries.iter().all(|e| e.state.is_final())
    }

    /// Move one node forward. Only the named entry is touched.
    pub fn advance(&mut self, name: &NodeName, to: RestartState) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| &e.name == name)
            .ok_or_else(|| ClusterRollError::MissingNode(name.clone()))?;

        if !entry.state.can_transition_to(to) {
            return Err(ClusterRollError::InvalidTransition {
                node: name.clone(),
                from: entry.state,
                to,
            });
        }

        entry.state = to;
        Ok(())
    }

    /// Put every node back to `Pending`.
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.state = RestartState::Pending;
        }
    }

    /// Order-insensitive view.
    pub fn to_map(&self) -> BTreeMap<NodeName, RestartState> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.state))
            .collect()
    }

    /// Count nodes per state.
    pub fn progress(&self) -> Progress {
        let mut progress = Progress::default();
        for entry in &self.entries {
            let slot = match entry.state {
                RestartState::Pending => &mut progress.pending,
                RestartState::Paused => &mut progress.paused,
                RestartState::ReadyToRestart => &mut progress.ready_to_restart,
                RestartState::Restarted => &mut progress.restarted,
                RestartState::Resumed => &mut progress.resumed,
                RestartState::Complete => &mut progress.complete,
            };
            *slot += 1;
        }
        progress
    }
}

impl<'de> Deserialize<'de> for StateBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let entries = Vec::<NodeEntry>::deserialize(deserializer)?;
        StateBlob::from_entries(entries).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn blob(states: &[(&str, RestartState)]) -> StateBlob {
        StateBlob::from_entries(
            states
                .iter()
                .map(|(name, state)| NodeEntry::new(*name, *state))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_initial_blob_sorted_and_pending() {
        let blob = StateBlob::new(["C", "A", "B"]).unwrap();
        let names: Vec<&str> = blob.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(blob.progress().pending, 3);
        assert_eq!(
            blob.to_json().unwrap(),
            r#"[{"Name":"A","State":""},{"Name":"B","State":""},{"Name":"C","State":""}]"#
        );
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = StateBlob::new(["node1", "NODE1"]).unwrap_err();
        assert!(matches!(err, ClusterRollError::DuplicateNode(_)));

        let err = StateBlob::parse(r#"[{"Name":"A","State":""},{"Name":"a","State":"Paused"}]"#)
            .unwrap_err();
        assert!(matches!(err, ClusterRollError::DuplicateNode(_)));
    }

    #[test]
    fn test_parse_single_object() {
        let blob = StateBlob::parse(r#"{"Name":"SOLO","State":"Resumed"}"#).unwrap();
        assert_eq!(blob.len(), 1);
        assert_eq!(
            blob.state_of(&NodeName::new("solo")),
            Some(RestartState::Resumed)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(StateBlob::parse("").is_err());
        assert!(StateBlob::parse("42").is_err());
        assert!(StateBlob::parse(r#"[{"Name":"A","State":"Exploded"}]"#).is_err());
    }

    #[test]
    fn test_parse_missing_state_is_pending() {
        let blob = StateBlob::parse(r#"[{"Name":"B"},{"Name":"A","State":null}]"#).unwrap();
        assert_eq!(blob.progress().pending, 2);
        assert_eq!(blob.entries()[0].name.as_str(), "A");
    }

    #[test]
    fn test_current_turn() {
        let b = blob(&[
            ("A", RestartState::Complete),
            ("B", RestartState::Pending),
            ("C", RestartState::Pending),
        ]);
        assert_eq!(b.current_turn().unwrap().name.as_str(), "B");

        let b = blob(&[("A", RestartState::Complete), ("B", RestartState::Complete)]);
        assert!(b.current_turn().is_none());
        assert!(b.all_complete());
    }

    #[test]
    fn test_advance_touches_only_named_entry() {
        let mut b = StateBlob::new(["A", "B", "C"]).unwrap();
        b.advance(&NodeName::new("A"), RestartState::Paused).unwrap();

        assert_eq!(b.state_of(&NodeName::new("A")), Some(RestartState::Paused));
        assert_eq!(b.state_of(&NodeName::new("B")), Some(RestartState::Pending));
        assert_eq!(b.state_of(&NodeName::new("C")), Some(RestartState::Pending));
    }

    #[test]
    fn test_advance_rejects_skip_and_unknown_node() {
        let mut b = StateBlob::new(["A"]).unwrap();
        let err = b
            .advance(&NodeName::new("A"), RestartState::Restarted)
            .unwrap_err();
        assert!(matches!(err, ClusterRollError::InvalidTransition { .. }));

        let err = b
            .advance(&NodeName::new("Z"), RestartState::Paused)
            .unwrap_err();
        assert!(matches!(err, ClusterRollError::MissingNode(_)));
    }

    #[test]
    fn test_reset() {
        let mut b = blob(&[("A", RestartState::Complete), ("B", RestartState::Resumed)]);
        b.reset();
        assert_eq!(b.progress().pending, 2);
        assert_eq!(b.current_turn().unwrap().name.as_str(), "A");
    }

    fn arb_state() -> impl Strategy<Value = RestartState> {
        prop::sample::select(RestartState::ALL.to_vec())
    }

    fn arb_blob() -> impl Strategy<Value = StateBlob> {
        prop::collection::btree_map("[a-z]{1,8}", arb_state(), 1..12).prop_map(|map| {
            StateBlob::from_entries(
                map.into_iter()
                    .map(|(name, state)| NodeEntry::new(name, state))
                    .collect(),
            )
            .unwrap()
        })
    }

    proptest! {
        #[test]
        fn prop_turn_is_first_unfinished(b in arb_blob()) {
            let turn = b.current_turn();
            let unfinished: Vec<&NodeEntry> =
                b.entries().iter().filter(|e| !e.state.is_final()).collect();
            match turn {
                Some(entry) => {
                    prop_assert!(!entry.state.is_final());
                    prop_assert!(unfinished.iter().all(|e| entry.name <= e.name));
                    prop_assert_eq!(&entry.name, &unfinished[0].name);
                }
                None => prop_assert!(unfinished.is_empty()),
            }
        }

        #[test]
        fn prop_advance_is_monotonic(b in arb_blob(), to in arb_state()) {
            let name = b.entries()[0].name.clone();
            let before = b.state_of(&name).unwrap();
            let mut after = b.clone();
            match after.advance(&name, to) {
                Ok(()) => {
                    prop_assert_eq!(before.next(), Some(to));
                }
                Err(_) => prop_assert_eq!(&after, &b),
            }
        }

        #[test]
        fn prop_json_preserves_mapping(b in arb_blob()) {
            let json = b.to_json().unwrap();
            let parsed = StateBlob::parse(&json).unwrap();
            prop_assert_eq!(parsed.to_map(), b.to_map());
        }
    }
}
