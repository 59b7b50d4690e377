//! Per-node restart state and its transition table.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::ClusterRollError;

/// Restart progress of a single node.
///
/// A node only ever moves forward along
/// `Pending -> Paused -> ReadyToRestart -> Restarted -> Resumed -> Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum RestartState {
    /// Nothing done yet. Persisted as the empty string.
    #[default]
    Pending,
    /// Node drained and paused.
    Paused,
    /// Resume-after-reboot helper registered, about to restart.
    ReadyToRestart,
    /// Restart issued. Written before the reboot so it survives it.
    Restarted,
    /// Node resumed after the reboot.
    Resumed,
    /// Node finished, helper removed.
    Complete,
}

impl RestartState {
    /// All states in progression order.
    pub const ALL: [RestartState; 6] = [
        RestartState::Pending,
        RestartState::Paused,
        RestartState::ReadyToRestart,
        RestartState::Restarted,
        RestartState::Resumed,
        RestartState::Complete,
    ];

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartState::Pending => "",
            RestartState::Paused => "Paused",
            RestartState::ReadyToRestart => "ReadyToRestart",
            RestartState::Restarted => "Restarted",
            RestartState::Resumed => "Resumed",
            RestartState::Complete => "Complete",
        }
    }

    /// Check if this is the final state.
    pub fn is_final(&self) -> bool {
        matches!(self, RestartState::Complete)
    }

    /// The single successor state, if any.
    pub fn next(&self) -> Option<RestartState> {
        match self {
            RestartState::Pending => Some(RestartState::Paused),
            RestartState::Paused => Some(RestartState::ReadyToRestart),
            RestartState::ReadyToRestart => Some(RestartState::Restarted),
            RestartState::Restarted => Some(RestartState::Resumed),
            RestartState::Resumed => Some(RestartState::Complete),
            RestartState::Complete => None,
        }
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[RestartState] {
        match self {
            RestartState::Pending => &[RestartState::Paused],
            RestartState::Paused => &[RestartState::ReadyToRestart],
            RestartState::ReadyToRestart => &[RestartState::Restarted],
            RestartState::Restarted => &[RestartState::Resumed],
            RestartState::Resumed => &[RestartState::Complete],
            RestartState::Complete => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: RestartState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for RestartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartState::Pending => write!(f, "Pending"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl FromStr for RestartState {
    type Err = ClusterRollError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("Pending") {
            return Ok(RestartState::Pending);
        }
        RestartState::ALL
            .iter()
            .skip(1)
            .find(|state| state.as_str().eq_ignore_ascii_case(trimmed))
            .copied()
            .ok_or_else(|| ClusterRollError::UnknownState(trimmed.to_string()))
    }
}

impl Serialize for RestartState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RestartState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(RestartState::Pending),
            Some(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
