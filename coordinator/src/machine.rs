//! Pure rolling-restart transition function.
//!
//! `tick` looks at the persisted blob and a live snapshot and decides what
//! the local node should do. It performs no I/O: the driver fetches the
//! snapshot, applies the returned action and writes the new state.

use serde::Serialize;

use clusterroll_common::{
    booted_since, ClusterRollError, NodeName, RestartState, Result, StateBlob, Timestamp,
};

use crate::environment::{Environment, NodeLiveState, NodeStatus, NodeStatusInfo};

/// Side effect attached to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    /// Pause the node and drain its roles.
    Drain,
    /// Register the local at-startup task that re-enables the coordinator.
    RegisterResumeTask,
    /// Restart the node.
    Reboot,
    /// Resume the node without failback.
    Resume,
    /// Remove the local at-startup task.
    RemoveResumeTask,
}

impl Action {
    /// Whether the new state must be written before the action runs.
    ///
    /// Only a reboot needs this: the process does not come back from it.
    pub fn persist_first(&self) -> bool {
        matches!(self, Action::Reboot)
    }

    /// The action taken when leaving `state`.
    pub fn leaving(state: RestartState) -> Option<Action> {
        match state {
            RestartState::Pending => Some(Action::Drain),
            RestartState::Paused => Some(Action::RegisterResumeTask),
            RestartState::ReadyToRestart => Some(Action::Reboot),
            RestartState::Restarted => Some(Action::Resume),
            RestartState::Resumed => Some(Action::RemoveResumeTask),
            RestartState::Complete => None,
        }
    }
}

/// Why a tick did nothing this time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WaitReason {
    /// Live node state does not match what the transition needs.
    NodeNotReady {
        expected_state: String,
        expected_status: String,
        actual_state: String,
        actual_status: String,
    },
    /// Storage jobs are still running on the node.
    StorageJobsActive(usize),
    /// `Restarted` is recorded but the node has not booted since the
    /// coordinator task started.
    StaleBoot {
        last_boot: Timestamp,
        boundary: Option<Timestamp>,
    },
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Decision {
    /// Move the local node forward.
    Advance {
        node: NodeName,
        from: RestartState,
        to: RestartState,
        action: Action,
    },
    /// The action leaving `from` already took effect but the new state was
    /// never written. Write it without repeating the action.
    Record {
        node: NodeName,
        from: RestartState,
        to: RestartState,
    },
    /// Precondition not met, try again next tick.
    Wait(WaitReason),
    /// Another node holds the turn.
    NotMyTurn { current: NodeName },
    /// All nodes done and this node owns the quorum group: remove the
    /// coordinator task.
    Cleanup,
    /// All nodes done, cleanup belongs to another node.
    Idle { quorum_owner: NodeName },
}

impl Decision {
    /// Check if this decision changes anything.
    pub fn is_noop(&self) -> bool {
        matches!(
            self,
            Decision::Wait(_) | Decision::NotMyTurn { .. } | Decision::Idle { .. }
        )
    }
}

/// Decide the local node's next step.
pub fn tick(blob: &StateBlob, env: &Environment) -> Result<Decision> {
    if blob.entry(&env.local_node).is_none() {
        return Err(ClusterRollError::MissingNode(env.local_node.clone()));
    }

    let current = match blob.current_turn() {
        Some(entry) => entry,
        None => {
            return Ok(if env.owns_quorum() {
                Decision::Cleanup
            } else {
                Decision::Idle {
                    quorum_owner: env.quorum_owner.clone(),
                }
            });
        }
    };

    if current.name != env.local_node {
        return Ok(Decision::NotMyTurn {
            current: current.name.clone(),
        });
    }

    let live = env
        .local_status()
        .ok_or_else(|| ClusterRollError::MissingNode(env.local_node.clone()))?;

    let from = current.state;
    if let Some(to) = already_applied(from, live, env) {
        return Ok(Decision::Record {
            node: current.name.clone(),
            from,
            to,
        });
    }

    let (state, status) = required_live_status(from);
    if !live.is(&state, &status) {
        return Ok(Decision::Wait(WaitReason::NodeNotReady {
            expected_state: state.to_string(),
            expected_status: status.to_string(),
            actual_state: live.state.to_string(),
            actual_status: live.status.to_string(),
        }));
    }

    match from {
        RestartState::Pending | RestartState::Resumed if !env.storage_jobs.is_empty() => {
            return Ok(Decision::Wait(WaitReason::StorageJobsActive(
                env.storage_jobs.len(),
            )));
        }
        RestartState::Restarted => {
            if !fresh_boot(env) {
                return Ok(Decision::Wait(WaitReason::StaleBoot {
                    last_boot: env.last_boot,
                    boundary: env.task_start_boundary,
                }));
            }
        }
        _ => {}
    }

    // current_turn never yields a Complete entry, so both exist.
    let (to, action) = match (from.next(), Action::leaving(from)) {
        (Some(to), Some(action)) => (to, action),
        _ => {
            return Err(ClusterRollError::InvalidTransition {
                node: current.name.clone(),
                from,
                to: from,
            })
        }
    };

    Ok(Decision::Advance {
        node: current.name.clone(),
        from,
        to,
        action,
    })
}

/// State the node has already reached when the live status shows the
/// action leaving `from` completed. Only drain and resume leave a trace
/// the cluster reports; the other actions are safe to repeat.
fn already_applied(
    from: RestartState,
    live: &NodeStatus,
    env: &Environment,
) -> Option<RestartState> {
    match from {
        RestartState::Pending
            if live.is(&NodeLiveState::Paused, &NodeStatusInfo::DrainCompleted) =>
        {
            Some(RestartState::Paused)
        }
        RestartState::Restarted
            if live.is(&NodeLiveState::Up, &NodeStatusInfo::Normal) && fresh_boot(env) =>
        {
            Some(RestartState::Resumed)
        }
        _ => None,
    }
}

/// Whether the node booted after the coordinator task started.
fn fresh_boot(env: &Environment) -> bool {
    env.task_start_boundary
        .map(|boundary| booted_since(env.last_boot, boundary))
        .unwrap_or(false)
}

/// Live state/status a node must report before leaving `state`.
fn required_live_status(state: RestartState) -> (NodeLiveState, NodeStatusInfo) {
    match state {
        RestartState::Pending | RestartState::Resumed | RestartState::Complete => {
            (NodeLiveState::Up, NodeStatusInfo::Normal)
        }
        RestartState::Paused | RestartState::ReadyToRestart => {
            (NodeLiveState::Paused, NodeStatusInfo::DrainCompleted)
        }
        RestartState::Restarted => (NodeLiveState::Paused, NodeStatusInfo::Normal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::StorageJob;
    use chrono::{Duration, Utc};
    use clusterroll_common::NodeEntry;

    fn blob(states: &[(&str, RestartState)]) -> StateBlob {
        StateBlob::from_entries(
            states
                .iter()
                .map(|(name, state)| NodeEntry::new(*name, *state))
                .collect(),
        )
        .unwrap()
    }

    fn healthy_env(local: &str, names: &[&str]) -> Environment {
        let boundary = Utc::now() - Duration::hours(1);
        Environment {
            local_node: NodeName::new(local),
            nodes: names
                .iter()
                .map(|n| NodeStatus::new(*n, NodeLiveState::Up, NodeStatusInfo::Normal))
                .collect(),
            storage_jobs: Vec::new(),
            quorum_owner: NodeName::new(names[0]),
            last_boot: boundary - Duration::days(10),
            task_start_boundary: Some(boundary),
        }
    }

    fn set_live(env: &mut Environment, node: &str, state: NodeLiveState, status: NodeStatusInfo) {
        let entry = env
            .nodes
            .iter_mut()
            .find(|n| n.name.matches(node))
            .unwrap();
        entry.state = state;
        entry.status = status;
    }

    fn advance_to(decision: &Decision) -> (RestartState, Action) {
        match decision {
            Decision::Advance { to, action, .. } => (*to, *action),
            other => panic!("expected advance, got {:?}", other),
        }
    }

    #[test]
    fn test_first_node_drains() {
        let b = StateBlob::new(["A", "B", "C"]).unwrap();
        let env = healthy_env("A", &["A", "B", "C"]);

        let decision = tick(&b, &env).unwrap();
        assert_eq!(advance_to(&decision), (RestartState::Paused, Action::Drain));
    }

    #[test]
    fn test_other_nodes_wait_their_turn() {
        let b = StateBlob::new(["A", "B", "C"]).unwrap();
        for local in ["B", "C"] {
            let env = healthy_env(local, &["A", "B", "C"]);
            let decision = tick(&b, &env).unwrap();
            assert_eq!(
                decision,
                Decision::NotMyTurn {
                    current: NodeName::new("A")
                }
            );
            assert!(decision.is_noop());
        }
    }

    #[test]
    fn test_full_sequence_for_one_node() {
        let names = ["A", "B"];
        let mut env = healthy_env("A", &names);
        let mut b = StateBlob::new(names).unwrap();

        // Pending -> Paused
        let (to, _) = advance_to(&tick(&b, &env).unwrap());
        b.advance(&env.local_node, to).unwrap();
        set_live(&mut env, "A", NodeLiveState::Paused, NodeStatusInfo::DrainCompleted);

        // Paused -> ReadyToRestart
        let (to, action) = advance_to(&tick(&b, &env).unwrap());
        assert_eq!(action, Action::RegisterResumeTask);
        b.advance(&env.local_node, to).unwrap();

        // ReadyToRestart -> Restarted
        let (to, action) = advance_to(&tick(&b, &env).unwrap());
        assert_eq!(action, Action::Reboot);
        assert!(action.persist_first());
        b.advance(&env.local_node, to).unwrap();

        // Reboot: node comes back paused with a fresh boot time.
        set_live(&mut env, "A", NodeLiveState::Paused, NodeStatusInfo::Normal);
        env.last_boot = Utc::now();

        let (to, action) = advance_to(&tick(&b, &env).unwrap());
        assert_eq!(action, Action::Resume);
        b.advance(&env.local_node, to).unwrap();
        set_live(&mut env, "A", NodeLiveState::Up, NodeStatusInfo::Normal);

        let (to, action) = advance_to(&tick(&b, &env).unwrap());
        assert_eq!(action, Action::RemoveResumeTask);
        b.advance(&env.local_node, to).unwrap();

        assert_eq!(b.state_of(&NodeName::new("A")), Some(RestartState::Complete));
        assert_eq!(b.current_turn().unwrap().name.as_str(), "B");

        let env_b = healthy_env("B", &names);
        assert_eq!(advance_to(&tick(&b, &env_b).unwrap()).1, Action::Drain);
    }

    #[test]
    fn test_unrecorded_drain_is_recorded() {
        let b = StateBlob::new(["A", "B"]).unwrap();
        let mut env = healthy_env("A", &["A", "B"]);
        set_live(&mut env, "A", NodeLiveState::Paused, NodeStatusInfo::DrainCompleted);

        let decision = tick(&b, &env).unwrap();
        assert_eq!(
            decision,
            Decision::Record {
                node: NodeName::new("A"),
                from: RestartState::Pending,
                to: RestartState::Paused,
            }
        );
        assert!(!decision.is_noop());

        // Storage jobs only gate a drain that has not happened yet.
        env.storage_jobs.push(StorageJob {
            name: "Repair".into(),
            state: "Running".into(),
            percent_complete: 10,
        });
        assert!(matches!(tick(&b, &env).unwrap(), Decision::Record { .. }));
    }

    #[test]
    fn test_unrecorded_resume_is_recorded_after_fresh_boot() {
        let b = blob(&[("A", RestartState::Restarted), ("B", RestartState::Pending)]);
        let mut env = healthy_env("A", &["A", "B"]);

        // Up/Normal on the old boot is not evidence of our resume.
        assert!(matches!(
            tick(&b, &env).unwrap(),
            Decision::Wait(WaitReason::NodeNotReady { .. })
        ));

        env.last_boot = Utc::now();
        assert_eq!(
            tick(&b, &env).unwrap(),
            Decision::Record {
                node: NodeName::new("A"),
                from: RestartState::Restarted,
                to: RestartState::Resumed,
            }
        );
    }

    #[test]
    fn test_unhealthy_node_waits() {
        let b = StateBlob::new(["A", "B"]).unwrap();
        let mut env = healthy_env("A", &["A", "B"]);
        set_live(&mut env, "A", NodeLiveState::Up, NodeStatusInfo::DrainFailed);

        match tick(&b, &env).unwrap() {
            Decision::Wait(WaitReason::NodeNotReady { actual_status, .. }) => {
                assert_eq!(actual_status, "DrainFailed")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_drain_not_completed_waits() {
        let b = blob(&[("A", RestartState::Paused), ("B", RestartState::Pending)]);
        let mut env = healthy_env("A", &["A", "B"]);
        set_live(&mut env, "A", NodeLiveState::Paused, NodeStatusInfo::DrainInProgress);

        assert!(matches!(
            tick(&b, &env).unwrap(),
            Decision::Wait(WaitReason::NodeNotReady { .. })
        ));
    }

    #[test]
    fn test_storage_jobs_block_drain_and_completion() {
        let job = StorageJob {
            name: "Repair".into(),
            state: "Running".into(),
            percent_complete: 40,
        };

        let b = StateBlob::new(["A"]).unwrap();
        let mut env = healthy_env("A", &["A"]);
        env.storage_jobs.push(job.clone());
        assert_eq!(
            tick(&b, &env).unwrap(),
            Decision::Wait(WaitReason::StorageJobsActive(1))
        );

        let b = blob(&[("A", RestartState::Resumed)]);
        assert_eq!(
            tick(&b, &env).unwrap(),
            Decision::Wait(WaitReason::StorageJobsActive(1))
        );

        // Jobs do not matter while paused.
        let b = blob(&[("A", RestartState::Paused)]);
        set_live(&mut env, "A", NodeLiveState::Paused, NodeStatusInfo::DrainCompleted);
        assert!(matches!(tick(&b, &env).unwrap(), Decision::Advance { .. }));
    }

    #[test]
    fn test_stale_boot_refuses_resume() {
        let b = blob(&[("A", RestartState::Restarted), ("B", RestartState::Pending)]);
        let mut env = healthy_env("A", &["A", "B"]);
        set_live(&mut env, "A", NodeLiveState::Paused, NodeStatusInfo::Normal);

        match tick(&b, &env).unwrap() {
            Decision::Wait(WaitReason::StaleBoot { boundary, .. }) => {
                assert_eq!(boundary, env.task_start_boundary)
            }
            other => panic!("unexpected {:?}", other),
        }

        env.task_start_boundary = None;
        assert!(matches!(
            tick(&b, &env).unwrap(),
            Decision::Wait(WaitReason::StaleBoot { .. })
        ));
    }

    #[test]
    fn test_cleanup_only_on_quorum_owner() {
        let b = blob(&[("A", RestartState::Complete), ("B", RestartState::Complete)]);

        let mut env = healthy_env("B", &["A", "B"]);
        env.quorum_owner = NodeName::new("b");
        assert_eq!(tick(&b, &env).unwrap(), Decision::Cleanup);

        let mut env = healthy_env("A", &["A", "B"]);
        env.quorum_owner = NodeName::new("B");
        assert_eq!(
            tick(&b, &env).unwrap(),
            Decision::Idle {
                quorum_owner: NodeName::new("B")
            }
        );
    }

    #[test]
    fn test_missing_local_node_is_an_error() {
        let b = StateBlob::new(["A", "B"]).unwrap();
        let env = healthy_env("Z", &["A", "B", "Z"]);
        assert!(matches!(
            tick(&b, &env),
            Err(ClusterRollError::MissingNode(_))
        ));

        let env = healthy_env("A", &["B"]);
        assert!(matches!(
            tick(&b, &env),
            Err(ClusterRollError::MissingNode(_))
        ));
    }

    #[test]
    fn test_node_names_match_case_insensitively() {
        let b = StateBlob::new(["HV01", "HV02"]).unwrap();
        let env = healthy_env("hv01", &["hv01", "hv02"]);
        assert!(matches!(tick(&b, &env).unwrap(), Decision::Advance { .. }));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn live_pair() -> impl Strategy<Value = (NodeLiveState, NodeStatusInfo)> {
            prop_oneof![
                Just((NodeLiveState::Up, NodeStatusInfo::Normal)),
                Just((NodeLiveState::Paused, NodeStatusInfo::DrainCompleted)),
                Just((NodeLiveState::Paused, NodeStatusInfo::Normal)),
                Just((NodeLiveState::Down, NodeStatusInfo::Normal)),
            ]
        }

        proptest! {
            #[test]
            fn only_the_turn_advances_one_step(
                states in prop::collection::vec(prop::sample::select(RestartState::ALL.to_vec()), 1..6),
                local in 0usize..6,
                live in live_pair(),
                fresh_boot in any::<bool>(),
            ) {
                let names: Vec<String> = (0..states.len()).map(|i| format!("N{}", i)).collect();
                let local = names[local % names.len()].clone();
                let entries = names
                    .iter()
                    .zip(&states)
                    .map(|(n, s)| NodeEntry::new(n.as_str(), *s))
                    .collect();
                let b = StateBlob::from_entries(entries).unwrap();

                let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
                let mut env = healthy_env(&local, &name_refs);
                set_live(&mut env, &local, live.0, live.1);
                if fresh_boot {
                    env.last_boot = Utc::now();
                }

                let decision = tick(&b, &env).unwrap();
                if let Decision::Advance { node, from, to, .. } | Decision::Record { node, from, to } = decision {
                    let turn = b.current_turn().unwrap();
                    prop_assert_eq!(&node, &turn.name);
                    prop_assert_eq!(&node, &env.local_node);
                    prop_assert_eq!(from, turn.state);
                    prop_assert_eq!(Some(to), from.next());
                }
            }
        }
    }
}
