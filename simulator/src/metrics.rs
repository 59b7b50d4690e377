//! Simulation metrics.

/// Simulation metrics.
#[derive(Debug, Clone, Default)]
pub struct SimulationMetrics {
    /// Rounds run.
    pub rounds: u64,
    /// Ticks across all nodes.
    pub ticks: u64,
    /// Ticks that advanced a node.
    pub transitions: u64,
    /// Ticks that waited on a precondition.
    pub waits: u64,
    /// Ticks that had nothing to do.
    pub idle: u64,
    /// Ticks aborted by an error.
    pub errors: u64,
    /// Node boots after a restart.
    pub reboots: u64,
    /// Coordinator task removals.
    pub cleanups: u64,
    /// Start attempts refused by the control plane.
    pub refused_starts: u64,
    /// Single-writer or monotonicity violations.
    pub invariant_violations: u64,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_round(&mut self) {
        self.rounds += 1;
    }

    pub fn record_transition(&mut self) {
        self.ticks += 1;
        self.transitions += 1;
    }

    pub fn record_wait(&mut self) {
        self.ticks += 1;
        self.waits += 1;
    }

    pub fn record_idle(&mut self) {
        self.ticks += 1;
        self.idle += 1;
    }

    pub fn record_cleanup(&mut self) {
        self.ticks += 1;
        self.cleanups += 1;
    }

    pub fn record_error(&mut self) {
        self.ticks += 1;
        self.errors += 1;
    }

    pub fn record_boot(&mut self) {
        self.reboots += 1;
    }

    pub fn record_refused_start(&mut self) {
        self.refused_starts += 1;
    }

    pub fn record_violation(&mut self) {
        self.invariant_violations += 1;
    }

    /// Share of ticks that changed state.
    pub fn transition_rate(&self) -> f64 {
        if self.ticks == 0 {
            return 0.0;
        }

        self.transitions as f64 / self.ticks as f64
    }

    /// Average rounds spent per node transition.
    pub fn rounds_per_transition(&self) -> f64 {
        if self.transitions == 0 {
            return 0.0;
        }

        self.rounds as f64 / self.transitions as f64
    }
}
