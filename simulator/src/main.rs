//! ClusterRoll Simulator
//!
//! Runs the real tick driver on every node of an in-memory cluster, one
//! simulated minute per round, and checks the rollout invariants as it goes.

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod metrics;
mod scenario;

use controller::SimulationController;
use scenario::Scenario;

/// ClusterRoll Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Rolling restart simulation against an in-memory cluster")]
struct Args {
    /// Number of simulated cluster nodes
    #[arg(short, long, default_value = "3")]
    nodes: usize,

    /// Scenario to run
    #[arg(short, long, default_value = "rolling-restart")]
    scenario: String,

    /// Random seed for reproducible tick order
    #[arg(long)]
    seed: Option<u64>,

    /// Give up when the rollout has not converged after this many rounds
    #[arg(long, default_value = "1000")]
    max_rounds: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting ClusterRoll Simulator");
    info!("Nodes: {}", args.nodes);

    let scenario = Scenario::load(&args.scenario)?;
    let mut controller = SimulationController::new(args.nodes, args.seed, args.max_rounds);
    controller.run_scenario(scenario).await?;

    let metrics = controller.get_metrics();
    info!("Simulation complete");
    info!("Rounds: {}", metrics.rounds);
    info!(
        "Ticks: {} (transitions {}, waits {}, idle {}, errors {})",
        metrics.ticks, metrics.transitions, metrics.waits, metrics.idle, metrics.errors
    );
    info!("Reboots: {}", metrics.reboots);
    info!("Cleanups: {}", metrics.cleanups);
    info!("Invariant violations: {}", metrics.invariant_violations);
    info!("Refused starts: {}", metrics.refused_starts);
    info!("Transition rate: {:.2}", metrics.transition_rate());
    info!("Rounds per transition: {:.2}", metrics.rounds_per_transition());

    Ok(())
}
