//! ClusterRoll Binary
//!
//! With no command, runs one tick of the rolling restart on this node. The
//! cluster-wide scheduled task invokes it that way once a minute.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};

use clusterroll_common::{ClusterRollError, NodeName, StateBlob};
use clusterroll_coordinator::powershell::{PowerShell, PowerShellCluster};
use clusterroll_coordinator::transcript::{init_logging, Transcript};
use clusterroll_coordinator::{
    ControlPlane, CoordinatorConfig, Driver, FileStateStore, RolloutStatus, StateStore,
    StoreConfig, TaskDescriptionStore, TickReport,
};

/// Exit code for failures the next tick retries (EX_TEMPFAIL).
const EXIT_RETRY: u8 = 75;

/// ClusterRoll CLI
#[derive(Parser, Debug)]
#[command(name = "clusterroll")]
#[command(about = "Rolling restart of failover cluster nodes")]
struct Args {
    /// Do not write a transcript file
    #[arg(long)]
    skip_transcript: bool,

    /// Do not write log lines to the console
    #[arg(long)]
    skip_text_output: bool,

    /// Print the command result as JSON
    #[arg(long)]
    json: bool,

    /// Cluster name of this node
    #[arg(long)]
    node: Option<String>,

    /// Keep the rollout state in this file instead of the task description
    #[arg(long)]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Register the coordinator task on the cluster
    Start {
        /// Register the task disabled
        #[arg(long)]
        suspended: bool,

        /// Coordinator executable path, identical on every node
        #[arg(long)]
        path: Option<String>,
    },
    /// Remove the coordinator task
    Stop,
    /// Reset every node to the start of the rollout
    Restart,
    /// Disable the coordinator task
    Suspend,
    /// Enable the coordinator task
    Resume {
        /// Run from the at-startup helper: retry while the cluster service starts
        #[arg(long)]
        at_boot: bool,
    },
    /// Show rollout progress
    Status,
    /// Run one tick on this node
    Tick,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Stop => "stop",
            Command::Restart => "restart",
            Command::Suspend => "suspend",
            Command::Resume { .. } => "resume",
            Command::Status => "status",
            Command::Tick => "tick",
        }
    }
}

/// Result of a command.
#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Report {
    Tick(TickReport),
    Start { nodes: StateBlob },
    Restart { nodes: StateBlob },
    Status(RolloutStatus),
    Stop,
    Suspend,
    Resume,
}

impl Args {
    /// Apply CLI overrides on top of environment configuration.
    fn apply(&self, config: &mut CoordinatorConfig) {
        if let Some(node) = &self.node {
            config.node_name = Some(node.clone());
        }
        if let Some(path) = &self.state_file {
            config.store = StoreConfig::File { path: path.clone() };
        }
        if self.skip_transcript {
            config.transcript.enabled = false;
        }
        if self.skip_text_output {
            config.console_output = false;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = CoordinatorConfig::from_env();
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let node = NodeName::new(config.node_name.clone().unwrap_or_default());

    let transcript = if config.transcript.enabled {
        match Transcript::open(
            &config.transcript.directory,
            &node,
            config.transcript.retention_days,
        ) {
            Ok(transcript) => Some(transcript),
            Err(e) => {
                eprintln!("Transcript unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    if let Err(e) = init_logging(
        &config.log_level,
        config.console_output,
        transcript.clone(),
    ) {
        eprintln!("Logging unavailable: {}", e);
    }

    let command = args.command.clone().unwrap_or(Command::Tick);
    info!(node = %node, command = command.name(), "ClusterRoll starting");

    let code = match run(command, &config, node).await {
        Ok(report) => {
            print_report(&report, args.json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            let cause = e.downcast_ref::<ClusterRollError>();
            let code = cause.map(|c| c.error_code()).unwrap_or("INTERNAL");
            let retryable = cause.map(|c| c.is_retryable()).unwrap_or(false);
            if retryable {
                warn!(error = %format!("{:#}", e), code, "Aborted, retrying on the next tick");
            } else {
                error!(error = %format!("{:#}", e), code, "Failed");
            }
            if args.json {
                println!(
                    "{}",
                    serde_json::json!({ "error": code, "message": format!("{:#}", e) })
                );
            }
            if retryable {
                ExitCode::from(EXIT_RETRY)
            } else {
                ExitCode::FAILURE
            }
        }
    };

    if let Some(transcript) = transcript {
        if let Err(e) = transcript.close() {
            eprintln!("Transcript close failed: {}", e);
        }
    }
    code
}

async fn run(
    command: Command,
    config: &CoordinatorConfig,
    node: NodeName,
) -> anyhow::Result<Report> {
    let name = command.name();
    let adapters = PowerShellCluster::new(
        PowerShell::new(config.powershell.clone()),
        node,
        config.quorum_group.clone(),
    );

    let result = match &config.store {
        StoreConfig::TaskDescription => {
            let store = TaskDescriptionStore::new(adapters.clone(), config.task.name.clone());
            execute(command, config, adapters, store).await
        }
        StoreConfig::File { path } => {
            execute(command, config, adapters, FileStateStore::new(path.clone())).await
        }
    };
    result.with_context(|| format!("{} failed", name))
}

async fn execute<S: StateStore>(
    command: Command,
    config: &CoordinatorConfig,
    adapters: PowerShellCluster,
    store: S,
) -> Result<Report, ClusterRollError> {
    match command {
        Command::Tick => Driver::new(
            adapters.clone(),
            adapters.clone(),
            store,
            adapters,
            config.scheduled_task(),
        )
        .tick()
        .await
        .map(Report::Tick),
        Command::Start { suspended, path } => control(config, adapters, store)
            .start(suspended, path.as_deref())
            .await
            .map(|nodes| Report::Start { nodes }),
        Command::Stop => control(config, adapters, store)
            .stop()
            .await
            .map(|_| Report::Stop),
        Command::Restart => control(config, adapters, store)
            .restart()
            .await
            .map(|nodes| Report::Restart { nodes }),
        Command::Suspend => control(config, adapters, store)
            .suspend()
            .await
            .map(|_| Report::Suspend),
        Command::Resume { at_boot: false } => control(config, adapters, store)
            .resume()
            .await
            .map(|_| Report::Resume),
        Command::Resume { at_boot: true } => control(config, adapters, store)
            .resume_after_boot()
            .await
            .map(|_| Report::Resume),
        Command::Status => control(config, adapters, store)
            .status()
            .await
            .map(Report::Status),
    }
}

fn control<S: StateStore>(
    config: &CoordinatorConfig,
    adapters: PowerShellCluster,
    store: S,
) -> ControlPlane<PowerShellCluster, PowerShellCluster, S> {
    ControlPlane::new(adapters.clone(), adapters, store, config.scheduled_task())
}

fn print_report(report: &Report, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Cannot encode report: {}", e),
        }
        return;
    }

    if let Report::Status(status) = report {
        println!("Phase: {:?}", status.phase);
        println!(
            "Complete: {}/{}",
            status.progress.complete,
            status.progress.total()
        );
        if let Some(turn) = &status.current_turn {
            println!("Current turn: {}", turn);
        }
        for entry in &status.nodes {
            println!("  {:<20} {}", entry.name.to_string(), entry.state);
        }
    }
}
