use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use skyswarm::core::config::SwarmConfig;
use skyswarm::core::persistence::PatternArchive;
use skyswarm::simulation::Simulation;
use skyswarm::swarm::messages::Command;

#[derive(Parser)]
#[clap(author, version, about = "Drone swarm coordination and consensus simulator")]
struct Cli {
    /// Path to config file; built-in defaults are used when omitted
    #[clap(short, long)]
    config: Option<String>,

    /// Debug mode
    #[clap(short, long)]
    debug: bool,

    /// Number of ticks to simulate
    #[clap(long, default_value_t = 300)]
    ticks: u64,

    /// Number of agents to launch
    #[clap(long, default_value_t = 5)]
    agents: usize,

    /// Fail a random agent right before this tick
    #[clap(long)]
    fail_at: Option<u64>,

    /// Command to put to a vote, in wire format, e.g. '{"type":"loiter"}'
    #[clap(long)]
    propose: Option<String>,

    /// Number of agents approving the proposal
    #[clap(long, default_value_t = 3)]
    approvals: usize,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logger
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    print_banner();

    // Load configuration
    let config = match &cli.config {
        Some(path) => SwarmConfig::from_file(path)?,
        None => SwarmConfig::default(),
    };
    let data_dir = config.simulation.data_dir.clone();

    info!("Launching {} agents for {} ticks", cli.agents, cli.ticks);
    let mut simulation = Simulation::new(config, cli.agents).context("Failed to launch swarm")?;

    let archive = match &data_dir {
        Some(dir) => {
            let archive = PatternArchive::new(dir)?;
            let now = simulation.controller().tick_count();
            let restored = archive.restore(simulation.controller_mut().fusion_mut(), now)?;
            info!("Restored {} archived patterns", restored);
            Some(archive)
        }
        None => None,
    };

    if let Some(raw) = &cli.propose {
        let action: Command = serde_json::from_str(raw)
            .with_context(|| format!("Invalid command for --propose: {}", raw))?;
        simulation.propose(action, cli.approvals)?;
    }

    let summary = simulation
        .run(cli.ticks, cli.fail_at)
        .context("Simulation aborted")?;

    if let Some(archive) = &archive {
        let path = archive.save(simulation.controller().fusion(), summary.ticks)?;
        info!("Pattern archive written to {:?}", path);
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn print_banner() {
    println!("\n====================================================");
    println!("  SKYSWARM - Drone Swarm Coordination v0.1.0");
    println!("====================================================\n");
}
