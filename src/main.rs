//! Meridian CLI - Main entry point.

use meridian::cli::{Cli, Commands, ConfigCommands};
use meridian::config::MeridianConfig;
use meridian::simulate::{run_simulation, SimulationOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let mut config = match &cli.config {
        Some(path) => MeridianConfig::from_file(path)?,
        None => MeridianConfig::development(),
    };
    config.observability.log_level = cli.log_level.clone();

    match cli.command {
        Commands::Node {
            node_id,
            cluster_name,
            metrics_addr,
        } => {
            if let Some(id) = node_id {
                config.node.name = id.clone();
                config.node.id = id;
            }
            if let Some(name) = cluster_name {
                config.node.cluster_name = name;
            }
            if let Some(addr) = metrics_addr {
                config.observability.metrics_addr = addr.parse()?;
                config.observability.metrics_enabled = true;
            }
            config.validate()?;

            meridian::run(config).await?;
        }

        Commands::Simulate {
            nodes,
            shards,
            replicas,
            documents,
            no_failure,
            json,
        } => {
            meridian::observability::init(&config.observability)?;
            let options = SimulationOptions {
                nodes,
                shards,
                replicas,
                documents,
                fail_node: !no_failure,
                ..SimulationOptions::default()
            };
            let report = run_simulation(config, options).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Simulation finished in {}ms", report.took_ms);
                println!("  Cluster state version: {}", report.version);
                println!("  Nodes: {}", report.nodes);
                println!("  Started copies: {}", report.started_copies);
                println!("  Unassigned copies: {}", report.unassigned_copies);
                if let Some(node) = &report.removed_node {
                    println!("  Removed node: {}", node);
                }
                println!("  Mapping fields: {}", report.mapping_fields.join(", "));
            }
        }

        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigCommands::Validate { path } => match MeridianConfig::from_file(&path) {
                Ok(_) => println!("Configuration OK: {}", path.display()),
                Err(e) => {
                    eprintln!("Invalid configuration {}: {}", path.display(), e);
                    std::process::exit(1);
                }
            },
        },

        Commands::Version => {
            println!("Meridian v{}", env!("CARGO_PKG_VERSION"));
            println!("Cluster-state coordination and shard recovery");
        }
    }

    Ok(())
}
