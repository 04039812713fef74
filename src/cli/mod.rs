//! Command-line interface for Meridian.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Meridian - cluster-state coordination and shard recovery.
#[derive(Parser)]
#[command(name = "meridian")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long, env = "MERIDIAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "MERIDIAN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start a single-node cluster
    Node {
        /// Node ID
        #[arg(short, long, env = "MERIDIAN_NODE_ID")]
        node_id: Option<String>,

        /// Cluster name
        #[arg(long, env = "MERIDIAN_CLUSTER_NAME")]
        cluster_name: Option<String>,

        /// Serve Prometheus metrics on this address
        #[arg(long)]
        metrics_addr: Option<String>,
    },

    /// Run an in-process cluster through index creation, writes and a node
    /// failure
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// Primary shards of the simulated index
        #[arg(long, default_value_t = 2)]
        shards: u32,

        /// Replicas per primary
        #[arg(long, default_value_t = 1)]
        replicas: u32,

        /// Documents written before the node failure
        #[arg(long, default_value_t = 100)]
        documents: usize,

        /// Keep every node running
        #[arg(long)]
        no_failure: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Show version information
    Version,
}

/// Configuration subcommands.
#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Check a configuration file
    Validate {
        /// File to check
        path: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
