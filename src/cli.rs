//! CLI definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Tickwork timer node
#[derive(Parser, Debug)]
#[command(name = "tickwork-node")]
#[command(version)]
#[command(about = "Durable timer events for a clustered process engine")]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "TICKWORK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the configured node id
    #[arg(long, global = true)]
    pub node_id: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the dispatcher until SIGTERM/SIGINT
    Run,

    /// Enable a recurring timer start event on a process definition
    EnableStart {
        /// Process definition id
        #[arg(short, long)]
        definition: String,

        /// Start node name
        #[arg(short, long, default_value = "timerStart")]
        node: String,

        /// Cycle expression (seconds through day-of-week, optional year)
        #[arg(short = 'e', long)]
        cycle: String,
    },

    /// Disable every timer start event of a process definition
    DisableStart {
        /// Process definition id
        #[arg(short, long)]
        definition: String,
    },

    /// Delete canceled job rows older than the retention window
    Prune {
        /// Retention in hours
        #[arg(long, default_value_t = 24)]
        retention_hours: i64,
    },

    /// Validate the configuration and print the effective values
    CheckConfig,
}
