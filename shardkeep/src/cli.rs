use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// ShardKeep hosts sharded, stateful entities across a fleet of runners and
/// keeps a single shard manager's view of ownership consistent with them.
#[derive(Parser, Debug)]
#[command(name = "", version)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "shardkeep.toml")]
    pub config: PathBuf,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the runner process.
    Run {
        /// Override `general.port` from the config file.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Check the configuration file for errors.
    Configcheck,
}
