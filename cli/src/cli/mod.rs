pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codex-bridge")]
#[command(author, version, about = "Prompt cache continuity bridge between coding agents and the Codex backend")]
pub struct Cli {
    /// Path to config file (checked in order: local config.toml, ~/.config/codex-bridge/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the bridge server
    Start {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show health and session metrics of a running bridge
    Status {
        /// Number of recent sessions to list
        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },

    /// Print the resolved configuration
    Config,
}
