// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! cmig CLI
//!
//! Command-line interface for live container migration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// cmig - Live container migration through incremental checkpoints
#[derive(Parser)]
#[command(name = "cmig")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = commands::DEFAULT_CONFIG)]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a primary node and run a container
    Run {
        /// Container identifier passed to runc
        #[arg(long)]
        container_id: String,

        /// Path to the OCI bundle
        #[arg(long, default_value = ".")]
        bundle_path: PathBuf,
    },

    /// Start an idle node that waits for a migration
    Listen,

    /// Start a follower replicating from a source node
    Join {
        /// RPC address of the source node (host:port)
        #[arg(long)]
        source: String,

        /// Path to the OCI bundle used if this node has to restore
        #[arg(long, default_value = ".")]
        bundle_path: PathBuf,
    },

    /// Ask the local node to migrate its container to the first replica
    Migrate {
        /// Container identifier the node is expected to run
        #[arg(long)]
        container_id: String,
    },

    /// Ask the local node to take a manual checkpoint
    Checkpoint,

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Dispatch to command handlers
    match cli.command {
        Commands::Run {
            container_id,
            bundle_path,
        } => commands::run::execute(&cli.config, &container_id, bundle_path).await,
        Commands::Listen => commands::listen::execute(&cli.config).await,
        Commands::Join {
            source,
            bundle_path,
        } => commands::join::execute(&cli.config, &source, bundle_path).await,
        Commands::Migrate { container_id } => {
            commands::migrate::execute(&cli.config, &container_id).await
        }
        Commands::Checkpoint => commands::checkpoint::execute(&cli.config).await,
        Commands::Validate { file } => commands::validate::execute(&file).await,
    }
}
