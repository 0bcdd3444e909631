// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

pub mod checkpoint;
pub mod join;
pub mod listen;
pub mod migrate;
pub mod run;
pub mod validate;

use std::path::Path;
use std::sync::Arc;

use cmig_core::{Config, ConfigLoader, FrameAuth, RuncEngine, Runner, RunnerStatus, TcpTransfer};
use thiserror::Error;

pub const DEFAULT_CONFIG: &str = "cmig.yaml";

/// A node driving runc and replicating over TCP.
pub type NodeRunner = Runner<RuncEngine, TcpTransfer>;

/// Errors raised by the CLI itself.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Runner ended in status {status}")]
    RunnerFailed { status: RunnerStatus },

    #[error("Invalid source address '{addr}': expected host:port")]
    InvalidSource { addr: String },
}

/// Load the configuration. A missing default file means built-in defaults;
/// an explicitly named file must exist.
pub fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    if path == DEFAULT_CONFIG && !Path::new(path).exists() {
        tracing::info!(config = %path, "No configuration file, using defaults");
        return Ok(Config::default());
    }
    Ok(ConfigLoader::load_file(path)?)
}

/// Build a node from configuration and start its listeners.
pub async fn start_node(config_path: &str) -> Result<Arc<NodeRunner>, Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;

    if !nix::unistd::Uid::effective().is_root() {
        tracing::warn!("Not running as root, runc checkpoint and restore will likely fail");
    }

    let engine = RuncEngine::new(&config.engine)?;
    let transfer = TcpTransfer::new(
        &config.node.dump_path,
        FrameAuth::new(config.transfer.secret.as_deref()),
        config.migration.rpc_timeout,
    );

    let runner = Arc::new(Runner::new(config, engine, transfer));
    runner.start().await?;
    Ok(runner)
}

/// Drive the runner to completion and map its final status to an exit.
pub async fn finish(runner: Arc<NodeRunner>) -> Result<(), Box<dyn std::error::Error>> {
    match runner.wait().await {
        RunnerStatus::Stopped => {
            println!("✓ Node stopped");
            Ok(())
        }
        status => Err(CliError::RunnerFailed { status }.into()),
    }
}
