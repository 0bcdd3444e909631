// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `cmig migrate` command - Hand the running container off.

use cmig_core::control::{send_command, ControlCommand};
use cmig_core::ContainerId;

pub async fn execute(config_path: &str, container_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let id = ContainerId::new(container_id)?;
    let config = super::load_config(config_path)?;
    let socket = &config.node.control_socket;

    tracing::info!(container_id = %id, socket = %socket.display(), "Requesting migration");

    match send_command(socket, &ControlCommand::Migrate(id.clone())).await {
        Ok(()) => {
            println!("✓ Migration of {} started", id);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Migration request failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
