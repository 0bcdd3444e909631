// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `cmig checkpoint` command - Take a manual full dump.

use cmig_core::control::{send_command, ControlCommand};

pub async fn execute(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let socket = &config.node.control_socket;

    tracing::info!(socket = %socket.display(), "Requesting checkpoint");

    send_command(socket, &ControlCommand::Checkpoint).await?;
    println!("✓ Checkpoint taken");
    Ok(())
}
