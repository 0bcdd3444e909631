// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `cmig listen` command - Wait for an incoming migration.

pub async fn execute(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting standby node");

    let runner = super::start_node(config_path).await?;
    println!(
        "▶ Waiting for a migration on port {}",
        runner.config().node.rpc_port
    );

    super::finish(runner).await
}
