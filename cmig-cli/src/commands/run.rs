// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `cmig run` command - Start a primary node and run a container.

use std::path::PathBuf;

use cmig_core::ContainerId;

pub async fn execute(
    config_path: &str,
    container_id: &str,
    bundle_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    // Fail fast on a bad id before binding anything
    let id = ContainerId::new(container_id)?;
    tracing::info!(container_id = %id, bundle = %bundle_path.display(), "Starting primary node");

    let runner = super::start_node(config_path).await?;
    runner.run_container(id.clone(), bundle_path).await?;

    let config = runner.config();
    println!("▶ Running {}", id);
    println!(
        "  Dumping every {}ms, full dump every {} dumps",
        config.migration.dump_interval.as_millis(),
        config.migration.dump_frequency
    );
    println!("  Control socket: {}", config.node.control_socket.display());

    super::finish(runner).await
}
