// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `cmig validate` command - Validate configuration file.

use cmig_core::ConfigLoader;

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Node:");
            println!(
                "  RPC Address:        {}:{}",
                config.node.rpc_host, config.node.rpc_port
            );
            println!("  File Transfer Port: {}", config.node.file_transfer_port);
            println!("  Dump Directory:     {}", config.node.dump_path.display());
            println!(
                "  Control Socket:     {}",
                config.node.control_socket.display()
            );
            println!();
            println!("Migration:");
            println!(
                "  Dump Interval:      {}ms (full dump every {})",
                config.migration.dump_interval.as_millis(),
                config.migration.dump_frequency
            );
            println!(
                "  Ping Interval:      {}ms (timeout {}ms)",
                config.migration.ping_interval.as_millis(),
                config.migration.ping_timeout.as_millis()
            );
            println!(
                "  Liveness Timeout:   {}ms",
                config.migration.liveness_timeout.as_millis()
            );
            println!(
                "  RPC Timeout:        {}ms",
                config.migration.rpc_timeout.as_millis()
            );
            println!();
            println!("Engine:");
            match &config.engine.runc_path {
                Some(path) => println!("  runc:               {}", path.display()),
                None => println!("  runc:               (discovered)"),
            }
            println!("  TCP Established:    {}", config.engine.tcp_established);
            println!("  Shell Job:          {}", config.engine.shell_job);
            println!(
                "  Frame Auth:         {}",
                if config.transfer.secret.is_some() {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
