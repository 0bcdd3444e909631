// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `cmig join` command - Replicate from a source node.

use std::path::PathBuf;

use super::CliError;

pub async fn execute(
    config_path: &str,
    source: &str,
    bundle_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    validate_source(source)?;
    tracing::info!(source = %source, "Starting follower node");

    let runner = super::start_node(config_path).await?;
    runner.join(source.to_string(), bundle_path).await?;
    println!("▶ Joining {}", source);

    super::finish(runner).await
}

fn validate_source(addr: &str) -> Result<(), CliError> {
    let invalid = || CliError::InvalidSource {
        addr: addr.to_string(),
    };
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(()),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_source() {
        assert!(validate_source("10.0.0.1:1234").is_ok());
        assert!(validate_source("[::1]:1234").is_ok());
        assert!(validate_source("node-a:1234").is_ok());
        assert!(validate_source("10.0.0.1").is_err());
        assert!(validate_source(":1234").is_err());
        assert!(validate_source("10.0.0.1:0").is_err());
        assert!(validate_source("10.0.0.1:http").is_err());
    }
}
