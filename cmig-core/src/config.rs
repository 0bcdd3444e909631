// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! The configuration is validated once at boot and then passed to the
//! components that need it. Any invalid field results in a
//! HardValidationError that prevents startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CmigError, CmigResult, HardValidationError};
use crate::types::Port;

/// Raw node configuration as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNodeConfig {
    #[serde(default = "default_rpc_host")]
    rpc_host: String,
    #[serde(default = "default_rpc_port")]
    rpc_port: u16,
    #[serde(default = "default_file_transfer_port")]
    file_transfer_port: u16,
    #[serde(default = "default_dump_path")]
    dump_path: String,
    #[serde(default = "default_control_socket")]
    control_socket: String,
}

fn default_rpc_host() -> String {
    "0.0.0.0".to_string()
}

fn default_rpc_port() -> u16 {
    1234
}

fn default_file_transfer_port() -> u16 {
    2222
}

fn default_dump_path() -> String {
    "/dumps".to_string()
}

fn default_control_socket() -> String {
    "/tmp/cmig/control.sock".to_string()
}

impl Default for RawNodeConfig {
    fn default() -> Self {
        Self {
            rpc_host: default_rpc_host(),
            rpc_port: default_rpc_port(),
            file_transfer_port: default_file_transfer_port(),
            dump_path: default_dump_path(),
            control_socket: default_control_socket(),
        }
    }
}

/// Raw migration cadence configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMigrationConfig {
    #[serde(default = "default_dump_interval_ms")]
    dump_interval_ms: u64,
    #[serde(default = "default_dump_frequency")]
    dump_frequency: u64,
    #[serde(default = "default_ping_interval_ms")]
    ping_interval_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    ping_timeout_ms: u64,
    #[serde(default = "default_liveness_timeout_ms")]
    liveness_timeout_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    rpc_timeout_ms: u64,
}

fn default_dump_interval_ms() -> u64 {
    5000
}

fn default_dump_frequency() -> u64 {
    3
}

fn default_ping_interval_ms() -> u64 {
    1000
}

fn default_ping_timeout_ms() -> u64 {
    3000
}

fn default_liveness_timeout_ms() -> u64 {
    5000
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

impl Default for RawMigrationConfig {
    fn default() -> Self {
        Self {
            dump_interval_ms: default_dump_interval_ms(),
            dump_frequency: default_dump_frequency(),
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

/// Raw checkpoint engine configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEngineConfig {
    #[serde(default)]
    runc_path: Option<String>,
    #[serde(default)]
    tcp_established: bool,
    #[serde(default = "default_shell_job")]
    shell_job: bool,
}

fn default_shell_job() -> bool {
    true
}

impl Default for RawEngineConfig {
    fn default() -> Self {
        Self {
            runc_path: None,
            tcp_established: false,
            shell_job: default_shell_job(),
        }
    }
}

/// Raw transfer configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTransferConfig {
    #[serde(default)]
    secret: Option<String>,
}

/// Raw root configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    node: RawNodeConfig,
    #[serde(default)]
    migration: RawMigrationConfig,
    #[serde(default)]
    engine: RawEngineConfig,
    #[serde(default)]
    transfer: RawTransferConfig,
}

/// Validated node addressing and storage.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub rpc_host: String,
    pub rpc_port: Port,
    pub file_transfer_port: Port,
    pub dump_path: PathBuf,
    pub control_socket: PathBuf,
}

/// Validated migration cadence and timeouts.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub dump_interval: Duration,
    /// Every `dump_frequency`-th cadence dump is a full dump.
    pub dump_frequency: u64,
    pub ping_interval: Duration,
    /// Bound on a single Ping RPC issued by the primary.
    pub ping_timeout: Duration,
    /// Silence window after which a follower starts recovery.
    pub liveness_timeout: Duration,
    /// Bound on Join and Migrate RPCs.
    pub rpc_timeout: Duration,
}

/// Validated checkpoint engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub runc_path: Option<PathBuf>,
    pub tcp_established: bool,
    pub shell_job: bool,
}

/// Validated transfer settings.
#[derive(Debug, Clone, Default)]
pub struct TransferConfig {
    pub secret: Option<String>,
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub migration: MigrationConfig,
    pub engine: EngineConfig,
    pub transfer: TransferConfig,
}

impl Default for Config {
    fn default() -> Self {
        ConfigLoader::validate(RawConfig::default())
            .unwrap_or_else(|e| unreachable!("built-in defaults are valid: {}", e))
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> CmigResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(CmigError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| CmigError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> CmigResult<Config> {
        // An empty document means "all defaults".
        let raw: RawConfig = if content.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| CmigError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?
        };

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> CmigResult<Config> {
        let node = Self::validate_node(raw.node)?;
        let migration = Self::validate_migration(raw.migration)?;

        let engine = EngineConfig {
            runc_path: raw.engine.runc_path.map(PathBuf::from),
            tcp_established: raw.engine.tcp_established,
            shell_job: raw.engine.shell_job,
        };

        if let Some(secret) = &raw.transfer.secret {
            if secret.is_empty() {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "transfer.secret",
                    value: String::new(),
                    reason: "Secret must not be empty when set".to_string(),
                }
                .into());
            }
        }

        Ok(Config {
            node,
            migration,
            engine,
            transfer: TransferConfig {
                secret: raw.transfer.secret,
            },
        })
    }

    fn validate_node(raw: RawNodeConfig) -> CmigResult<NodeConfig> {
        if raw.rpc_host.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "rpc_host",
                context: "node section".to_string(),
            }
            .into());
        }

        let rpc_port = Port::new(raw.rpc_port)?;
        let file_transfer_port = Port::new(raw.file_transfer_port)?;
        if rpc_port == file_transfer_port {
            return Err(HardValidationError::InvalidPort {
                port: raw.rpc_port,
                reason: "RPC and file transfer ports must differ".to_string(),
            }
            .into());
        }

        let dump_path = PathBuf::from(&raw.dump_path);
        if !dump_path.is_absolute() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "dump_path",
                value: raw.dump_path,
                reason: "Dump path must be absolute".to_string(),
            }
            .into());
        }

        if raw.control_socket.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "control_socket",
                context: "node section".to_string(),
            }
            .into());
        }

        Ok(NodeConfig {
            rpc_host: raw.rpc_host,
            rpc_port,
            file_transfer_port,
            dump_path,
            control_socket: PathBuf::from(raw.control_socket),
        })
    }

    fn validate_migration(raw: RawMigrationConfig) -> CmigResult<MigrationConfig> {
        let positive = [
            ("dump_interval_ms", raw.dump_interval_ms),
            ("dump_frequency", raw.dump_frequency),
            ("ping_interval_ms", raw.ping_interval_ms),
            ("ping_timeout_ms", raw.ping_timeout_ms),
            ("liveness_timeout_ms", raw.liveness_timeout_ms),
            ("rpc_timeout_ms", raw.rpc_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: "0".to_string(),
                    reason: "Must be greater than 0".to_string(),
                }
                .into());
            }
        }

        if raw.liveness_timeout_ms < raw.ping_interval_ms {
            tracing::warn!(
                liveness_timeout_ms = raw.liveness_timeout_ms,
                ping_interval_ms = raw.ping_interval_ms,
                "Liveness timeout is shorter than the ping interval; followers will always recover"
            );
        }

        Ok(MigrationConfig {
            dump_interval: Duration::from_millis(raw.dump_interval_ms),
            dump_frequency: raw.dump_frequency,
            ping_interval: Duration::from_millis(raw.ping_interval_ms),
            ping_timeout: Duration::from_millis(raw.ping_timeout_ms),
            liveness_timeout: Duration::from_millis(raw.liveness_timeout_ms),
            rpc_timeout: Duration::from_millis(raw.rpc_timeout_ms),
        })
    }
}
