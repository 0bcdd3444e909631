// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for the migration orchestrator.
//!
//! Every concern gets its own explicit enum. No `Box<dyn Error>`, no
//! `anyhow::Result` - all errors are strongly typed.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ContainerId;

/// Top-level error type for the orchestrator.
#[derive(Debug, Error)]
pub enum CmigError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Runner State Machine Errors
    // =========================================================================
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    #[error("No container assigned to this runner")]
    NoContainer,

    #[error("Container is not running (status {status})")]
    NotRunning { status: &'static str },

    #[error("Container mismatch: running {running}, requested {requested}")]
    ContainerMismatch {
        running: ContainerId,
        requested: String,
    },

    #[error("No replication target registered")]
    NoTarget,

    #[error("Chain not fully replicated to {target}")]
    SyncIncomplete { target: String },

    // =========================================================================
    // Dump / Chain Errors
    // =========================================================================
    #[error("Dump error: {0}")]
    Dump(#[from] DumpError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    #[error("Checkpoint engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Control channel error: {0}")]
    Control(#[from] ControlError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Hard validation errors cause immediate process termination.
/// Used when configuration is invalid and the node cannot safely start.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid port: {port} - {reason}")]
    InvalidPort { port: u16, reason: String },
}

/// Dump naming and discovery errors.
#[derive(Debug, Error)]
pub enum DumpError {
    /// A dump name did not match `<p|d|c><sequence>`.
    /// Treated as a local bug, never retried.
    #[error("Malformed dump name '{name}': {reason}")]
    Parse { name: String, reason: String },

    #[error("No full dump found to recover from in {dir}")]
    NoRecoverableDump { dir: PathBuf },

    #[error("Failed to scan dump directory {dir}: {source}")]
    Scan {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// On-disk chain reconstruction errors. Fatal for recovery.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Corrupt chain at {path}: 'parent' exists but is not a symlink")]
    CorruptChain { path: PathBuf },

    #[error("Failed to read chain link at {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Chain link at {path} points at a missing dump")]
    DanglingLink { path: PathBuf },

    #[error("Chain link at {path} loops back into the chain")]
    Cycle { path: PathBuf },

    #[error("Chain link at {path} does not name a dump: {source}")]
    BadLink {
        path: PathBuf,
        #[source]
        source: DumpError,
    },

    #[error("Chain is empty")]
    Empty,
}

/// Checkpoint/restore engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("runc binary not found at expected path")]
    BinaryNotFound,

    #[error("Failed to spawn {action}: {reason}")]
    SpawnFailed { action: &'static str, reason: String },

    #[error("runc {action} failed for {container_id}: {reason}")]
    CommandFailed {
        action: &'static str,
        container_id: ContainerId,
        reason: String,
    },

    #[error("Engine task aborted: {reason}")]
    TaskAborted { reason: String },
}

/// Bulk dump transfer errors. A failed transfer leaves the node unsynced.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Transfer IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Checksum mismatch for {file}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        file: String,
        expected: u32,
        actual: u32,
    },

    #[error("Transfer frame failed authentication")]
    Unauthenticated,

    #[error("Rejected transfer entry '{name}': {reason}")]
    Rejected { name: String, reason: String },

    #[error("Malformed transfer frame: {reason}")]
    MalformedFrame { reason: String },
}

/// RPC protocol errors.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC transport error talking to {addr}: {source}")]
    Transport {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("RPC to {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: String, timeout_ms: u64 },

    #[error("Unknown RPC tag: {tag}")]
    UnknownTag { tag: String },

    #[error("Malformed {tag} message: {reason}")]
    Malformed { tag: String, reason: String },

    #[error("Remote rejected RPC: {reason}")]
    Rejected { reason: String },

    #[error("Unexpected reply to {request}")]
    UnexpectedReply { request: &'static str },
}

/// Status register transition errors.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Runner is in terminal state: {state}")]
    TerminalState { state: &'static str },
}

/// Local control socket errors.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Unknown control command: {command}")]
    UnknownCommand { command: String },

    #[error("Control command '{command}' is missing an argument")]
    MissingArgument { command: &'static str },

    #[error("Control socket error at {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Command refused: {reason}")]
    Refused { reason: String },
}

/// Result type alias using CmigError.
pub type CmigResult<T> = Result<T, CmigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_validation_error_display() {
        let err = HardValidationError::MissingRequiredField {
            field: "dump_path",
            context: "node section".to_string(),
        };
        assert!(err.to_string().contains("dump_path"));
        assert!(err.to_string().contains("node section"));
    }

    #[test]
    fn test_error_chain() {
        let chain_err = ChainError::CorruptChain {
            path: PathBuf::from("/dumps/p2/parent"),
        };
        let err: CmigError = chain_err.into();
        assert!(matches!(err, CmigError::Chain(_)));
        assert!(err.to_string().contains("/dumps/p2/parent"));
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = TransferError::ChecksumMismatch {
            file: "pages-1.img".to_string(),
            expected: 0xdead_beef,
            actual: 0x0000_0001,
        };
        assert!(err.to_string().contains("0xdeadbeef"));
    }
}
