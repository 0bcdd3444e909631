// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! cmig Core Library
//!
//! Live migration of containers through incremental checkpoints.
//! Provides the dump model and chain, replication to standby nodes, the
//! node-to-node RPC protocol, the local control channel, the checkpoint
//! engine adapter and the runner state machine tying them together.

pub mod chain;
pub mod config;
pub mod context;
pub mod control;
pub mod dump;
pub mod engine;
pub mod error;
pub mod rpc;
pub mod runner;
pub mod state;
pub mod target;
pub mod transfer;
pub mod types;

// Re-export commonly used types
pub use chain::DumpChain;
pub use config::{Config, ConfigLoader};
pub use context::RunnerContext;
pub use dump::{Dump, DumpKind};
pub use engine::{CheckpointEngine, ContainerExit, RuncEngine};
pub use error::{CmigError, CmigResult, HardValidationError};
pub use runner::Runner;
pub use state::RunnerStatus;
pub use target::RemoteTarget;
pub use transfer::{DumpTransfer, FrameAuth, TcpTransfer, TransferServer};
pub use types::{ContainerId, Port};
