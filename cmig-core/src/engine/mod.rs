// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpoint/restore engine adapter.
//!
//! The runner never snapshots anything itself; it drives an external engine
//! through [`CheckpointEngine`]. All calls block for the duration of the
//! external tool and must be issued from a blocking task.

mod runc;

use std::path::Path;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

pub use runc::RuncEngine;

use crate::error::EngineError;
use crate::types::ContainerId;

/// Exit status runc reports for a container killed by SIGKILL.
pub const CHECKPOINT_EXIT_STATUS: i32 = 137;

/// How a container process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerExit {
    /// Exited on its own with the given status.
    Exited(i32),
    /// Killed as part of a checkpoint; not a failure.
    Checkpointed,
}

impl ContainerExit {
    pub fn from_code(code: i32) -> Self {
        if code == CHECKPOINT_EXIT_STATUS {
            Self::Checkpointed
        } else {
            Self::Exited(code)
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        if let Some(code) = status.code() {
            return Self::from_code(code);
        }
        match status.signal() {
            Some(sig) if Signal::try_from(sig) == Ok(Signal::SIGKILL) => Self::Checkpointed,
            Some(sig) => Self::Exited(128 + sig),
            None => Self::Exited(-1),
        }
    }
}

impl std::fmt::Display for ContainerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {}", code),
            Self::Checkpointed => write!(f, "killed by checkpoint"),
        }
    }
}

/// External snapshot/restore machinery.
pub trait CheckpointEngine: Send + Sync + 'static {
    /// Create and start the container; returns when it exits.
    fn run(&self, id: &ContainerId, bundle: &Path) -> Result<ContainerExit, EngineError>;

    /// Incremental memory snapshot, leaving the container running.
    fn pre_dump(
        &self,
        id: &ContainerId,
        image_path: &Path,
        parent_path: Option<&str>,
    ) -> Result<(), EngineError>;

    /// Full snapshot.
    fn dump(
        &self,
        id: &ContainerId,
        image_path: &Path,
        parent_path: Option<&str>,
        leave_running: bool,
    ) -> Result<(), EngineError>;

    /// Restore the container from `image_path`; returns when it exits.
    fn restore(
        &self,
        id: &ContainerId,
        image_path: &Path,
        bundle: &Path,
    ) -> Result<ContainerExit, EngineError>;

    fn kill(&self, id: &ContainerId) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    #[test]
    fn test_exit_code_137_is_checkpoint() {
        assert_eq!(ContainerExit::from_code(137), ContainerExit::Checkpointed);
        assert_eq!(ContainerExit::from_code(0), ContainerExit::Exited(0));
        assert_eq!(ContainerExit::from_code(1), ContainerExit::Exited(1));
    }

    #[test]
    fn test_exit_status_by_signal() {
        // Raw wait status: low 7 bits carry the terminating signal.
        let killed = ExitStatus::from_raw(libc_sigkill());
        assert_eq!(ContainerExit::from_status(killed), ContainerExit::Checkpointed);

        let exited = ExitStatus::from_raw(3 << 8);
        assert_eq!(ContainerExit::from_status(exited), ContainerExit::Exited(3));
    }

    fn libc_sigkill() -> i32 {
        Signal::SIGKILL as i32
    }
}
