// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Runner status register with typed transitions.
//!
//! The status decides what the runner loop does next. Transient statuses
//! (Migrating, Restoring, Joining, Recovery, Terminated) run their handler
//! exactly once per entry. Invalid transitions result in
//! StateTransitionError.

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;

/// Runner lifecycle statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnerStatus {
    /// Not started yet, or stopped after handing the container off.
    Stopped,

    /// Started, waiting to run a container or to receive one.
    StandBy,

    /// Container is running and being dumped on cadence.
    Running,

    /// Handing the container off to the first target.
    Migrating,

    /// Restoring the container from the latest dump of the chain.
    Restoring,

    /// Registering with the configured source as a replica.
    Joining,

    /// Upstream went silent; rebuilding the chain from local storage.
    Recovery,

    /// Unrecoverable error. Operator must restart.
    Failed,

    /// Termination signal received; killing the container.
    Terminated,
}

impl RunnerStatus {
    /// Get the status name for logs and error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::StandBy => "StandBy",
            Self::Running => "Running",
            Self::Migrating => "Migrating",
            Self::Restoring => "Restoring",
            Self::Joining => "Joining",
            Self::Recovery => "Recovery",
            Self::Failed => "Failed",
            Self::Terminated => "Terminated",
        }
    }

    /// Statuses whose handler runs exactly once per entry.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Migrating | Self::Restoring | Self::Joining | Self::Recovery | Self::Terminated
        )
    }

    /// Statuses the runner loop exits on.
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Check if transition to the target status is valid.
    pub fn can_transition_to(&self, target: RunnerStatus) -> bool {
        if target == Self::Terminated {
            return *self != Self::Terminated;
        }
        matches!(
            (self, target),
            // From Stopped
            (Self::Stopped, Self::StandBy) |
            // From StandBy
            (Self::StandBy, Self::Running) |
            (Self::StandBy, Self::Restoring) |
            (Self::StandBy, Self::Recovery) |
            (Self::StandBy, Self::Joining) |
            // From Running
            (Self::Running, Self::Migrating) |
            (Self::Running, Self::Stopped) |
            (Self::Running, Self::Failed) |
            // From Migrating
            (Self::Migrating, Self::Stopped) |
            (Self::Migrating, Self::Failed) |
            // From Restoring
            (Self::Restoring, Self::Running) |
            (Self::Restoring, Self::Failed) |
            // From Joining
            (Self::Joining, Self::StandBy) |
            (Self::Joining, Self::Failed) |
            // From Recovery
            (Self::Recovery, Self::Restoring) |
            (Self::Recovery, Self::Failed) |
            // From Terminated
            (Self::Terminated, Self::Stopped) |
            (Self::Terminated, Self::Failed)
        )
    }

    /// Validate a transition without applying it.
    pub fn check_transition(&self, target: RunnerStatus) -> Result<(), StateTransitionError> {
        if *self == Self::Failed {
            return Err(StateTransitionError::TerminalState { state: self.name() });
        }
        if !self.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                from: self.name(),
                to: target.name(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
