// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! All types validate their invariants at creation time, so values that
//! arrive over the wire or from configuration are checked exactly once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Maximum container id length accepted by runc.
const MAX_CONTAINER_ID_LEN: usize = 1024;

/// Validated container identifier.
/// Must be non-empty and contain only characters runc accepts
/// (alphanumerics, `-`, `_`, `.`); it must not contain whitespace since it
/// travels inside space-separated control commands.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();
        match Self::rejection(&id) {
            None => Ok(Self(id)),
            Some(reason) => Err(HardValidationError::InvalidFieldValue {
                field: "container_id",
                value: id,
                reason,
            }),
        }
    }

    fn rejection(id: &str) -> Option<String> {
        if id.is_empty() {
            return Some("Container ID cannot be empty".to_string());
        }
        if id.len() > MAX_CONTAINER_ID_LEN {
            return Some(format!(
                "Container ID too long: {} chars (max {})",
                id.len(),
                MAX_CONTAINER_ID_LEN
            ));
        }
        if id.chars().all(|c| c == '.') {
            return Some("Container ID cannot consist of dots only".to_string());
        }
        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
        if let Some(bad) = id.chars().find(|c| !allowed(*c)) {
            return Some(format!("Container ID contains invalid character {:?}", bad));
        }
        None
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

/// Validated network port.
/// Must be in range 1-65535 (0 is reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Port(u16);

impl Port {
    /// Create a new Port with validation.
    pub fn new(port: u16) -> Result<Self, HardValidationError> {
        if port == 0 {
            return Err(HardValidationError::InvalidPort {
                port,
                reason: "Port 0 is reserved and cannot be used".to_string(),
            });
        }
        Ok(Self(port))
    }

    /// Get the inner port value.
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for Port {
    type Error = HardValidationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}
