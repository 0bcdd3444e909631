// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Remote replica / upstream peer addressing.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::Port;

/// A node receiving replication from us, or the node we depend on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub host: String,
    pub rpc_port: Port,
    /// Dump root the replica advertised in its Join. Informational only:
    /// the replica's `TransferServer` always writes under its own configured
    /// root, so the sender never picks remote paths.
    pub dump_path: PathBuf,
    pub file_transfer_port: Port,
}

impl RemoteTarget {
    pub fn new(
        host: impl Into<String>,
        rpc_port: Port,
        dump_path: impl Into<PathBuf>,
        file_transfer_port: Port,
    ) -> Self {
        Self {
            host: host.into(),
            rpc_port,
            dump_path: dump_path.into(),
            file_transfer_port,
        }
    }

    pub fn rpc_addr(&self) -> String {
        format_addr(&self.host, self.rpc_port)
    }

    pub fn file_transfer_addr(&self) -> String {
        format_addr(&self.host, self.file_transfer_port)
    }

    /// Identity of the target for replication bookkeeping.
    /// Two registrations from the same RPC endpoint are the same replica.
    pub fn key(&self) -> String {
        self.rpc_addr()
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rpc_addr())
    }
}

fn format_addr(host: &str, port: Port) -> String {
    // Bare IPv6 literals need brackets to carry a port.
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses() {
        let t = RemoteTarget::new(
            "10.0.0.2",
            Port::new(1234).unwrap(),
            "/dumps",
            Port::new(2222).unwrap(),
        );
        assert_eq!(t.rpc_addr(), "10.0.0.2:1234");
        assert_eq!(t.file_transfer_addr(), "10.0.0.2:2222");
        assert_eq!(t.key(), t.rpc_addr());
    }

    #[test]
    fn test_ipv6_address() {
        let t = RemoteTarget::new(
            "::1",
            Port::new(1234).unwrap(),
            "/dumps",
            Port::new(2222).unwrap(),
        );
        assert_eq!(t.rpc_addr(), "[::1]:1234");
    }
}
