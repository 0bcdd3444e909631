// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Outbound RPC calls.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::message::{Join, Migrate, RpcMessage, RpcReply};
use crate::error::RpcError;
use crate::types::ContainerId;

/// Issues one request per connection and waits for the reply line.
#[derive(Debug, Clone)]
pub struct RpcClient {
    rpc_timeout: Duration,
    ping_timeout: Duration,
}

impl RpcClient {
    /// `rpc_timeout` bounds Join and Migrate, `ping_timeout` bounds Ping.
    pub fn new(rpc_timeout: Duration, ping_timeout: Duration) -> Self {
        Self {
            rpc_timeout,
            ping_timeout,
        }
    }

    pub async fn join(&self, addr: &str, join: Join) -> Result<ContainerId, RpcError> {
        match self
            .call(addr, &RpcMessage::Join(join), self.rpc_timeout)
            .await?
        {
            RpcReply::Joined { container_id } => {
                ContainerId::new(container_id).map_err(|e| RpcError::Malformed {
                    tag: "Joined".to_string(),
                    reason: e.to_string(),
                })
            }
            RpcReply::Error { reason } => Err(RpcError::Rejected { reason }),
            RpcReply::Ack => Err(RpcError::UnexpectedReply { request: "Join" }),
        }
    }

    pub async fn ping(&self, addr: &str) -> Result<(), RpcError> {
        let reply = self.call(addr, &RpcMessage::Ping, self.ping_timeout).await?;
        expect_ack(reply, "Ping")
    }

    pub async fn migrate(&self, addr: &str, migrate: Migrate) -> Result<(), RpcError> {
        let reply = self
            .call(addr, &RpcMessage::Migrate(migrate), self.rpc_timeout)
            .await?;
        expect_ack(reply, "Migrate")
    }

    /// Send one message and read its reply, bounded by `timeout`.
    pub async fn call(
        &self,
        addr: &str,
        msg: &RpcMessage,
        timeout: Duration,
    ) -> Result<RpcReply, RpcError> {
        tracing::debug!(addr = addr, tag = msg.tag(), "Sending RPC");
        tokio::time::timeout(timeout, exchange(addr, msg))
            .await
            .map_err(|_| RpcError::Timeout {
                addr: addr.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }
}

fn expect_ack(reply: RpcReply, request: &'static str) -> Result<(), RpcError> {
    match reply {
        RpcReply::Ack => Ok(()),
        RpcReply::Error { reason } => Err(RpcError::Rejected { reason }),
        RpcReply::Joined { .. } => Err(RpcError::UnexpectedReply { request }),
    }
}

async fn exchange(addr: &str, msg: &RpcMessage) -> Result<RpcReply, RpcError> {
    let transport = |source: std::io::Error| RpcError::Transport {
        addr: addr.to_string(),
        source,
    };

    let mut line = msg.encode()?;
    line.push('\n');

    let stream = TcpStream::connect(addr).await.map_err(transport)?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(line.as_bytes()).await.map_err(transport)?;
    writer.flush().await.map_err(transport)?;

    let mut reply = String::new();
    let n = BufReader::new(reader)
        .read_line(&mut reply)
        .await
        .map_err(transport)?;
    if n == 0 {
        // The listener drops messages it cannot handle without replying.
        return Err(transport(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed without reply",
        )));
    }

    serde_json::from_str(reply.trim_end()).map_err(|e| RpcError::Malformed {
        tag: "reply".to_string(),
        reason: e.to_string(),
    })
}
