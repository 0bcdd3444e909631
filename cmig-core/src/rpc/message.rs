// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! RPC message types and wire codec.
//!
//! Every message travels as one JSON line `{"tag": "...", "body": {...}}`.
//! Decoding looks the tag up in [`DISPATCH`] and hands the body to the
//! variant's validating constructor, so a message that decodes is
//! well-formed by construction.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dump::Dump;
use crate::error::RpcError;
use crate::types::{ContainerId, Port};

/// A follower asks to become a replica of the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    rpc_port: Port,
    dump_path: PathBuf,
    file_transfer_port: Port,
}

impl Join {
    pub fn new(
        rpc_port: u16,
        dump_path: impl Into<PathBuf>,
        file_transfer_port: u16,
    ) -> Result<Self, RpcError> {
        let dump_path = dump_path.into();
        if !dump_path.is_absolute() {
            return Err(malformed(
                "Join",
                format!("dump path must be absolute: {}", dump_path.display()),
            ));
        }
        Ok(Self {
            rpc_port: Port::new(rpc_port).map_err(|e| malformed("Join", e))?,
            dump_path,
            file_transfer_port: Port::new(file_transfer_port).map_err(|e| malformed("Join", e))?,
        })
    }

    pub fn rpc_port(&self) -> Port {
        self.rpc_port
    }

    pub fn dump_path(&self) -> &PathBuf {
        &self.dump_path
    }

    pub fn file_transfer_port(&self) -> Port {
        self.file_transfer_port
    }
}

/// Container id handed back to a joining follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAck {
    container_id: ContainerId,
}

impl JoinAck {
    pub fn new(container_id: impl Into<String>) -> Result<Self, RpcError> {
        let container_id = ContainerId::new(container_id).map_err(|e| malformed("JoinAck", e))?;
        Ok(Self { container_id })
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }
}

/// Hand execution of a container to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migrate {
    /// Sorted ascending by sequence.
    dumps: Vec<Dump>,
    container_id: ContainerId,
    bundle_path: PathBuf,
}

impl Migrate {
    /// Validates every dump name and sorts them by sequence number.
    /// Arrival order is never trusted.
    pub fn new<S: AsRef<str>>(
        dump_names: &[S],
        container_id: impl Into<String>,
        bundle_path: impl Into<PathBuf>,
    ) -> Result<Self, RpcError> {
        if dump_names.is_empty() {
            return Err(malformed("Migrate", "empty dump list"));
        }

        let mut dumps = dump_names
            .iter()
            .map(|n| Dump::from_name(n.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| malformed("Migrate", e))?;
        dumps.sort_by_key(|d| d.sequence());

        if dumps.windows(2).any(|w| w[0].sequence() == w[1].sequence()) {
            return Err(malformed("Migrate", "duplicate dump sequence"));
        }

        let container_id = ContainerId::new(container_id).map_err(|e| malformed("Migrate", e))?;
        let bundle_path = bundle_path.into();
        if bundle_path.as_os_str().is_empty() {
            return Err(malformed("Migrate", "empty bundle path"));
        }

        Ok(Self {
            dumps,
            container_id,
            bundle_path,
        })
    }

    pub fn dumps(&self) -> &[Dump] {
        &self.dumps
    }

    pub fn dump_names(&self) -> Vec<String> {
        self.dumps.iter().map(Dump::name).collect()
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    pub fn bundle_path(&self) -> &PathBuf {
        &self.bundle_path
    }
}

/// Requests understood by the RPC listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    Join(Join),
    JoinAck(JoinAck),
    Ping,
    Migrate(Migrate),
}

/// Replies written back on the same connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum RpcReply {
    Ack,
    Joined { container_id: String },
    Error { reason: String },
}

// Wire bodies. These are only ever turned into messages through the
// validating constructors above.

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct JoinBody {
    rpc_port: u16,
    dump_path: PathBuf,
    file_transfer_port: u16,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct JoinAckBody {
    container_id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct MigrateBody {
    dump_names: Vec<String>,
    container_id: String,
    bundle_path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    tag: String,
    #[serde(default)]
    body: Value,
}

type Decoder = fn(Value) -> Result<RpcMessage, RpcError>;

/// Tag to decoder table.
const DISPATCH: &[(&str, Decoder)] = &[
    ("Join", decode_join),
    ("JoinAck", decode_join_ack),
    ("Ping", decode_ping),
    ("Migrate", decode_migrate),
];

fn decode_join(body: Value) -> Result<RpcMessage, RpcError> {
    let b: JoinBody = body_of("Join", body)?;
    Join::new(b.rpc_port, b.dump_path, b.file_transfer_port).map(RpcMessage::Join)
}

fn decode_join_ack(body: Value) -> Result<RpcMessage, RpcError> {
    let b: JoinAckBody = body_of("JoinAck", body)?;
    JoinAck::new(b.container_id).map(RpcMessage::JoinAck)
}

fn decode_ping(_body: Value) -> Result<RpcMessage, RpcError> {
    Ok(RpcMessage::Ping)
}

fn decode_migrate(body: Value) -> Result<RpcMessage, RpcError> {
    let b: MigrateBody = body_of("Migrate", body)?;
    Migrate::new(&b.dump_names, b.container_id, b.bundle_path).map(RpcMessage::Migrate)
}

fn body_of<T: DeserializeOwned>(tag: &str, body: Value) -> Result<T, RpcError> {
    serde_json::from_value(body).map_err(|e| malformed(tag, e))
}

fn malformed(tag: &str, reason: impl std::fmt::Display) -> RpcError {
    RpcError::Malformed {
        tag: tag.to_string(),
        reason: reason.to_string(),
    }
}

impl RpcMessage {
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Join(_) => "Join",
            Self::JoinAck(_) => "JoinAck",
            Self::Ping => "Ping",
            Self::Migrate(_) => "Migrate",
        }
    }

    /// Encode as a single JSON line, without the trailing newline.
    pub fn encode(&self) -> Result<String, RpcError> {
        let body = match self {
            Self::Join(j) => serde_json::to_value(JoinBody {
                rpc_port: j.rpc_port.value(),
                dump_path: j.dump_path.clone(),
                file_transfer_port: j.file_transfer_port.value(),
            }),
            Self::JoinAck(a) => serde_json::to_value(JoinAckBody {
                container_id: a.container_id.to_string(),
            }),
            Self::Ping => Ok(Value::Null),
            Self::Migrate(m) => serde_json::to_value(MigrateBody {
                dump_names: m.dump_names(),
                container_id: m.container_id.to_string(),
                bundle_path: m.bundle_path.clone(),
            }),
        }
        .map_err(|e| malformed(self.tag(), e))?;

        let envelope = Envelope {
            tag: self.tag().to_string(),
            body,
        };
        serde_json::to_string(&envelope).map_err(|e| malformed(self.tag(), e))
    }

    /// Decode one JSON line.
    pub fn decode(line: &str) -> Result<Self, RpcError> {
        let envelope: Envelope = serde_json::from_str(line).map_err(|e| malformed("<envelope>", e))?;
        let decoder = DISPATCH
            .iter()
            .find(|(tag, _)| *tag == envelope.tag)
            .map(|(_, decoder)| *decoder)
            .ok_or(RpcError::UnknownTag {
                tag: envelope.tag.clone(),
            })?;
        decoder(envelope.body)
    }
}
