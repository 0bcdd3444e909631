// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Node-to-node RPC protocol.
//!
//! Connection-oriented request/reply over TCP carrying newline-delimited
//! JSON. Join and Migrate need a reply value; Ping is acknowledged but the
//! caller only cares whether the ack arrived within its timeout.

mod client;
mod message;
mod server;

pub use client::RpcClient;
pub use message::{Join, JoinAck, Migrate, RpcMessage, RpcReply};
pub use server::{RpcHandler, RpcServer};
