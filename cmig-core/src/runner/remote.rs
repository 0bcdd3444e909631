// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Network and operator entry points.

use std::net::SocketAddr;

use super::Runner;
use crate::chain::DumpChain;
use crate::control::{ControlCommand, ControlHandler};
use crate::engine::CheckpointEngine;
use crate::error::ControlError;
use crate::rpc::{Join, JoinAck, Migrate, RpcHandler, RpcMessage, RpcReply};
use crate::state::RunnerStatus;
use crate::target::RemoteTarget;
use crate::transfer::DumpTransfer;

impl<E: CheckpointEngine, T: DumpTransfer + 'static> Runner<E, T> {
    /// Register the sender as a replica and send it everything we have.
    async fn on_join(&self, peer: SocketAddr, join: Join) -> RpcReply {
        let target = RemoteTarget::new(
            peer.ip().to_string(),
            join.rpc_port(),
            join.dump_path().clone(),
            join.file_transfer_port(),
        );

        let mut state = self.ctx.lock().await;
        let Some(id) = state.container_id.clone() else {
            return RpcReply::Error {
                reason: "no container to replicate".to_string(),
            };
        };
        state.add_target(target.clone());

        let mut sent = 0;
        if let Some(prev) = state.prev_chain.as_mut() {
            sent += prev.full_transfer(&self.transfer, &target).await;
        }
        sent += state.chain.full_transfer(&self.transfer, &target).await;

        tracing::info!(
            replica = %target,
            container_id = %id,
            transferred = sent,
            "Replica joined"
        );
        RpcReply::Joined {
            container_id: id.to_string(),
        }
    }

    /// Adopt a handed-off container and schedule its restore.
    async fn on_migrate(&self, migrate: Migrate) -> RpcReply {
        let mut state = self.ctx.lock().await;
        if state.status() != RunnerStatus::StandBy {
            return RpcReply::Error {
                reason: format!("not accepting migrations in status {}", state.status()),
            };
        }

        let root = &self.config.node.dump_path;
        if let Some(missing) = migrate.dumps().iter().find(|d| !d.path_in(root).is_dir()) {
            tracing::error!(dump = %missing, "Migrated chain references a dump not present locally");
            return RpcReply::Error {
                reason: format!("dump {} not present", missing),
            };
        }

        state.chain = DumpChain::from_dumps(migrate.dumps().iter().copied());
        state.prev_chain = None;
        state.container_id = Some(migrate.container_id().clone());
        state.bundle_path = Some(migrate.bundle_path().clone());
        state.source = None;

        tracing::info!(
            container_id = %migrate.container_id(),
            dumps = ?migrate.dump_names(),
            "Migration received"
        );
        match state.set_status(RunnerStatus::Restoring) {
            Ok(()) => RpcReply::Ack,
            Err(e) => RpcReply::Error {
                reason: e.to_string(),
            },
        }
    }

    async fn on_join_ack(&self, ack: JoinAck) -> RpcReply {
        let mut state = self.ctx.lock().await;
        match state.join_waiter.take() {
            Some(waiter) => {
                let _ = waiter.send(ack.container_id().clone());
                RpcReply::Ack
            }
            None => RpcReply::Error {
                reason: "no join in progress".to_string(),
            },
        }
    }
}

impl<E: CheckpointEngine, T: DumpTransfer + 'static> RpcHandler for Runner<E, T> {
    async fn handle(&self, peer: SocketAddr, msg: RpcMessage) -> RpcReply {
        match msg {
            RpcMessage::Join(join) => self.on_join(peer, join).await,
            RpcMessage::Ping => {
                self.ctx.notify_ping();
                RpcReply::Ack
            }
            RpcMessage::Migrate(migrate) => self.on_migrate(migrate).await,
            RpcMessage::JoinAck(ack) => self.on_join_ack(ack).await,
        }
    }
}

impl<E: CheckpointEngine, T: DumpTransfer + 'static> ControlHandler for Runner<E, T> {
    async fn execute(&self, command: ControlCommand) -> Result<(), ControlError> {
        let result = match command {
            ControlCommand::Checkpoint => self.checkpoint().await.map(|_| ()),
            ControlCommand::Migrate(id) => self.request_migration(&id).await,
        };
        result.map_err(|e| ControlError::Refused {
            reason: e.to_string(),
        })
    }
}
