// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Shared runner state.
//!
//! One async mutex guards the chain, the closed chain, the target list and
//! the status register. Status and target list writes go through the lock;
//! reads of either use a watch receiver and never block, so pinging
//! replicas does not wait behind a dump in progress.

use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, oneshot, watch, Mutex, MutexGuard, Notify};

use crate::chain::DumpChain;
use crate::engine::ContainerExit;
use crate::error::{EngineError, StateTransitionError};
use crate::state::RunnerStatus;
use crate::target::RemoteTarget;
use crate::types::ContainerId;

/// Outcome of a container process started by run or restore.
#[derive(Debug)]
pub struct ContainerEvent {
    pub container_id: ContainerId,
    pub action: &'static str,
    pub result: Result<ContainerExit, EngineError>,
}

/// Everything mutated under the context lock.
#[derive(Debug)]
pub struct ContextState {
    pub container_id: Option<ContainerId>,
    pub bundle_path: Option<PathBuf>,
    /// Dumps since the last full dump.
    pub chain: DumpChain,
    /// Chain closed by the last full dump, kept until replicas drain it.
    pub prev_chain: Option<DumpChain>,
    targets: Vec<RemoteTarget>,
    targets_tx: watch::Sender<Vec<RemoteTarget>>,
    /// RPC address of the upstream node, if this node is a follower.
    pub source: Option<String>,
    /// Whether a run/restore process is currently alive.
    pub container_live: bool,
    /// Waiting Joining handler, completed by a JoinAck.
    pub(crate) join_waiter: Option<oneshot::Sender<ContainerId>>,
    status: watch::Sender<RunnerStatus>,
}

impl ContextState {
    pub fn status(&self) -> RunnerStatus {
        *self.status.borrow()
    }

    /// Validate and apply a status transition.
    pub fn set_status(&mut self, to: RunnerStatus) -> Result<(), StateTransitionError> {
        let from = self.status();
        from.check_transition(to)?;
        self.status.send_replace(to);
        tracing::info!(from = %from, to = %to, "Runner status changed");
        Ok(())
    }

    pub fn targets(&self) -> &[RemoteTarget] {
        &self.targets
    }

    /// Register a replica. Returns false if it was already registered.
    pub fn add_target(&mut self, target: RemoteTarget) -> bool {
        let key = target.key();
        if self.targets.iter().any(|t| t.key() == key) {
            return false;
        }
        tracing::info!(replica = %target, "Registered replication target");
        self.targets.push(target);
        self.targets_tx.send_replace(self.targets.clone());
        true
    }

    pub fn remove_target(&mut self, key: &str) -> Option<RemoteTarget> {
        let pos = self.targets.iter().position(|t| t.key() == key)?;
        let removed = self.targets.remove(pos);
        self.targets_tx.send_replace(self.targets.clone());
        tracing::warn!(replica = %removed, "Removed replication target");
        Some(removed)
    }

    /// Open a fresh chain, retaining the current one as the closed chain.
    pub fn close_chain(&mut self) {
        let closed = std::mem::take(&mut self.chain);
        tracing::debug!(length = closed.len(), "Closed dump chain");
        self.prev_chain = Some(closed);
    }
}

/// State shared by the runner loop, the listeners and the supervisor.
#[derive(Debug)]
pub struct RunnerContext {
    state: Mutex<ContextState>,
    status_rx: watch::Receiver<RunnerStatus>,
    targets_rx: watch::Receiver<Vec<RemoteTarget>>,
    ping: Notify,
    exit_tx: mpsc::UnboundedSender<ContainerEvent>,
    exit_rx: StdMutex<Option<mpsc::UnboundedReceiver<ContainerEvent>>>,
}

impl Default for RunnerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerContext {
    pub fn new() -> Self {
        let (status_tx, status_rx) = watch::channel(RunnerStatus::Stopped);
        let (targets_tx, targets_rx) = watch::channel(Vec::new());
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(ContextState {
                container_id: None,
                bundle_path: None,
                chain: DumpChain::new(),
                prev_chain: None,
                targets: Vec::new(),
                targets_tx,
                source: None,
                container_live: false,
                join_waiter: None,
                status: status_tx,
            }),
            status_rx,
            targets_rx,
            ping: Notify::new(),
            exit_tx,
            exit_rx: StdMutex::new(Some(exit_rx)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().await
    }

    /// Lock-free status read; may be stale by the time it is used.
    pub fn status(&self) -> RunnerStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunnerStatus> {
        self.status_rx.clone()
    }

    /// Lock-free copy of the registered targets.
    pub fn targets(&self) -> Vec<RemoteTarget> {
        self.targets_rx.borrow().clone()
    }

    /// Take the lock and apply a transition.
    pub async fn transition(&self, to: RunnerStatus) -> Result<(), StateTransitionError> {
        self.lock().await.set_status(to)
    }

    /// Apply `to` only if the status is still `from`.
    /// Returns false when something else changed the status meanwhile.
    pub async fn transition_from(
        &self,
        from: RunnerStatus,
        to: RunnerStatus,
    ) -> Result<bool, StateTransitionError> {
        let mut state = self.lock().await;
        if state.status() != from {
            return Ok(false);
        }
        state.set_status(to)?;
        Ok(true)
    }

    /// Record a ping from upstream.
    pub fn notify_ping(&self) {
        self.ping.notify_one();
    }

    /// Resolves on the next ping, or at once if one arrived unobserved.
    pub async fn ping_received(&self) {
        self.ping.notified().await;
    }

    pub fn exit_sender(&self) -> mpsc::UnboundedSender<ContainerEvent> {
        self.exit_tx.clone()
    }

    /// The exit receiver can be taken once, by the supervisor.
    pub fn take_exit_receiver(&self) -> Option<mpsc::UnboundedReceiver<ContainerEvent>> {
        self.exit_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

/// Wait until the observed status differs from `status`.
pub async fn wait_while(rx: &mut watch::Receiver<RunnerStatus>, status: RunnerStatus) {
    while *rx.borrow_and_update() == status {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
