// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Migration orchestrator.
//!
//! The [`Runner`] loop reads the current status and dispatches to exactly one
//! handler. Long-running statuses (StandBy, Running) keep their handler
//! until the status changes; transient statuses run their handler once and
//! apply the transition it returns. The RPC listener, the control socket,
//! the container supervisor and the signal watcher all run as separate
//! tasks and only touch the shared [`RunnerContext`].

mod cadence;
mod handlers;
mod remote;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub use cadence::{checkpoint_base, final_pre_dump, next_cadence_dump};

use crate::config::Config;
use crate::context::{ContainerEvent, ContextState, RunnerContext};
use crate::control::ControlServer;
use crate::dump::{Dump, DumpKind};
use crate::engine::{CheckpointEngine, ContainerExit};
use crate::error::{CmigError, CmigResult, EngineError};
use crate::rpc::{RpcClient, RpcServer};
use crate::state::RunnerStatus;
use crate::transfer::{DumpTransfer, FrameAuth, TransferServer};
use crate::types::ContainerId;

/// Per-node state machine driving checkpoints, replication and handoff.
pub struct Runner<E, T> {
    config: Config,
    ctx: RunnerContext,
    engine: Arc<E>,
    transfer: T,
    rpc: RpcClient,
}

impl<E: CheckpointEngine, T: DumpTransfer + 'static> Runner<E, T> {
    pub fn new(config: Config, engine: E, transfer: T) -> Self {
        let rpc = RpcClient::new(config.migration.rpc_timeout, config.migration.ping_timeout);
        Self {
            config,
            ctx: RunnerContext::new(),
            engine: Arc::new(engine),
            transfer,
            rpc,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context(&self) -> &RunnerContext {
        &self.ctx
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    /// Bind the RPC, file transfer and control listeners, start the
    /// background tasks and move Stopped -> StandBy.
    pub async fn start(self: &Arc<Self>) -> CmigResult<()> {
        let node = &self.config.node;

        std::fs::create_dir_all(&node.dump_path).map_err(|e| CmigError::Io {
            context: "creating dump directory",
            source: e,
        })?;

        let rpc_listener = TcpListener::bind((node.rpc_host.as_str(), node.rpc_port.value()))
            .await
            .map_err(|e| CmigError::Io {
                context: "binding RPC listener",
                source: e,
            })?;
        let transfer_listener =
            TcpListener::bind((node.rpc_host.as_str(), node.file_transfer_port.value()))
                .await
                .map_err(|e| CmigError::Io {
                    context: "binding file transfer listener",
                    source: e,
                })?;
        let control = ControlServer::bind(&node.control_socket, Arc::clone(self))?;

        let receiver = Arc::new(TransferServer::new(
            &node.dump_path,
            FrameAuth::new(self.config.transfer.secret.as_deref()),
        ));

        tokio::spawn(RpcServer::new(Arc::clone(self)).serve(rpc_listener));
        tokio::spawn(receiver.serve(transfer_listener));
        tokio::spawn(control.serve());
        self.spawn_background();

        self.ctx.transition(RunnerStatus::StandBy).await?;

        tracing::info!(
            rpc_port = %node.rpc_port,
            file_transfer_port = %node.file_transfer_port,
            dump_path = %node.dump_path.display(),
            "Runner started"
        );
        Ok(())
    }

    /// Start the container supervisor and the signal watcher.
    pub fn spawn_background(self: &Arc<Self>) {
        if let Some(exits) = self.ctx.take_exit_receiver() {
            tokio::spawn(Arc::clone(self).supervise(exits));
        }
        tokio::spawn(Arc::clone(self).watch_signals());
    }

    /// Run a fresh container as the primary: StandBy -> Running.
    pub async fn run_container(&self, id: ContainerId, bundle: PathBuf) -> CmigResult<()> {
        let mut state = self.ctx.lock().await;
        state.set_status(RunnerStatus::Running)?;
        state.container_id = Some(id.clone());
        state.bundle_path = Some(bundle.clone());

        tracing::info!(container_id = %id, bundle = %bundle.display(), "Running container");
        self.launch(&mut state, id, "run", move |engine, id| engine.run(id, &bundle));
        Ok(())
    }

    /// Become a follower of `source`: StandBy -> Joining.
    pub async fn join(&self, source: String, bundle: PathBuf) -> CmigResult<()> {
        let mut state = self.ctx.lock().await;
        state.source = Some(source);
        state.bundle_path = Some(bundle);
        state.set_status(RunnerStatus::Joining)?;
        Ok(())
    }

    /// Drive the state machine until a final status is reached.
    pub async fn wait(&self) -> RunnerStatus {
        loop {
            let status = self.ctx.status();
            if status.is_final() {
                return status;
            }
            self.step().await;
        }
    }

    /// Run the handler for the current status once.
    pub async fn step(&self) {
        let status = self.ctx.status();
        let next = match status {
            RunnerStatus::Stopped | RunnerStatus::Failed => return,
            RunnerStatus::StandBy => return self.run_standby().await,
            RunnerStatus::Running => return self.run_running().await,
            RunnerStatus::Migrating => self.run_migrating().await,
            RunnerStatus::Restoring => self.run_restoring().await,
            RunnerStatus::Joining => self.run_joining().await,
            RunnerStatus::Recovery => self.run_recovery().await,
            RunnerStatus::Terminated => self.run_terminated().await,
        };

        match self.ctx.transition_from(status, next).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                from = %status,
                to = %next,
                "Status changed while handler ran, dropping transition"
            ),
            Err(e) => tracing::error!(error = %e, "Handler produced an invalid transition"),
        }
    }

    /// Invoke the engine for one dump on a blocking task.
    async fn engine_dump(
        &self,
        id: &ContainerId,
        dump: Dump,
        parent: Option<String>,
        leave_running: bool,
    ) -> Result<(), EngineError> {
        let engine = Arc::clone(&self.engine);
        let id = id.clone();
        let image = dump.path_in(&self.config.node.dump_path);

        tokio::task::spawn_blocking(move || match dump.kind() {
            DumpKind::PreDump => engine.pre_dump(&id, &image, parent.as_deref()),
            DumpKind::FullDump | DumpKind::Checkpoint => {
                engine.dump(&id, &image, parent.as_deref(), leave_running)
            }
        })
        .await
        .map_err(|e| EngineError::TaskAborted {
            reason: e.to_string(),
        })?
    }

    /// Start a container-owning engine call. Its exit is reported to the
    /// supervisor.
    fn launch<F>(&self, state: &mut ContextState, id: ContainerId, action: &'static str, f: F)
    where
        F: FnOnce(&E, &ContainerId) -> Result<ContainerExit, EngineError> + Send + 'static,
    {
        state.container_live = true;
        let engine = Arc::clone(&self.engine);
        let exits = self.ctx.exit_sender();

        tokio::spawn(async move {
            let task_id = id.clone();
            let result = tokio::task::spawn_blocking(move || f(&*engine, &task_id))
                .await
                .unwrap_or_else(|e| {
                    Err(EngineError::TaskAborted {
                        reason: e.to_string(),
                    })
                });
            let _ = exits.send(ContainerEvent {
                container_id: id,
                action,
                result,
            });
        });
    }

    async fn supervise(self: Arc<Self>, mut exits: mpsc::UnboundedReceiver<ContainerEvent>) {
        while let Some(event) = exits.recv().await {
            let mut state = self.ctx.lock().await;
            if state.container_id.as_ref() == Some(&event.container_id) {
                state.container_live = false;
            }

            let next = match &event.result {
                Ok(ContainerExit::Checkpointed) => {
                    tracing::info!(
                        container_id = %event.container_id,
                        action = event.action,
                        "Container stopped by checkpoint"
                    );
                    None
                }
                Ok(ContainerExit::Exited(code)) => {
                    tracing::info!(
                        container_id = %event.container_id,
                        action = event.action,
                        exit_code = code,
                        "Container exited"
                    );
                    Some(RunnerStatus::Stopped)
                }
                Err(e) => {
                    tracing::error!(
                        container_id = %event.container_id,
                        action = event.action,
                        error = %e,
                        "Container failed"
                    );
                    Some(RunnerStatus::Failed)
                }
            };

            if let Some(next) = next {
                if state.status() == RunnerStatus::Running {
                    if let Err(e) = state.set_status(next) {
                        tracing::error!(error = %e, "Failed to record container exit");
                    }
                }
            }
        }
    }

    async fn watch_signals(self: Arc<Self>) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Failed to listen for SIGINT");
                        return;
                    }
                }
                _ = term.recv() => {}
            }

            tracing::info!("Termination signal received");
            if let Err(e) = self.ctx.transition(RunnerStatus::Terminated).await {
                tracing::warn!(error = %e, "Ignoring termination signal");
            }
        }
    }
}
