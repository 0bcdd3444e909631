// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-status handlers.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};

use super::cadence::{checkpoint_base, final_pre_dump, next_cadence_dump};
use super::Runner;
use crate::chain::{self, DumpChain};
use crate::context::wait_while;
use crate::dump::Dump;
use crate::engine::CheckpointEngine;
use crate::error::{CmigError, CmigResult, EngineError};
use crate::rpc::{Join, Migrate};
use crate::state::RunnerStatus;
use crate::transfer::DumpTransfer;
use crate::types::ContainerId;

impl<E: CheckpointEngine, T: DumpTransfer + 'static> Runner<E, T> {
    // =========================================================================
    // Running
    // =========================================================================

    /// Dump and ping on independent timers until the status changes.
    pub(super) async fn run_running(&self) {
        let dumps = async {
            let mut status = self.ctx.subscribe();
            let period = self.config.migration.dump_interval;
            let mut tick = time::interval_at(time::Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = wait_while(&mut status, RunnerStatus::Running) => return,
                    _ = tick.tick() => {
                        if let Err(e) = self.dump_tick().await {
                            tracing::warn!(error = %e, "Cadence dump failed, retrying next tick");
                        }
                    }
                }
            }
        };

        let pings = async {
            let mut status = self.ctx.subscribe();
            let period = self.config.migration.ping_interval;
            let mut tick = time::interval_at(time::Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = wait_while(&mut status, RunnerStatus::Running) => return,
                    _ = tick.tick() => {
                        self.ping_targets().await;
                    }
                }
            }
        };

        tokio::join!(dumps, pings);
    }

    /// Take one cadence dump, replicate it and close the chain on a full
    /// dump. Returns `None` if the container is no longer running.
    pub async fn dump_tick(&self) -> CmigResult<Option<Dump>> {
        let mut state = self.ctx.lock().await;
        if state.status() != RunnerStatus::Running {
            return Ok(None);
        }
        let id = state.container_id.clone().ok_or(CmigError::NoContainer)?;

        let (dump, parent) = next_cadence_dump(
            &state.chain,
            state.prev_chain.as_ref(),
            self.config.migration.dump_frequency,
        );

        let start = Instant::now();
        self.engine_dump(&id, dump, parent, true).await?;
        state.chain.push(dump);

        // A closed chain keeps draining until every replica holds its full
        // dump; otherwise a failed transfer of that dump is never retried.
        let targets = state.targets().to_vec();
        for target in &targets {
            if let Some(prev) = state.prev_chain.as_mut() {
                prev.sync(&self.transfer, target).await;
            }
            state.chain.sync(&self.transfer, target).await;
        }

        tracing::info!(
            container_id = %id,
            dump = %dump,
            chain_length = state.chain.len(),
            targets = targets.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Dump taken"
        );

        if dump.is_full_dump() {
            state.close_chain();
        }
        Ok(Some(dump))
    }

    /// Ping every target concurrently; drop the ones that fail.
    /// Returns the number of targets removed.
    ///
    /// Reads the lock-free target snapshot, so pings go out while a dump
    /// holds the context lock. The lock is only taken to drop dead targets.
    pub async fn ping_targets(&self) -> usize {
        let targets = self.ctx.targets();
        if targets.is_empty() {
            return 0;
        }

        let mut pings = JoinSet::new();
        for target in targets {
            let rpc = self.rpc.clone();
            pings.spawn(async move {
                let result = rpc.ping(&target.rpc_addr()).await;
                (target, result)
            });
        }

        let mut dead = Vec::new();
        while let Some(joined) = pings.join_next().await {
            match joined {
                Ok((target, Err(e))) => {
                    tracing::warn!(replica = %target, error = %e, "Ping failed");
                    dead.push(target);
                }
                Ok((target, Ok(()))) => tracing::trace!(replica = %target, "Ping acknowledged"),
                Err(e) => tracing::error!(error = %e, "Ping task failed"),
            }
        }

        if dead.is_empty() {
            return 0;
        }
        let mut state = self.ctx.lock().await;
        dead.iter()
            .filter(|t| state.remove_target(&t.key()).is_some())
            .count()
    }

    /// Manual full dump, leaving the container running. Not part of the
    /// chain and does not move the cadence.
    pub async fn checkpoint(&self) -> CmigResult<Dump> {
        let state = self.ctx.lock().await;
        if state.status() != RunnerStatus::Running {
            return Err(CmigError::NotRunning {
                status: state.status().name(),
            });
        }
        let id = state.container_id.clone().ok_or(CmigError::NoContainer)?;

        let dump = checkpoint_base(&state.chain, state.prev_chain.as_ref()).checkpoint();
        let image = dump.path_in(&self.config.node.dump_path);
        if image.exists() {
            // A repeated checkpoint replaces the previous image of that name.
            tokio::fs::remove_dir_all(&image)
                .await
                .map_err(|e| CmigError::Io {
                    context: "removing previous checkpoint",
                    source: e,
                })?;
        }

        self.engine_dump(&id, dump, None, true).await?;
        tracing::info!(container_id = %id, dump = %dump, "Checkpoint taken");
        Ok(dump)
    }

    /// Operator migrate command: Running -> Migrating.
    pub async fn request_migration(&self, requested: &ContainerId) -> CmigResult<()> {
        let mut state = self.ctx.lock().await;
        let running = state.container_id.clone().ok_or(CmigError::NoContainer)?;
        if running != *requested {
            return Err(CmigError::ContainerMismatch {
                running,
                requested: requested.to_string(),
            });
        }
        if state.targets().is_empty() {
            return Err(CmigError::NoTarget);
        }
        state.set_status(RunnerStatus::Migrating)?;
        Ok(())
    }

    // =========================================================================
    // Migrating
    // =========================================================================

    pub(super) async fn run_migrating(&self) -> RunnerStatus {
        match self.migrate().await {
            Ok(()) => RunnerStatus::Stopped,
            Err(e) => {
                tracing::error!(error = %e, "Migration failed");
                RunnerStatus::Failed
            }
        }
    }

    async fn migrate(&self) -> CmigResult<()> {
        let mut state = self.ctx.lock().await;
        let id = state.container_id.clone().ok_or(CmigError::NoContainer)?;
        let bundle = state.bundle_path.clone().ok_or(CmigError::NoContainer)?;
        let target = state.targets().first().cloned().ok_or(CmigError::NoTarget)?;

        let (pre, parent) = final_pre_dump(&state.chain, state.prev_chain.as_ref());
        self.engine_dump(&id, pre, parent, true).await?;
        state.chain.push(pre);

        let full = pre.next_full_dump();
        self.engine_dump(&id, full, Some(pre.parent_path()), false).await?;
        state.chain.push(full);

        let sent = state.chain.sync(&self.transfer, &target).await;
        let complete = state
            .chain
            .latest_node()
            .is_some_and(|n| n.is_synced_to(&target));
        if !complete {
            return Err(CmigError::SyncIncomplete {
                target: target.to_string(),
            });
        }

        let names = state.chain.names_oldest_first();
        drop(state);

        tracing::info!(
            container_id = %id,
            replica = %target,
            dumps = ?names,
            transferred = sent,
            "Handing container off"
        );
        let handoff = Migrate::new(names.as_slice(), id.as_str(), bundle)?;
        self.rpc.migrate(&target.rpc_addr(), handoff).await?;
        Ok(())
    }

    // =========================================================================
    // Restoring
    // =========================================================================

    pub(super) async fn run_restoring(&self) -> RunnerStatus {
        let mut state = self.ctx.lock().await;
        let (Some(id), Some(bundle)) = (state.container_id.clone(), state.bundle_path.clone())
        else {
            tracing::error!("Cannot restore without a container id and bundle");
            return RunnerStatus::Failed;
        };
        let Some(latest) = state.chain.latest().copied() else {
            tracing::error!(container_id = %id, "Cannot restore from an empty chain");
            return RunnerStatus::Failed;
        };

        let image = latest.path_in(&self.config.node.dump_path);
        tracing::info!(
            container_id = %id,
            dump = %latest,
            chain = ?state.chain.names_oldest_first(),
            "Restoring container"
        );
        self.launch(&mut state, id, "restore", move |engine, id| {
            engine.restore(id, &image, &bundle)
        });

        state.close_chain();
        RunnerStatus::Running
    }

    // =========================================================================
    // Joining
    // =========================================================================

    pub(super) async fn run_joining(&self) -> RunnerStatus {
        let (waiter, joined) = oneshot::channel();
        let source = {
            let mut state = self.ctx.lock().await;
            state.join_waiter = Some(waiter);
            state.source.clone()
        };
        let Some(source) = source else {
            tracing::error!("Cannot join without a source");
            return RunnerStatus::Failed;
        };

        let node = &self.config.node;
        let result = match Join::new(
            node.rpc_port.value(),
            node.dump_path.clone(),
            node.file_transfer_port.value(),
        ) {
            Ok(join) => {
                tokio::select! {
                    result = self.rpc.join(&source, join) => result.map_err(CmigError::from),
                    Ok(id) = joined => Ok(id),
                }
            }
            Err(e) => Err(e.into()),
        };

        let mut state = self.ctx.lock().await;
        state.join_waiter = None;
        match result {
            Ok(id) => {
                tracing::info!(source = %source, container_id = %id, "Joined source");
                state.container_id = Some(id);
                RunnerStatus::StandBy
            }
            Err(e) => {
                tracing::error!(source = %source, error = %e, "Join failed");
                RunnerStatus::Failed
            }
        }
    }

    // =========================================================================
    // StandBy
    // =========================================================================

    /// Idle until the status changes. With an upstream source, run the
    /// liveness watchdog and enter Recovery when pings stop.
    pub(super) async fn run_standby(&self) {
        let mut status = self.ctx.subscribe();
        let has_source = self.ctx.lock().await.source.is_some();
        if !has_source {
            wait_while(&mut status, RunnerStatus::StandBy).await;
            return;
        }

        let window = self.config.migration.liveness_timeout;
        loop {
            tokio::select! {
                _ = wait_while(&mut status, RunnerStatus::StandBy) => return,
                _ = self.ctx.ping_received() => {
                    tracing::trace!("Upstream ping received");
                }
                _ = time::sleep(window) => {
                    tracing::warn!(
                        timeout_ms = window.as_millis() as u64,
                        "No ping from upstream, starting recovery"
                    );
                    if let Err(e) = self
                        .ctx
                        .transition_from(RunnerStatus::StandBy, RunnerStatus::Recovery)
                        .await
                    {
                        tracing::error!(error = %e, "Failed to enter recovery");
                    }
                    return;
                }
            }
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    pub(super) async fn run_recovery(&self) -> RunnerStatus {
        match self.recover().await {
            Ok(chain) => {
                tracing::info!(chain = ?chain.names_oldest_first(), "Chain recovered from disk");
                let mut state = self.ctx.lock().await;
                state.chain = chain;
                state.prev_chain = None;
                state.source = None;
                RunnerStatus::Restoring
            }
            Err(e) => {
                tracing::error!(error = %e, "Recovery failed");
                RunnerStatus::Failed
            }
        }
    }

    /// Rebuild the newest full dump's chain from local storage.
    pub async fn recover(&self) -> CmigResult<DumpChain> {
        let root = self.config.node.dump_path.clone();
        let names = tokio::task::spawn_blocking(move || -> CmigResult<Vec<String>> {
            let latest = Dump::recover(&root)?;
            Ok(chain::reconstruct(&latest.path_in(&root))?)
        })
        .await
        .map_err(|e| EngineError::TaskAborted {
            reason: e.to_string(),
        })??;

        let dumps = names
            .iter()
            .map(|n| Dump::from_name(n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DumpChain::from_dumps(dumps))
    }

    // =========================================================================
    // Terminated
    // =========================================================================

    pub(super) async fn run_terminated(&self) -> RunnerStatus {
        let state = self.ctx.lock().await;
        let Some(id) = state.container_id.clone().filter(|_| state.container_live) else {
            tracing::info!("No live container to kill");
            return RunnerStatus::Stopped;
        };

        let engine = Arc::clone(&self.engine);
        let kill_id = id.clone();
        let result = tokio::task::spawn_blocking(move || engine.kill(&kill_id))
            .await
            .unwrap_or_else(|e| {
                Err(EngineError::TaskAborted {
                    reason: e.to_string(),
                })
            });
        drop(state);

        match result {
            Ok(()) => {
                tracing::info!(container_id = %id, "Container killed");
                RunnerStatus::Stopped
            }
            Err(e) => {
                tracing::error!(container_id = %id, error = %e, "Failed to kill container");
                RunnerStatus::Failed
            }
        }
    }
}
