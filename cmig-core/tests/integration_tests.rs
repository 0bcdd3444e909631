// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end integration tests for cmig.
//!
//! These tests drive runners through cadence dumps, replica joins,
//! migration handoff and recovery, with a fake checkpoint engine that
//! writes dump directories the way runc would.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cmig_core::control::{ControlCommand, ControlHandler};
use cmig_core::error::{ControlError, EngineError, TransferError};
use cmig_core::rpc::{Join, Migrate, RpcHandler, RpcMessage, RpcReply, RpcServer};
use cmig_core::{
    CheckpointEngine, Config, ContainerExit, ContainerId, Dump, DumpTransfer, FrameAuth, Port,
    RemoteTarget, Runner, RunnerStatus, TcpTransfer, TransferServer,
};
use tempfile::TempDir;
use tokio::net::TcpListener;

// =============================================================================
// Fakes
// =============================================================================

/// Records every call and lays out dump directories like runc does.
#[derive(Default)]
struct FakeEngine {
    calls: Mutex<Vec<String>>,
    fail_kill: bool,
    pre_dump_delay: Duration,
}

impl FakeEngine {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn write_image(image: &Path, parent: Option<&str>) -> Result<(), EngineError> {
        let fail = |e: std::io::Error| EngineError::SpawnFailed {
            action: "fake",
            reason: e.to_string(),
        };
        std::fs::create_dir_all(image).map_err(fail)?;
        std::fs::write(image.join("pages-1.img"), image.to_string_lossy().as_bytes())
            .map_err(fail)?;
        if let Some(parent) = parent.filter(|p| !p.is_empty()) {
            std::os::unix::fs::symlink(parent, image.join("parent")).map_err(fail)?;
        }
        Ok(())
    }
}

fn base(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

impl CheckpointEngine for FakeEngine {
    fn run(&self, id: &ContainerId, _bundle: &Path) -> Result<ContainerExit, EngineError> {
        self.calls.lock().unwrap().push(format!("run {}", id));
        Ok(ContainerExit::Checkpointed)
    }

    fn pre_dump(
        &self,
        id: &ContainerId,
        image_path: &Path,
        parent_path: Option<&str>,
    ) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(format!(
            "pre-dump {} {} {}",
            id,
            base(image_path),
            parent_path.unwrap_or("-")
        ));
        std::thread::sleep(self.pre_dump_delay);
        Self::write_image(image_path, parent_path)
    }

    fn dump(
        &self,
        id: &ContainerId,
        image_path: &Path,
        parent_path: Option<&str>,
        leave_running: bool,
    ) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(format!(
            "dump {} {} {} {}",
            id,
            base(image_path),
            parent_path.unwrap_or("-"),
            if leave_running { "running" } else { "stop" }
        ));
        Self::write_image(image_path, parent_path)
    }

    fn restore(
        &self,
        id: &ContainerId,
        image_path: &Path,
        _bundle: &Path,
    ) -> Result<ContainerExit, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("restore {} {}", id, base(image_path)));
        Ok(ContainerExit::Checkpointed)
    }

    fn kill(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(format!("kill {}", id));
        if self.fail_kill {
            return Err(EngineError::CommandFailed {
                action: "kill",
                container_id: id.clone(),
                reason: "container does not exist".to_string(),
            });
        }
        Ok(())
    }
}

/// Records transfers without touching the network.
#[derive(Default)]
struct RecordingTransfer {
    sent: Mutex<Vec<(String, String)>>,
    /// Dumps whose next transfer fails.
    fail_once: Mutex<Vec<String>>,
}

impl RecordingTransfer {
    fn failing_once(names: &[&str]) -> Self {
        Self {
            fail_once: Mutex::new(names.iter().map(|n| n.to_string()).collect()),
            ..Self::default()
        }
    }

    fn sent_to(&self, target: &RemoteTarget) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| *t == target.key())
            .map(|(d, _)| d.clone())
            .collect()
    }
}

impl DumpTransfer for RecordingTransfer {
    async fn transfer_dump(
        &self,
        dump: &Dump,
        _predecessor: Option<&Dump>,
        target: &RemoteTarget,
    ) -> Result<(), TransferError> {
        {
            let mut fail_once = self.fail_once.lock().unwrap();
            if let Some(pos) = fail_once.iter().position(|n| *n == dump.name()) {
                fail_once.remove(pos);
                return Err(TransferError::Rejected {
                    name: dump.name(),
                    reason: "replica disk full".to_string(),
                });
            }
        }
        self.sent
            .lock()
            .unwrap()
            .push((dump.name(), target.key()));
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn config(dump_path: &Path) -> Config {
    let mut config = Config::default();
    config.node.dump_path = dump_path.to_path_buf();
    config.migration.dump_frequency = 3;
    config.migration.ping_timeout = Duration::from_millis(300);
    config.migration.liveness_timeout = Duration::from_millis(150);
    config.migration.rpc_timeout = Duration::from_secs(5);
    config
}

fn container() -> ContainerId {
    ContainerId::new("box").unwrap()
}

fn peer() -> SocketAddr {
    "10.0.0.9:40000".parse().unwrap()
}

fn port(p: u16) -> Port {
    Port::new(p).unwrap()
}

async fn running<E: CheckpointEngine, T: DumpTransfer + 'static>(runner: &Runner<E, T>) {
    runner
        .context()
        .transition(RunnerStatus::StandBy)
        .await
        .unwrap();
    runner
        .run_container(container(), PathBuf::from("/bundles/box"))
        .await
        .unwrap();
}

async fn ticks<E: CheckpointEngine, T: DumpTransfer + 'static>(
    runner: &Runner<E, T>,
    n: usize,
) -> Vec<String> {
    let mut names = Vec::new();
    for _ in 0..n {
        let dump = runner.dump_tick().await.unwrap().unwrap();
        names.push(dump.name());
    }
    names
}

/// Ephemeral RPC and file transfer listeners.
async fn listeners() -> (TcpListener, TcpListener) {
    let rpc = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let files = TcpListener::bind("127.0.0.1:0").await.unwrap();
    (rpc, files)
}

/// Serve RPC and file transfers for `runner` on the given listeners.
fn serve_on<E: CheckpointEngine, T: DumpTransfer + 'static>(
    runner: &Arc<Runner<E, T>>,
    (rpc, files): (TcpListener, TcpListener),
) {
    tokio::spawn(RpcServer::new(Arc::clone(runner)).serve(rpc));
    let receiver = Arc::new(TransferServer::new(
        &runner.config().node.dump_path,
        FrameAuth::new(None),
    ));
    tokio::spawn(receiver.serve(files));
}

/// Serve `runner` on ephemeral ports, returning (rpc, file transfer).
async fn serve<E: CheckpointEngine, T: DumpTransfer + 'static>(
    runner: &Arc<Runner<E, T>>,
) -> (u16, u16) {
    let bound = listeners().await;
    let ports = (
        bound.0.local_addr().unwrap().port(),
        bound.1.local_addr().unwrap().port(),
    );
    serve_on(runner, bound);
    ports
}

fn tcp_transfer(root: &Path) -> TcpTransfer {
    TcpTransfer::new(root, FrameAuth::new(None), Duration::from_secs(2))
}

/// A replica port that accepts connections and never reads from them.
async fn stalled_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}

fn make_dump(root: &Path, name: &str, parent: Option<&str>) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("pages-1.img"), name).unwrap();
    if let Some(parent) = parent {
        std::os::unix::fs::symlink(format!("../{}", parent), dir.join("parent")).unwrap();
    }
}

// =============================================================================
// Cadence
// =============================================================================

#[tokio::test]
async fn test_fresh_start_produces_chain_and_closes_on_full_dump() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    running(&runner).await;

    assert_eq!(ticks(&runner, 2).await, vec!["p1", "p2"]);
    assert_eq!(runner.context().lock().await.chain.len(), 2);

    assert_eq!(ticks(&runner, 1).await, vec!["d3"]);
    {
        let state = runner.context().lock().await;
        assert!(state.chain.is_empty());
        assert_eq!(
            state.prev_chain.as_ref().unwrap().names_oldest_first(),
            vec!["p1", "p2", "d3"]
        );
    }

    // The next chain re-anchors without a parent.
    assert_eq!(ticks(&runner, 1).await, vec!["p4"]);

    let runner_calls: Vec<String> = runner_engine_calls(&runner);
    assert_eq!(
        runner_calls,
        vec![
            "pre-dump box p1 -",
            "pre-dump box p2 ../p1",
            "dump box d3 ../p2 running",
            "pre-dump box p4 -",
        ]
    );
    assert!(dir.path().join("p2").join("parent").is_symlink());
}

/// Engine calls minus the container launch, which runs on its own task.
fn runner_engine_calls<T: DumpTransfer + 'static>(runner: &Runner<FakeEngine, T>) -> Vec<String> {
    engine_of(runner)
        .calls()
        .into_iter()
        .filter(|c| !c.starts_with("run "))
        .collect()
}

fn engine_of<T: DumpTransfer + 'static>(runner: &Runner<FakeEngine, T>) -> &FakeEngine {
    runner.engine()
}

#[tokio::test]
async fn test_dump_tick_is_skipped_unless_running() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    runner
        .context()
        .transition(RunnerStatus::StandBy)
        .await
        .unwrap();

    assert!(runner.dump_tick().await.unwrap().is_none());
    assert!(engine_of(&runner).calls().is_empty());
}

// =============================================================================
// Join and replication
// =============================================================================

#[tokio::test]
async fn test_join_transfers_chain_then_syncs_incrementally() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    running(&runner).await;
    ticks(&runner, 2).await;

    let join = Join::new(4000, "/replica/dumps", 4001).unwrap();
    let reply = runner.handle(peer(), RpcMessage::Join(join)).await;
    assert_eq!(
        reply,
        RpcReply::Joined {
            container_id: "box".to_string()
        }
    );

    let replica = RemoteTarget::new("10.0.0.9", port(4000), "/replica/dumps", port(4001));
    assert_eq!(runner.transfer().sent_to(&replica), vec!["p1", "p2"]);

    assert_eq!(ticks(&runner, 1).await, vec!["d3"]);
    assert_eq!(runner.transfer().sent_to(&replica), vec!["p1", "p2", "d3"]);

    // A second registration of the same endpoint is not a new replica.
    let again = Join::new(4000, "/replica/dumps", 4001).unwrap();
    runner.handle(peer(), RpcMessage::Join(again)).await;
    assert_eq!(runner.context().lock().await.targets().len(), 1);
}

#[tokio::test]
async fn test_join_includes_closed_chain() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    running(&runner).await;
    ticks(&runner, 4).await;

    let join = Join::new(4000, "/replica/dumps", 4001).unwrap();
    runner.handle(peer(), RpcMessage::Join(join)).await;

    let replica = RemoteTarget::new("10.0.0.9", port(4000), "/replica/dumps", port(4001));
    assert_eq!(
        runner.transfer().sent_to(&replica),
        vec!["p1", "p2", "d3", "p4"]
    );
}

#[tokio::test]
async fn test_join_without_container_is_refused() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    runner
        .context()
        .transition(RunnerStatus::StandBy)
        .await
        .unwrap();

    let join = Join::new(4000, "/replica/dumps", 4001).unwrap();
    let reply = runner.handle(peer(), RpcMessage::Join(join)).await;
    assert!(matches!(reply, RpcReply::Error { .. }));
    assert!(runner.context().lock().await.targets().is_empty());
}

#[tokio::test]
async fn test_follower_joins_over_network() {
    let primary_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();

    let primary = Arc::new(Runner::new(
        config(primary_dir.path()),
        FakeEngine::default(),
        tcp_transfer(primary_dir.path()),
    ));
    running(&primary).await;
    ticks(&primary, 2).await;
    let (primary_rpc, _) = serve(&primary).await;

    let bound = listeners().await;
    let follower_rpc = bound.0.local_addr().unwrap().port();
    let mut follower_config = config(follower_dir.path());
    follower_config.node.rpc_port = port(follower_rpc);
    follower_config.node.file_transfer_port = port(bound.1.local_addr().unwrap().port());
    let follower = Arc::new(Runner::new(
        follower_config,
        FakeEngine::default(),
        tcp_transfer(follower_dir.path()),
    ));
    serve_on(&follower, bound);

    follower
        .context()
        .transition(RunnerStatus::StandBy)
        .await
        .unwrap();
    follower
        .join(format!("127.0.0.1:{}", primary_rpc), PathBuf::from("/bundles/box"))
        .await
        .unwrap();
    follower.step().await;

    assert_eq!(follower.context().status(), RunnerStatus::StandBy);
    assert_eq!(
        follower.context().lock().await.container_id,
        Some(container())
    );

    let state = primary.context().lock().await;
    assert_eq!(state.targets().len(), 1);
    assert_eq!(state.targets()[0].rpc_port.value(), follower_rpc);
    drop(state);

    // The chain landed in the follower's dump root, parent link included.
    assert!(follower_dir.path().join("p1").join("pages-1.img").is_file());
    assert_eq!(
        std::fs::read_link(follower_dir.path().join("p2").join("parent")).unwrap(),
        PathBuf::from("../p1")
    );
}

#[tokio::test]
async fn test_join_to_unreachable_source_fails() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap().to_string();
    drop(closed);

    runner
        .context()
        .transition(RunnerStatus::StandBy)
        .await
        .unwrap();
    runner.join(addr, PathBuf::from(".")).await.unwrap();
    runner.step().await;
    assert_eq!(runner.context().status(), RunnerStatus::Failed);
}

#[tokio::test]
async fn test_failed_ping_removes_target() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    running(&runner).await;

    let alive = Arc::new(Runner::new(
        config(dir.path()),
        FakeEngine::default(),
        RecordingTransfer::default(),
    ));
    let (alive_rpc, _) = serve(&alive).await;

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = closed.local_addr().unwrap().port();
    drop(closed);

    {
        let mut state = runner.context().lock().await;
        state.add_target(RemoteTarget::new("127.0.0.1", port(alive_rpc), "/d", port(9)));
        state.add_target(RemoteTarget::new("127.0.0.1", port(dead_port), "/d", port(9)));
    }

    assert_eq!(runner.ping_targets().await, 1);
    let state = runner.context().lock().await;
    assert_eq!(state.targets().len(), 1);
    assert_eq!(state.targets()[0].rpc_port.value(), alive_rpc);
}

#[tokio::test]
async fn test_pings_are_not_held_up_by_a_dump() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine {
        pre_dump_delay: Duration::from_millis(1500),
        ..FakeEngine::default()
    };
    let runner = Arc::new(Runner::new(config(dir.path()), engine, RecordingTransfer::default()));
    running(&runner).await;

    let alive = Arc::new(Runner::new(
        config(dir.path()),
        FakeEngine::default(),
        RecordingTransfer::default(),
    ));
    let (alive_rpc, _) = serve(&alive).await;
    runner
        .context()
        .lock()
        .await
        .add_target(RemoteTarget::new("127.0.0.1", port(alive_rpc), "/d", port(9)));

    let dumping = Arc::clone(&runner);
    let dump = tokio::spawn(async move { dumping.dump_tick().await.map(|d| d.map(|d| d.name())) });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The dump holds the context lock for its whole duration.
    let start = Instant::now();
    assert_eq!(runner.ping_targets().await, 0);
    assert!(start.elapsed() < Duration::from_millis(500));
    assert!(!dump.is_finished());

    assert_eq!(dump.await.unwrap().unwrap(), Some("p1".to_string()));
}

#[tokio::test]
async fn test_running_loop_dumps_and_pings_on_its_own() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.migration.dump_interval = Duration::from_millis(50);
    cfg.migration.ping_interval = Duration::from_millis(50);
    let runner = Arc::new(Runner::new(cfg, FakeEngine::default(), RecordingTransfer::default()));
    running(&runner).await;

    let follower_dir = TempDir::new().unwrap();
    let follower = Arc::new(Runner::new(
        config(follower_dir.path()),
        FakeEngine::default(),
        RecordingTransfer::default(),
    ));
    let (follower_rpc, follower_files) = serve(&follower).await;
    let replica = RemoteTarget::new("127.0.0.1", port(follower_rpc), "/d", port(follower_files));
    runner.context().lock().await.add_target(replica.clone());

    let looping = Arc::clone(&runner);
    let handle = tokio::spawn(async move { looping.step().await });

    tokio::time::timeout(Duration::from_secs(2), follower.context().ping_received())
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while runner.transfer().sent_to(&replica).len() < 3 {
        assert!(Instant::now() < deadline, "cadence dumps never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(&runner.transfer().sent_to(&replica)[..3], &["p1", "p2", "d3"]);

    // Leaving Running ends the loop within one interval.
    runner.request_migration(&container()).await.unwrap();
    tokio::time::timeout(Duration::from_millis(200), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(runner.context().status(), RunnerStatus::Migrating);
}

// =============================================================================
// Replication failures
// =============================================================================

#[tokio::test]
async fn test_closed_chain_drains_after_failed_full_dump() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(
        config(dir.path()),
        FakeEngine::default(),
        RecordingTransfer::failing_once(&["d3"]),
    );
    running(&runner).await;
    let replica = RemoteTarget::new("10.0.0.9", port(4000), "/replica/dumps", port(4001));
    runner.context().lock().await.add_target(replica.clone());

    assert_eq!(ticks(&runner, 3).await, vec!["p1", "p2", "d3"]);
    assert_eq!(runner.transfer().sent_to(&replica), vec!["p1", "p2"]);

    // The full dump went out with the closed chain on the next tick.
    assert_eq!(ticks(&runner, 1).await, vec!["p4"]);
    assert_eq!(runner.transfer().sent_to(&replica), vec!["p1", "p2", "d3", "p4"]);

    let state = runner.context().lock().await;
    let closed = state.prev_chain.as_ref().unwrap();
    assert!(closed.latest_node().unwrap().is_synced_to(&replica));
}

#[tokio::test]
async fn test_stalled_replica_does_not_freeze_dumps() {
    let dir = TempDir::new().unwrap();
    let transfer = TcpTransfer::new(dir.path(), FrameAuth::new(None), Duration::from_millis(200));
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), transfer);
    running(&runner).await;

    let stalled = port(stalled_port().await);
    let replica = RemoteTarget::new("127.0.0.1", stalled, "/d", stalled);
    runner.context().lock().await.add_target(replica.clone());

    let tick = tokio::time::timeout(Duration::from_secs(5), runner.dump_tick())
        .await
        .expect("dump tick hung on a stalled replica");
    assert_eq!(tick.unwrap().unwrap().name(), "p1");

    // Left unsynced for the next pass.
    let state = runner.context().lock().await;
    assert!(!state.chain.latest_node().unwrap().is_synced_to(&replica));
}

// =============================================================================
// Migration
// =============================================================================

#[tokio::test]
async fn test_migration_hands_off_full_chain() {
    let source_dir = TempDir::new().unwrap();
    let dest_dir = TempDir::new().unwrap();

    let dest = Arc::new(Runner::new(
        config(dest_dir.path()),
        FakeEngine::default(),
        tcp_transfer(dest_dir.path()),
    ));
    dest.context()
        .transition(RunnerStatus::StandBy)
        .await
        .unwrap();
    let (dest_rpc, dest_files) = serve(&dest).await;

    let mut source_config = config(source_dir.path());
    source_config.migration.dump_frequency = 5;
    let source = Runner::new(source_config, FakeEngine::default(), tcp_transfer(source_dir.path()));
    running(&source).await;
    assert_eq!(ticks(&source, 2).await, vec!["p1", "p2"]);

    // The advertised root is informational; files land in the receiver's own root.
    source.context().lock().await.add_target(RemoteTarget::new(
        "127.0.0.1",
        port(dest_rpc),
        "/advertised/elsewhere",
        port(dest_files),
    ));

    source.request_migration(&container()).await.unwrap();
    assert_eq!(source.context().status(), RunnerStatus::Migrating);
    source.step().await;
    assert_eq!(source.context().status(), RunnerStatus::Stopped);

    let calls = runner_engine_calls(&source);
    assert_eq!(
        &calls[2..],
        &["pre-dump box p3 ../p2", "dump box d4 ../p3 stop"]
    );

    // Receiver adopted the chain in sequence order.
    assert_eq!(dest.context().status(), RunnerStatus::Restoring);
    {
        let state = dest.context().lock().await;
        assert_eq!(state.chain.names_oldest_first(), vec!["p1", "p2", "p3", "d4"]);
        assert_eq!(state.container_id, Some(container()));
        assert_eq!(state.bundle_path, Some(PathBuf::from("/bundles/box")));
    }
    assert_eq!(
        std::fs::read_link(dest_dir.path().join("d4").join("parent")).unwrap(),
        PathBuf::from("../p3")
    );

    dest.step().await;
    assert_eq!(dest.context().status(), RunnerStatus::Running);
    {
        let state = dest.context().lock().await;
        assert!(state.chain.is_empty());
        assert_eq!(state.prev_chain.as_ref().unwrap().len(), 4);
    }

    // Restore runs on its own task.
    let deadline = Instant::now() + Duration::from_secs(2);
    while !engine_of(&dest).calls().contains(&"restore box d4".to_string()) {
        assert!(Instant::now() < deadline, "restore was never invoked");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The restored node continues the cadence on a fresh chain.
    assert_eq!(ticks(&dest, 1).await, vec!["p5"]);
}

#[tokio::test]
async fn test_migration_to_unreachable_target_fails() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), tcp_transfer(dir.path()));
    running(&runner).await;
    ticks(&runner, 1).await;

    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = closed.local_addr().unwrap().port();
    drop(closed);
    runner.context().lock().await.add_target(RemoteTarget::new(
        "127.0.0.1",
        port(dead_port),
        "/d",
        port(dead_port),
    ));

    runner.request_migration(&container()).await.unwrap();
    runner.step().await;
    assert_eq!(runner.context().status(), RunnerStatus::Failed);
}

#[tokio::test]
async fn test_migrate_rpc_checks_local_dumps() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    runner
        .context()
        .transition(RunnerStatus::StandBy)
        .await
        .unwrap();
    make_dump(dir.path(), "p1", None);

    let migrate = Migrate::new(&["d2", "p1"], "box", "/bundles/box").unwrap();
    let reply = runner.handle(peer(), RpcMessage::Migrate(migrate)).await;
    assert!(matches!(reply, RpcReply::Error { .. }));
    assert_eq!(runner.context().status(), RunnerStatus::StandBy);

    make_dump(dir.path(), "d2", Some("p1"));
    let migrate = Migrate::new(&["d2", "p1"], "box", "/bundles/box").unwrap();
    let reply = runner.handle(peer(), RpcMessage::Migrate(migrate)).await;
    assert_eq!(reply, RpcReply::Ack);
    assert_eq!(runner.context().status(), RunnerStatus::Restoring);
}

#[tokio::test]
async fn test_migrate_command_validation() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    running(&runner).await;

    let other = ContainerId::new("other").unwrap();
    let err = runner
        .execute(ControlCommand::Migrate(other))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Refused { .. }));

    let err = runner
        .execute(ControlCommand::Migrate(container()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("No replication target"));
    assert_eq!(runner.context().status(), RunnerStatus::Running);
}

// =============================================================================
// Checkpoint command
// =============================================================================

#[tokio::test]
async fn test_checkpoint_is_outside_the_cadence() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    running(&runner).await;
    ticks(&runner, 2).await;

    runner.execute(ControlCommand::Checkpoint).await.unwrap();
    runner.execute(ControlCommand::Checkpoint).await.unwrap();

    assert_eq!(
        runner.context().lock().await.chain.names_oldest_first(),
        vec!["p1", "p2"]
    );
    assert_eq!(ticks(&runner, 1).await, vec!["d3"]);

    let calls = runner_engine_calls(&runner);
    assert_eq!(calls[2], "dump box c3 - running");
    assert_eq!(calls[3], "dump box c3 - running");
}

#[tokio::test]
async fn test_checkpoint_requires_running_container() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    runner
        .context()
        .transition(RunnerStatus::StandBy)
        .await
        .unwrap();
    assert!(runner.execute(ControlCommand::Checkpoint).await.is_err());
}

// =============================================================================
// Liveness and recovery
// =============================================================================

fn follower_with_dumps(dir: &Path) -> Runner<FakeEngine, RecordingTransfer> {
    make_dump(dir, "p1", None);
    make_dump(dir, "p2", Some("p1"));
    make_dump(dir, "p3", Some("p2"));
    make_dump(dir, "d4", Some("p3"));
    make_dump(dir, "p5", None);
    Runner::new(config(dir), FakeEngine::default(), RecordingTransfer::default())
}

async fn as_follower(runner: &Runner<FakeEngine, RecordingTransfer>) {
    runner
        .context()
        .transition(RunnerStatus::StandBy)
        .await
        .unwrap();
    let mut state = runner.context().lock().await;
    state.source = Some("127.0.0.1:1".to_string());
    state.container_id = Some(container());
    state.bundle_path = Some(PathBuf::from("/bundles/box"));
}

#[tokio::test]
async fn test_silent_source_triggers_recovery() {
    let dir = TempDir::new().unwrap();
    let runner = follower_with_dumps(dir.path());
    as_follower(&runner).await;

    runner.step().await;
    assert_eq!(runner.context().status(), RunnerStatus::Recovery);

    runner.step().await;
    assert_eq!(runner.context().status(), RunnerStatus::Restoring);
    {
        let state = runner.context().lock().await;
        assert_eq!(state.chain.names_oldest_first(), vec!["p1", "p2", "p3", "d4"]);
        assert!(state.source.is_none());
    }

    runner.step().await;
    assert_eq!(runner.context().status(), RunnerStatus::Running);
}

#[tokio::test]
async fn test_pings_keep_follower_in_standby() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(follower_with_dumps(dir.path()));
    as_follower(&runner).await;

    let pinger = Arc::clone(&runner);
    tokio::spawn(async move {
        for _ in 0..10 {
            pinger.handle(peer(), RpcMessage::Ping).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    let start = Instant::now();
    runner.step().await;
    assert_eq!(runner.context().status(), RunnerStatus::Recovery);
    assert!(start.elapsed() >= Duration::from_millis(450));
}

#[tokio::test]
async fn test_recovery_without_full_dump_fails() {
    let dir = TempDir::new().unwrap();
    make_dump(dir.path(), "p1", None);
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    as_follower(&runner).await;

    runner.step().await;
    runner.step().await;
    assert_eq!(runner.context().status(), RunnerStatus::Failed);
}

#[tokio::test]
async fn test_recovery_rejects_corrupt_chain() {
    let dir = TempDir::new().unwrap();
    make_dump(dir.path(), "p1", None);
    make_dump(dir.path(), "d2", None);
    std::fs::write(dir.path().join("d2").join("parent"), "not a link").unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    as_follower(&runner).await;

    runner.step().await;
    runner.step().await;
    assert_eq!(runner.context().status(), RunnerStatus::Failed);
}

// =============================================================================
// Termination
// =============================================================================

#[tokio::test]
async fn test_termination_kills_live_container() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    running(&runner).await;

    runner
        .context()
        .transition(RunnerStatus::Terminated)
        .await
        .unwrap();
    runner.step().await;
    assert_eq!(runner.context().status(), RunnerStatus::Stopped);
    assert!(engine_of(&runner).calls().contains(&"kill box".to_string()));
}

#[tokio::test]
async fn test_failed_kill_is_terminal() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine {
        fail_kill: true,
        ..FakeEngine::default()
    };
    let runner = Runner::new(config(dir.path()), engine, RecordingTransfer::default());
    running(&runner).await;

    runner
        .context()
        .transition(RunnerStatus::Terminated)
        .await
        .unwrap();
    runner.step().await;
    assert_eq!(runner.context().status(), RunnerStatus::Failed);
    assert!(runner
        .context()
        .transition(RunnerStatus::StandBy)
        .await
        .is_err());
}

#[tokio::test]
async fn test_termination_without_container_stops() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(config(dir.path()), FakeEngine::default(), RecordingTransfer::default());
    runner
        .context()
        .transition(RunnerStatus::StandBy)
        .await
        .unwrap();
    runner
        .context()
        .transition(RunnerStatus::Terminated)
        .await
        .unwrap();
    assert_eq!(runner.wait().await, RunnerStatus::Stopped);
    assert!(engine_of(&runner).calls().is_empty());
}
