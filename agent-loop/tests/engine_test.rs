//! The multi-loop command surface.

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use agent_loop::bridge::{
    AgentBridge, AgentSession, ChatMessage, EmbeddedAgent, InProcessBridge, TurnContext,
};
use agent_loop::engine::OWNER_LOST_MESSAGE;
use agent_loop::state::LoopSnapshot;
use agent_loop::store::LoopStore;
use agent_loop::{EventKind, ExitReason, LoopConfig, LoopEngine, LoopError, LoopState, Result};

use common::{iteration_started, loop_dir, test_config, wait_for};

/// Completes every turn; holds its turns open while the gate is closed
struct SteadyAgent {
    gate: Option<Arc<Notify>>,
}

impl SteadyAgent {
    fn open() -> Self {
        Self { gate: None }
    }

    fn gated(gate: Arc<Notify>) -> Self {
        Self { gate: Some(gate) }
    }
}

#[async_trait]
impl EmbeddedAgent for SteadyAgent {
    async fn run(&self, turn: TurnContext) -> Result<Vec<ChatMessage>> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        turn.emit(EventKind::TurnStart);
        turn.emit(EventKind::MessageDelta {
            text: "progress".to_string(),
        });
        Ok(vec![ChatMessage::assistant("progress")])
    }
}

fn engine(
    temp: &TempDir,
    agent: SteadyAgent,
    max: Option<u32>,
) -> LoopEngine<InProcessBridge<SteadyAgent>> {
    let config = LoopConfig {
        max_iterations: max,
        ..test_config(temp)
    };
    LoopEngine::new(temp.path(), config, InProcessBridge::new(agent))
}

#[tokio::test]
async fn start_wait_list_and_cleanup() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, SteadyAgent::open(), Some(2));

    engine.start("alpha", Some("- [ ] a\n".to_string())).await.unwrap();
    engine.start("beta", None).await.unwrap();

    let alpha = engine.wait("alpha").await.unwrap();
    let beta = engine.wait("beta").await.unwrap();
    assert_eq!(alpha.exit_reason, Some(ExitReason::MaxIterations));
    assert_eq!(beta.iteration, 2);

    let listed: Vec<String> = engine.list().await.unwrap().into_iter().map(|s| s.name).collect();
    assert_eq!(listed, vec!["alpha".to_string(), "beta".to_string()]);

    let status = engine.status("alpha").await.unwrap();
    assert_eq!(status.state, LoopState::Completed);

    engine.cleanup("alpha").await.unwrap();
    assert!(!loop_dir(&temp, "alpha").exists());
    assert!(matches!(
        engine.status("alpha").await,
        Err(LoopError::LoopNotFound(_))
    ));
    assert_eq!(engine.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn a_running_loop_cannot_be_started_twice_or_cleaned_up() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(Notify::new());
    let engine = engine(&temp, SteadyAgent::gated(Arc::clone(&gate)), Some(1));

    let handle = engine.start("busy", None).await.unwrap();
    let mut events = handle.subscribe();
    wait_for(&mut events, iteration_started(1)).await;

    assert!(matches!(
        engine.start("busy", None).await,
        Err(LoopError::LoopActive(_))
    ));
    assert!(matches!(
        engine.cleanup("busy").await,
        Err(LoopError::LoopActive(_))
    ));
    assert_eq!(engine.status("busy").await.unwrap().state, LoopState::Running);

    gate.notify_one();
    let done = engine.wait("busy").await.unwrap();
    assert_eq!(done.state, LoopState::Completed);
}

#[tokio::test]
async fn stop_and_kill_through_the_engine() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(Notify::new());
    let engine = engine(&temp, SteadyAgent::gated(Arc::clone(&gate)), None);

    let stopping = engine.start("stopping", None).await.unwrap();
    let mut events = stopping.subscribe();
    wait_for(&mut events, iteration_started(1)).await;
    engine.stop("stopping").await.unwrap();
    gate.notify_one();
    let stopped = engine.wait("stopping").await.unwrap();
    assert_eq!(stopped.state, LoopState::Stopped);
    assert_eq!(stopped.exit_reason, Some(ExitReason::StopRequested));
    assert_eq!(stopped.iteration, 1);

    let killing = engine.start("killing", None).await.unwrap();
    let mut events = killing.subscribe();
    wait_for(&mut events, iteration_started(1)).await;
    engine.kill("killing").await.unwrap();
    let killed = tokio::time::timeout(Duration::from_secs(10), engine.wait("killing"))
        .await
        .expect("kill did not end the loop")
        .unwrap();
    assert_eq!(killed.exit_reason, Some(ExitReason::Killed));

    // stopping a finished loop is a no-op
    engine.stop("killing").await.unwrap();
}

fn orphaned_snapshot(temp: &TempDir, name: &str, pid: u32) -> LoopStore {
    let dir = loop_dir(temp, name);
    let store = LoopStore::new(&dir);
    store.create().unwrap();
    let working_dir = temp.path().canonicalize().unwrap();
    let mut snapshot = LoopSnapshot::new(name, working_dir, dir, Some(10));
    snapshot.transition(LoopState::Running).unwrap();
    snapshot.iteration = 4;
    snapshot.pid = pid;
    store.write_state(&snapshot).unwrap();
    store
}

#[cfg(unix)]
#[tokio::test]
async fn loop_with_a_dead_owner_is_reported_as_error() {
    let temp = TempDir::new().unwrap();
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();

    let store = orphaned_snapshot(&temp, "orphan", dead_pid);
    let engine = engine(&temp, SteadyAgent::open(), None);

    let status = engine.status("orphan").await.unwrap();
    assert_eq!(status.state, LoopState::Error);
    assert_eq!(status.exit_reason, Some(ExitReason::OwnerLost));
    assert_eq!(status.error.as_deref(), Some(OWNER_LOST_MESSAGE));
    assert_eq!(status.iteration, 4);

    // the verdict is persisted, so the next reader agrees
    assert_eq!(store.read_state().unwrap().state, LoopState::Error);
    engine.cleanup("orphan").await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn stop_for_a_loop_owned_elsewhere_leaves_a_marker() {
    let temp = TempDir::new().unwrap();
    // this process is alive, so the loop looks healthy but is not in the engine's map
    let store = orphaned_snapshot(&temp, "foreign", std::process::id());
    let engine = engine(&temp, SteadyAgent::open(), None);

    assert_eq!(engine.status("foreign").await.unwrap().state, LoopState::Running);
    engine.stop("foreign").await.unwrap();
    assert!(store.take_stop_request());

    assert!(matches!(
        engine.kill("foreign").await,
        Err(LoopError::LoopActive(_))
    ));
}

#[tokio::test]
async fn unknown_and_invalid_names() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp, SteadyAgent::open(), None);

    assert!(matches!(
        engine.status("nobody").await,
        Err(LoopError::LoopNotFound(_))
    ));
    assert!(matches!(
        engine.status("../etc").await,
        Err(LoopError::Configuration(_))
    ));
    assert!(engine.list().await.unwrap().is_empty());
}

/// Holds session opens while `hold` is set, until `release` is notified
#[derive(Clone)]
struct HeldOpenBridge {
    inner: InProcessBridge<SteadyAgent>,
    hold: Arc<AtomicBool>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl AgentBridge for HeldOpenBridge {
    async fn open(&self, config: &LoopConfig, working_dir: &Path) -> Result<Box<dyn AgentSession>> {
        if self.hold.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.open(config, working_dir).await
    }
}

#[tokio::test]
async fn a_slow_start_does_not_block_other_loops() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(Notify::new());
    let bridge = HeldOpenBridge {
        inner: InProcessBridge::new(SteadyAgent::gated(Arc::clone(&gate))),
        hold: Arc::new(AtomicBool::new(false)),
        entered: Arc::new(Notify::new()),
        release: Arc::new(Notify::new()),
    };
    let engine = Arc::new(LoopEngine::new(temp.path(), test_config(&temp), bridge.clone()));

    let running = engine.start("running", None).await.unwrap();
    let mut events = running.subscribe();
    wait_for(&mut events, iteration_started(1)).await;

    bridge.hold.store(true, Ordering::SeqCst);
    let slow = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.start("slow", None).await.map(|_| ()) }
    });
    bridge.entered.notified().await;

    let status = tokio::time::timeout(Duration::from_secs(2), engine.status("running"))
        .await
        .expect("status waited on another loop's start")
        .unwrap();
    assert_eq!(status.state, LoopState::Running);
    tokio::time::timeout(Duration::from_secs(2), engine.stop("running"))
        .await
        .expect("stop waited on another loop's start")
        .unwrap();

    // the name stays reserved while its session opens
    assert!(matches!(
        engine.start("slow", None).await,
        Err(LoopError::LoopActive(_))
    ));

    bridge.release.notify_one();
    slow.await.unwrap().unwrap();
    engine.kill("slow").await.unwrap();
    let killed = engine.wait("slow").await.unwrap();
    assert_eq!(killed.exit_reason, Some(ExitReason::Killed));

    gate.notify_one();
    let stopped = engine.wait("running").await.unwrap();
    assert_eq!(stopped.exit_reason, Some(ExitReason::StopRequested));
}
