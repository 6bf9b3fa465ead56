//! End-to-end loop behavior against scripted in-process agents.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use agent_loop::bridge::{ChatMessage, EmbeddedAgent, InProcessBridge, TurnContext};
use agent_loop::config::ContextLimitConfig;
use agent_loop::event_log::read_events;
use agent_loop::store::LoopStore;
use agent_loop::{
    AgentBridge, AgentSession, EventKind, ExitReason, IterationOutcome, LoopConfig,
    LoopController, LoopError, LoopEvent, LoopSnapshot, LoopState, PendingMessage, Result,
    RpcBridge,
};

use common::{iteration_started, loop_dir, read_file, test_config, wait_for};

async fn started<A: EmbeddedAgent + 'static>(
    temp: &TempDir,
    name: &str,
    task: &str,
    config: LoopConfig,
    agent: Arc<A>,
) -> LoopController<InProcessBridge<A>> {
    let mut controller = LoopController::new(
        name,
        temp.path(),
        Some(task.to_string()),
        config,
        InProcessBridge::from_arc(agent),
    )
    .unwrap();
    controller.start().await.unwrap();
    controller
}

async fn run_to_end<A: EmbeddedAgent + 'static>(
    controller: LoopController<InProcessBridge<A>>,
) -> LoopSnapshot {
    tokio::time::timeout(Duration::from_secs(20), controller.run())
        .await
        .expect("loop did not finish")
        .unwrap()
}

fn reply(turn: &TurnContext, text: String) -> Result<Vec<ChatMessage>> {
    turn.emit(EventKind::TurnStart);
    turn.emit(EventKind::MessageDelta { text: text.clone() });
    turn.emit(EventKind::TurnEnd);
    Ok(vec![ChatMessage::assistant(text)])
}

/// Writes hello.txt in the first iteration and must read it back from disk in the second
#[derive(Default)]
struct HelloAgent {
    calls: AtomicU32,
    seen: Mutex<Vec<(usize, String)>>,
}

#[async_trait]
impl EmbeddedAgent for HelloAgent {
    async fn run(&self, turn: TurnContext) -> Result<Vec<ChatMessage>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen
            .lock()
            .unwrap()
            .push((turn.history.len(), turn.prompt.clone()));

        let hello = turn.working_dir.join("hello.txt");
        let text = if call == 1 {
            std::fs::write(&hello, "hello from iteration one")?;
            "MARKER-ONE: wrote hello.txt".to_string()
        } else {
            let content = std::fs::read_to_string(&hello)?;
            format!("hello.txt says '{}' <promise>TASK COMPLETE</promise>", content)
        };
        reply(&turn, text)
    }
}

#[tokio::test]
async fn each_iteration_starts_from_a_fresh_context() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(HelloAgent::default());
    let config = LoopConfig {
        max_iterations: Some(5),
        ..test_config(&temp)
    };

    let controller = started(
        &temp,
        "hello",
        "- [ ] write hello.txt\n- [ ] read it back\n",
        config,
        Arc::clone(&agent),
    )
    .await;
    let snapshot = run_to_end(controller).await;

    assert_eq!(snapshot.state, LoopState::Completed);
    assert_eq!(snapshot.exit_reason, Some(ExitReason::CompletionPromise));
    assert_eq!(snapshot.iteration, 2);

    let seen = agent.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|(history, _)| *history == 0));
    assert!(!seen[1].1.contains("MARKER-ONE"));
    assert!(seen[1].1.contains("write hello.txt"));

    let events = read_events(&loop_dir(&temp, "hello").join("events.log")).unwrap();
    assert!(events.iter().any(|logged| {
        logged.iteration == 2
            && logged
                .event
                .text()
                .map_or(false, |t| t.contains("hello from iteration one"))
    }));
}

/// Never finishes on its own
#[derive(Default)]
struct BusyAgent {
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl EmbeddedAgent for BusyAgent {
    async fn run(&self, turn: TurnContext) -> Result<Vec<ChatMessage>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(turn.prompt.clone());
        reply(&turn, "still working".to_string())
    }
}

#[tokio::test]
async fn stops_after_max_iterations() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(BusyAgent::default());
    let config = LoopConfig {
        max_iterations: Some(3),
        ..test_config(&temp)
    };

    let controller = started(&temp, "bounded", "- [ ] a\n", config, Arc::clone(&agent)).await;
    let store = controller.store().clone();
    let snapshot = run_to_end(controller).await;

    assert_eq!(snapshot.state, LoopState::Completed);
    assert_eq!(snapshot.exit_reason, Some(ExitReason::MaxIterations));
    assert_eq!(snapshot.iteration, 3);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    assert_eq!(snapshot.telemetry.iterations, 3);
    assert_eq!(snapshot.telemetry.turns, 3);

    let records = store.read_iterations().unwrap();
    let numbers: Vec<u32> = records.iter().map(|r| r.iteration).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(records
        .iter()
        .all(|r| r.outcome == IterationOutcome::Completed));
    assert!(store.iteration_path(3).ends_with("iterations/003.json"));

    assert_eq!(store.read_state().unwrap(), snapshot);

    let registry = temp.path().join("registry");
    let leftovers = std::fs::read_dir(&registry)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "registry entry should be removed on termination");
}

#[tokio::test]
async fn follow_ups_arrive_in_order_with_the_next_iteration() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(BusyAgent::default());
    let config = LoopConfig {
        max_iterations: Some(2),
        reflect_every: 2,
        ..test_config(&temp)
    };

    let controller = started(&temp, "notes", "- [ ] a\n", config, Arc::clone(&agent)).await;
    let store = controller.store().clone();
    let handle = controller.handle();
    assert_eq!(
        handle.follow_up("first note"),
        PendingMessage::FollowUp("first note".to_string())
    );
    handle.follow_up("second note");
    // nothing is in flight yet, so plain input is held for the next iteration
    assert_eq!(
        handle.submit("third note"),
        PendingMessage::FollowUp("third note".to_string())
    );

    run_to_end(controller).await;

    let prompts = agent.prompts.lock().unwrap();
    let first = &prompts[0];
    let a = first.find("first note").unwrap();
    let b = first.find("second note").unwrap();
    let c = first.find("third note").unwrap();
    assert!(a < b && b < c);
    assert!(!first.contains("## Reflection"));
    assert!(!prompts[1].contains("first note"));
    assert!(prompts[1].starts_with("## Reflection"));

    let records = store.read_iterations().unwrap();
    assert_eq!(records[0].follow_ups, 3);
    assert_eq!(records[1].follow_ups, 0);
    assert!(records[1].reflection);
}

/// Holds its first turn open until two steering messages have arrived
#[derive(Default)]
struct SteerableAgent {
    received: Mutex<Vec<String>>,
}

#[async_trait]
impl EmbeddedAgent for SteerableAgent {
    async fn run(&self, turn: TurnContext) -> Result<Vec<ChatMessage>> {
        turn.emit(EventKind::TurnStart);
        for _ in 0..1000 {
            let steering = turn.take_steering();
            {
                let mut received = self.received.lock().unwrap();
                received.extend(steering);
                if received.len() >= 2 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        reply(&turn, "applied".to_string())
    }
}

#[tokio::test]
async fn input_during_a_turn_steers_it() {
    let temp = TempDir::new().unwrap();
    let agent = Arc::new(SteerableAgent::default());
    let config = LoopConfig {
        max_iterations: Some(1),
        ..test_config(&temp)
    };

    let controller = started(&temp, "steer", "- [ ] a\n", config, Arc::clone(&agent)).await;
    let handle = controller.handle();
    let mut events = handle.subscribe();
    let run = tokio::spawn(controller.run());

    wait_for(&mut events, |event| {
        matches!(event, LoopEvent::Session { event, .. } if event.kind == EventKind::TurnStart)
    })
    .await;
    assert_eq!(
        handle.submit("use tabs"),
        PendingMessage::Steer("use tabs".to_string())
    );
    assert_eq!(
        handle.steer("and add tests"),
        PendingMessage::Steer("and add tests".to_string())
    );

    let snapshot = run.await.unwrap().unwrap();
    assert_eq!(snapshot.state, LoopState::Completed);
    assert_eq!(
        *agent.received.lock().unwrap(),
        vec!["use tabs".to_string(), "and add tests".to_string()]
    );

    // after the loop ends nothing is in flight
    assert!(matches!(handle.submit("late"), PendingMessage::FollowUp(_)));

    let steered: Vec<String> = read_events(&loop_dir(&temp, "steer").join("events.log"))
        .unwrap()
        .into_iter()
        .filter_map(|logged| match logged.event.kind {
            EventKind::Steered { message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(steered, vec!["use tabs", "and add tests"]);
}

/// Ignores steering in its first turn, which waits for the gate
struct InattentiveAgent {
    calls: AtomicU32,
    gate: Arc<Notify>,
    seen: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl EmbeddedAgent for InattentiveAgent {
    async fn run(&self, turn: TurnContext) -> Result<Vec<ChatMessage>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        turn.emit(EventKind::TurnStart);
        if call == 1 {
            self.gate.notified().await;
        } else {
            self.seen
                .lock()
                .unwrap()
                .push((turn.prompt.clone(), turn.take_steering()));
        }
        reply(&turn, format!("call {}", call))
    }
}

#[tokio::test]
async fn a_steer_the_turn_never_read_becomes_a_follow_up() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(Notify::new());
    let agent = Arc::new(InattentiveAgent {
        calls: AtomicU32::new(0),
        gate: Arc::clone(&gate),
        seen: Mutex::new(Vec::new()),
    });
    let config = LoopConfig {
        max_iterations: Some(2),
        ..test_config(&temp)
    };

    let controller = started(&temp, "unread", "- [ ] a\n", config, Arc::clone(&agent)).await;
    let handle = controller.handle();
    let mut events = handle.subscribe();
    let run = tokio::spawn(controller.run());

    wait_for(&mut events, |event| {
        matches!(event, LoopEvent::Session { event, .. } if event.kind == EventKind::TurnStart)
    })
    .await;
    assert_eq!(
        handle.steer("STEER-XYZ"),
        PendingMessage::Steer("STEER-XYZ".to_string())
    );
    wait_for(&mut events, |event| {
        matches!(event, LoopEvent::Session { event, .. } if matches!(&event.kind, EventKind::Steered { .. }))
    })
    .await;
    gate.notify_one();

    let snapshot = run.await.unwrap().unwrap();
    assert_eq!(snapshot.iteration, 2);

    let seen = agent.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (prompt, steering) = &seen[0];
    assert!(prompt.contains("STEER-XYZ"), "prompt was: {}", prompt);
    assert!(steering.is_empty(), "stale steering: {:?}", steering);
}

/// Blocks in its third call until released
struct GatedAgent {
    calls: AtomicU32,
    gate: Arc<Notify>,
}

#[async_trait]
impl EmbeddedAgent for GatedAgent {
    async fn run(&self, turn: TurnContext) -> Result<Vec<ChatMessage>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 3 {
            self.gate.notified().await;
        }
        reply(&turn, format!("call {}", call))
    }
}

#[tokio::test]
async fn stop_lets_the_current_iteration_finish() {
    let temp = TempDir::new().unwrap();
    let gate = Arc::new(Notify::new());
    let agent = Arc::new(GatedAgent {
        calls: AtomicU32::new(0),
        gate: Arc::clone(&gate),
    });
    let config = LoopConfig {
        max_iterations: Some(10),
        ..test_config(&temp)
    };

    let controller = started(&temp, "stoppable", "- [ ] a\n", config, Arc::clone(&agent)).await;
    let store = controller.store().clone();
    let handle = controller.handle();
    let mut events = handle.subscribe();
    let run = tokio::spawn(controller.run());

    wait_for(&mut events, iteration_started(3)).await;
    handle.stop().await;
    gate.notify_one();

    let snapshot = run.await.unwrap().unwrap();
    assert_eq!(snapshot.state, LoopState::Stopped);
    assert_eq!(snapshot.exit_reason, Some(ExitReason::StopRequested));
    assert_eq!(snapshot.iteration, 3);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 3);

    let records = store.read_iterations().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].outcome, IterationOutcome::Completed);
}

/// Starts a turn and never finishes it
struct HangingAgent;

#[async_trait]
impl EmbeddedAgent for HangingAgent {
    async fn run(&self, turn: TurnContext) -> Result<Vec<ChatMessage>> {
        turn.emit(EventKind::TurnStart);
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn kill_aborts_the_turn_in_flight() {
    let temp = TempDir::new().unwrap();
    let config = LoopConfig {
        max_iterations: Some(10),
        ..test_config(&temp)
    };

    let controller = started(&temp, "killable", "- [ ] a\n", config, Arc::new(HangingAgent)).await;
    let store = controller.store().clone();
    let handle = controller.handle();
    let mut events = handle.subscribe();
    let run = tokio::spawn(controller.run());

    wait_for(&mut events, |event| {
        matches!(event, LoopEvent::Session { event, .. } if event.kind == EventKind::TurnStart)
    })
    .await;
    handle.kill();

    let snapshot = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("kill did not end the loop")
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.state, LoopState::Stopped);
    assert_eq!(snapshot.exit_reason, Some(ExitReason::Killed));

    let records = store.read_iterations().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, IterationOutcome::Aborted);
    assert_eq!(records[0].note.as_deref(), Some("killed"));
    assert_eq!(records[0].turns, 1);
}

/// Fails hard in its second call
#[derive(Default)]
struct CrashingAgent {
    calls: AtomicU32,
}

#[async_trait]
impl EmbeddedAgent for CrashingAgent {
    async fn run(&self, turn: TurnContext) -> Result<Vec<ChatMessage>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 2 {
            return Err(LoopError::SessionCrash(
                "model backend went away".to_string(),
            ));
        }
        reply(&turn, "fine".to_string())
    }
}

#[tokio::test]
async fn crashed_session_ends_the_loop_in_error() {
    let temp = TempDir::new().unwrap();
    let config = LoopConfig {
        max_iterations: Some(10),
        ..test_config(&temp)
    };

    let controller = started(
        &temp,
        "crashy",
        "- [ ] a\n",
        config,
        Arc::new(CrashingAgent::default()),
    )
    .await;
    let store = controller.store().clone();
    let snapshot = run_to_end(controller).await;

    assert_eq!(snapshot.state, LoopState::Error);
    assert_eq!(snapshot.exit_reason, Some(ExitReason::SessionCrash));
    assert!(snapshot
        .error
        .as_deref()
        .unwrap()
        .contains("model backend went away"));
    assert_eq!(snapshot.iteration, 2);

    let records = store.read_iterations().unwrap();
    assert_eq!(records[1].outcome, IterationOutcome::Errored);
    assert_eq!(store.read_state().unwrap().state, LoopState::Error);
}

struct UnreachableBridge;

#[async_trait]
impl AgentBridge for UnreachableBridge {
    async fn open(
        &self,
        _config: &LoopConfig,
        _working_dir: &std::path::Path,
    ) -> Result<Box<dyn AgentSession>> {
        Err(LoopError::BridgeUnavailable("no agent here".to_string()))
    }
}

#[tokio::test]
async fn unavailable_bridge_never_reaches_running() {
    let temp = TempDir::new().unwrap();
    let mut controller =
        LoopController::new("offline", temp.path(), None, test_config(&temp), UnreachableBridge)
            .unwrap();
    let mut events = controller.handle().subscribe();

    let result = controller.start().await;
    assert!(matches!(result, Err(LoopError::BridgeUnavailable(_))));

    let state = controller.store().read_state().unwrap();
    assert_eq!(state.state, LoopState::Error);
    assert_eq!(state.exit_reason, Some(ExitReason::BridgeUnavailable));
    assert_eq!(state.error.as_deref(), Some("no agent here"));

    while let Ok(event) = events.try_recv() {
        if let LoopEvent::StateChanged { state, .. } = event {
            assert_ne!(state, LoopState::Running);
        }
    }
}

#[tokio::test]
async fn missing_agent_executable_is_reported_as_unavailable() {
    let temp = TempDir::new().unwrap();
    let config = LoopConfig {
        agent_path: temp
            .path()
            .join("no-such-agent")
            .to_string_lossy()
            .into_owned(),
        ..test_config(&temp)
    };

    let mut controller =
        LoopController::new("missing", temp.path(), None, config, RpcBridge).unwrap();
    assert!(matches!(
        controller.start().await,
        Err(LoopError::BridgeUnavailable(_))
    ));
    assert_eq!(
        controller.store().read_state().unwrap().exit_reason,
        Some(ExitReason::BridgeUnavailable)
    );
}

/// Ticks every checklist item in its second call
#[derive(Default)]
struct ChecklistAgent {
    calls: AtomicU32,
}

#[async_trait]
impl EmbeddedAgent for ChecklistAgent {
    async fn run(&self, turn: TurnContext) -> Result<Vec<ChatMessage>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let task = turn
            .working_dir
            .join(".agent-loop")
            .join("checklist")
            .join("task.md");
        let content = std::fs::read_to_string(&task)?;
        if call == 1 {
            std::fs::write(&task, content.replacen("- [ ]", "- [x]", 1))?;
        } else {
            std::fs::write(&task, content.replace("- [ ]", "- [x]"))?;
        }
        reply(&turn, format!("ticked items in call {}", call))
    }
}

#[tokio::test]
async fn finished_checklist_completes_the_loop() {
    let temp = TempDir::new().unwrap();
    let config = LoopConfig {
        max_iterations: Some(10),
        ..test_config(&temp)
    };

    let controller = started(
        &temp,
        "checklist",
        "# Task\n\n- [ ] parse input\n- [ ] write output\n",
        config,
        Arc::new(ChecklistAgent::default()),
    )
    .await;
    let snapshot = run_to_end(controller).await;

    assert_eq!(snapshot.state, LoopState::Completed);
    assert_eq!(snapshot.exit_reason, Some(ExitReason::ChecklistComplete));
    assert_eq!(snapshot.iteration, 2);
    assert!(read_file(&loop_dir(&temp, "checklist").join("task.md")).contains("- [x] write output"));
}

/// Reports a large usage figure, then keeps working until aborted
struct GreedyAgent;

#[async_trait]
impl EmbeddedAgent for GreedyAgent {
    async fn run(&self, turn: TurnContext) -> Result<Vec<ChatMessage>> {
        turn.emit(EventKind::TurnStart);
        turn.emit(EventKind::Usage {
            usage: agent_loop::TokenUsage {
                input: 900,
                output: 200,
                ..Default::default()
            },
            model: Some("test-model".to_string()),
            provider: None,
        });
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn context_limit_aborts_the_iteration_and_the_loop_continues() {
    let temp = TempDir::new().unwrap();
    let config = LoopConfig {
        max_iterations: Some(2),
        context_limit: ContextLimitConfig {
            max_tokens: 1000,
            warning_threshold: 800,
        },
        ..test_config(&temp)
    };

    let controller = started(&temp, "greedy", "- [ ] a\n", config, Arc::new(GreedyAgent)).await;
    let store = controller.store().clone();
    let snapshot = run_to_end(controller).await;

    assert_eq!(snapshot.state, LoopState::Completed);
    assert_eq!(snapshot.exit_reason, Some(ExitReason::MaxIterations));
    assert_eq!(snapshot.iteration, 2);

    let records = store.read_iterations().unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.outcome, IterationOutcome::Aborted);
        assert_eq!(record.note.as_deref(), Some("context limit"));
        assert_eq!(record.usage.input, 900);
    }
    assert_eq!(snapshot.telemetry.usage.total(), 2200);
}

/// Replaces the iterations directory with a file so record writes fail
#[derive(Default)]
struct SaboteurAgent {
    calls: AtomicU32,
}

#[async_trait]
impl EmbeddedAgent for SaboteurAgent {
    async fn run(&self, turn: TurnContext) -> Result<Vec<ChatMessage>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            let dir = turn
                .working_dir
                .join(".agent-loop")
                .join("degraded")
                .join("iterations");
            std::fs::remove_dir_all(&dir)?;
            std::fs::write(&dir, "not a directory")?;
        }
        reply(&turn, "working".to_string())
    }
}

#[tokio::test]
async fn failed_record_writes_degrade_but_do_not_stop_the_loop() {
    let temp = TempDir::new().unwrap();
    let config = LoopConfig {
        max_iterations: Some(2),
        ..test_config(&temp)
    };

    let controller = started(
        &temp,
        "degraded",
        "- [ ] a\n",
        config,
        Arc::new(SaboteurAgent::default()),
    )
    .await;
    let store = LoopStore::new(loop_dir(&temp, "degraded"));
    let snapshot = run_to_end(controller).await;

    assert_eq!(snapshot.state, LoopState::Completed);
    assert_eq!(snapshot.iteration, 2);
    assert!(snapshot.degraded);

    let persisted = store.read_state().unwrap();
    assert!(persisted.degraded);
    assert_eq!(persisted.iteration, 2);
}

#[tokio::test]
async fn task_document_survives_the_loop() {
    let temp = TempDir::new().unwrap();
    let config = LoopConfig {
        max_iterations: Some(1),
        ..test_config(&temp)
    };

    let controller = started(
        &temp,
        "keep",
        "- [ ] keep me\n",
        config,
        Arc::new(BusyAgent::default()),
    )
    .await;
    run_to_end(controller).await;

    let dir = loop_dir(&temp, "keep");
    assert_eq!(read_file(&dir.join("task.md")), "- [ ] keep me\n");
    let frozen: LoopConfig = serde_json::from_str(&read_file(&dir.join("config.json"))).unwrap();
    assert_eq!(frozen.max_iterations, Some(1));
}
