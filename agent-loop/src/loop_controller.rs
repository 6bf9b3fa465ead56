use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::{AgentBridge, AgentSession, EventStream, TurnOutcome};
use crate::config::{validate_loop_name, ContextLimitConfig, LoopConfig};
use crate::error::{LoopError, Result};
use crate::event_log::EventLog;
use crate::events::{EventKind, SessionEvent};
use crate::registry::Registry;
use crate::router::{join_follow_ups, InputRouter, PendingMessage};
use crate::state::{ExitReason, LoopSnapshot, LoopState, SharedState};
use crate::store::LoopStore;
use crate::task::{compose_prompt, promise_regex, reflection_due, Checklist, PromptParts, TASK_TEMPLATE};
use crate::telemetry::{IterationClose, IterationOutcome, IterationRecord, TelemetryAggregator};

const OBSERVER_CAPACITY: usize = 1024;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(200);

/// What observers of a loop are told
#[derive(Debug, Clone)]
pub enum LoopEvent {
    StateChanged {
        state: LoopState,
        exit_reason: Option<ExitReason>,
        error: Option<String>,
    },
    IterationStarted {
        iteration: u32,
        reflection: bool,
        follow_ups: usize,
    },
    /// A session event, forwarded as it arrives
    Session { iteration: u32, event: SessionEvent },
    IterationFinished(IterationRecord),
}

/// Operates a running loop from other tasks
#[derive(Debug, Clone)]
pub struct LoopHandle {
    name: String,
    shared: Arc<SharedState>,
    router: InputRouter,
    kill_tx: Arc<watch::Sender<bool>>,
    events_tx: broadcast::Sender<LoopEvent>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop at the next iteration boundary
    pub async fn stop(&self) {
        info!(name = %self.name, "stop requested");
        self.shared.request_stop().await;
    }

    /// Abort the in-flight turn and stop immediately
    pub fn kill(&self) {
        warn!(name = %self.name, "kill requested");
        self.kill_tx.send_replace(true);
    }

    pub fn submit(&self, text: impl Into<String>) -> PendingMessage {
        self.router.submit(text)
    }

    pub fn steer(&self, text: impl Into<String>) -> PendingMessage {
        self.router.steer(text)
    }

    pub fn follow_up(&self, text: impl Into<String>) -> PendingMessage {
        self.router.follow_up(text)
    }

    pub async fn snapshot(&self) -> LoopSnapshot {
        self.shared.snapshot().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.events_tx.subscribe()
    }
}

/// Warns once and trips once as an iteration's context fills up
#[derive(Debug)]
struct ContextGuard {
    warning_threshold: u64,
    max_tokens: u64,
    warned: bool,
    tripped: bool,
}

impl ContextGuard {
    fn new(limits: &ContextLimitConfig) -> Self {
        Self {
            warning_threshold: limits.warning_threshold,
            max_tokens: limits.max_tokens,
            warned: false,
            tripped: false,
        }
    }

    /// Returns true the first time `tokens` reaches the limit
    fn check(&mut self, tokens: u64) -> bool {
        if !self.warned && tokens >= self.warning_threshold {
            warn!(
                "Context limit warning: {} tokens (threshold: {})",
                tokens, self.warning_threshold
            );
            self.warned = true;
        }
        if !self.tripped && tokens >= self.max_tokens {
            info!(
                "Context limit reached: {} tokens (limit: {})",
                tokens, self.max_tokens
            );
            self.tripped = true;
            return true;
        }
        false
    }
}

/// Per-turn bookkeeping
struct TurnState {
    output: String,
    guard: ContextGuard,
    context_abort: bool,
}

enum TurnResult {
    Returned(Result<TurnOutcome>),
    Killed,
}

/// How an iteration ended, from the loop's point of view
enum IterationEnd {
    Finished { promise_found: bool },
    Killed,
    Crashed(String),
}

struct Termination {
    state: LoopState,
    reason: ExitReason,
    error: Option<String>,
}

impl Termination {
    fn new(state: LoopState, reason: ExitReason, error: Option<String>) -> Self {
        Self {
            state,
            reason,
            error,
        }
    }
}

/// Drives one loop: one session, one prompt at a time, fresh context per iteration
pub struct LoopController<B: AgentBridge> {
    name: String,
    working_dir: PathBuf,
    task_content: Option<String>,
    config: LoopConfig,
    bridge: B,
    store: LoopStore,
    registry: Option<Registry>,
    shared: Arc<SharedState>,
    router: InputRouter,
    steer_rx: Option<mpsc::UnboundedReceiver<String>>,
    kill_tx: Arc<watch::Sender<bool>>,
    events_tx: broadcast::Sender<LoopEvent>,
    snapshot: LoopSnapshot,
    telemetry: TelemetryAggregator,
    event_log: Option<EventLog>,
    session: Option<Box<dyn AgentSession>>,
    session_events: Option<EventStream>,
    heartbeat: Option<JoinHandle<()>>,
    promise: Regex,
}

impl<B: AgentBridge> LoopController<B> {
    /// Validate everything that can be checked without touching disk or the agent
    pub fn new(
        name: &str,
        working_dir: &Path,
        task_content: Option<String>,
        config: LoopConfig,
        bridge: B,
    ) -> Result<Self> {
        validate_loop_name(name)?;
        config.validate()?;
        let working_dir = working_dir.canonicalize().map_err(|e| {
            LoopError::Configuration(format!(
                "working directory {} is not usable: {}",
                working_dir.display(),
                e
            ))
        })?;

        let store = LoopStore::for_loop(&working_dir, &config.state_dir, name);
        let snapshot = LoopSnapshot::new(
            name,
            working_dir.clone(),
            store.loop_dir().to_path_buf(),
            config.max_iterations,
        );
        let registry = match Registry::from_config(&config) {
            Ok(registry) => Some(registry),
            Err(e) => {
                warn!("loop will not be registered: {}", e);
                None
            }
        };

        let (router, steer_rx) = InputRouter::new();
        let (kill_tx, _) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(OBSERVER_CAPACITY);

        Ok(Self {
            name: name.to_string(),
            working_dir,
            task_content,
            promise: promise_regex(&config.completion_promise),
            config,
            bridge,
            store,
            registry,
            shared: SharedState::new_shared(snapshot.clone()),
            router,
            steer_rx: Some(steer_rx),
            kill_tx: Arc::new(kill_tx),
            events_tx,
            snapshot,
            telemetry: TelemetryAggregator::new(),
            event_log: None,
            session: None,
            session_events: None,
            heartbeat: None,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            name: self.name.clone(),
            shared: Arc::clone(&self.shared),
            router: self.router.clone(),
            kill_tx: Arc::clone(&self.kill_tx),
            events_tx: self.events_tx.clone(),
        }
    }

    pub fn store(&self) -> &LoopStore {
        &self.store
    }

    pub fn snapshot(&self) -> &LoopSnapshot {
        &self.snapshot
    }

    /// Prepare the loop directory and open the agent session.
    ///
    /// On success the loop is RUNNING. If the session cannot be opened the
    /// loop is persisted as ERROR and `BridgeUnavailable` is returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.snapshot.state != LoopState::Starting || self.session.is_some() {
            return Err(LoopError::Configuration(format!(
                "loop '{}' has already been started",
                self.name
            )));
        }
        if self.store.exists() {
            return Err(LoopError::Configuration(format!(
                "loop '{}' already exists in {}; clean it up first",
                self.name,
                self.store.loop_dir().display()
            )));
        }

        self.store.create()?;
        let task = self.task_content.as_deref().unwrap_or(TASK_TEMPLATE);
        if !self.store.ensure_task(task)? {
            info!(
                path = %self.store.task_path().display(),
                "task document already present; keeping it"
            );
        }
        self.store.write_config(&self.config)?;
        self.event_log = Some(EventLog::open(&self.store.events_path())?);
        self.persist_state().await;
        self.publish_state();

        let session = match self.bridge.open(&self.config, &self.working_dir).await {
            Ok(session) => session,
            Err(e) => {
                let message = match e {
                    LoopError::BridgeUnavailable(message) => message,
                    other => other.to_string(),
                };
                error!(name = %self.name, "agent session could not be opened: {}", message);
                self.finish(Termination::new(
                    LoopState::Error,
                    ExitReason::BridgeUnavailable,
                    Some(message.clone()),
                ))
                .await;
                return Err(LoopError::BridgeUnavailable(message));
            }
        };

        self.session_events = Some(session.subscribe());
        self.session = Some(session);
        self.snapshot.transition(LoopState::Running)?;
        self.persist_state().await;
        self.publish_state();

        if let Some(registry) = &self.registry {
            if let Err(e) = registry.register(&self.snapshot) {
                warn!("failed to register loop: {}", e);
            }
        }
        self.heartbeat = self.spawn_heartbeat();

        info!(
            name = %self.name,
            dir = %self.store.loop_dir().display(),
            max_iterations = ?self.config.max_iterations,
            "loop started"
        );
        Ok(())
    }

    /// Run iterations until the loop reaches a terminal state.
    ///
    /// A crashed session is reported through the returned snapshot, not as an error.
    pub async fn run(mut self) -> Result<LoopSnapshot> {
        let session = self.session.take().ok_or_else(|| {
            LoopError::Configuration(format!("loop '{}' was not started", self.name))
        })?;
        let mut events = self
            .session_events
            .take()
            .ok_or_else(|| LoopError::Configuration("session events already taken".to_string()))?;
        let mut steer_rx = self
            .steer_rx
            .take()
            .ok_or_else(|| LoopError::Configuration("steer channel already taken".to_string()))?;
        let mut kill_rx = self.kill_tx.subscribe();

        let result = self
            .drive(&*session, &mut events, &mut steer_rx, &mut kill_rx)
            .await;

        session.dispose().await;

        let outcome = match result {
            Ok(termination) => {
                self.finish(termination).await;
                Ok(self.snapshot.clone())
            }
            Err(e) => {
                error!(name = %self.name, "loop failed: {}", e);
                self.finish(Termination::new(
                    LoopState::Error,
                    ExitReason::Failed,
                    Some(e.to_string()),
                ))
                .await;
                Err(e)
            }
        };

        self.shutdown();
        outcome
    }

    async fn drive(
        &mut self,
        session: &dyn AgentSession,
        events: &mut EventStream,
        steer_rx: &mut mpsc::UnboundedReceiver<String>,
        kill_rx: &mut watch::Receiver<bool>,
    ) -> Result<Termination> {
        loop {
            let killed = *kill_rx.borrow();
            if killed {
                return Ok(Termination::new(LoopState::Stopped, ExitReason::Killed, None));
            }
            if self.stop_requested().await {
                return Ok(Termination::new(
                    LoopState::Stopped,
                    ExitReason::StopRequested,
                    None,
                ));
            }

            let iteration = self.snapshot.iteration + 1;
            match self
                .run_iteration(session, iteration, events, steer_rx, kill_rx)
                .await?
            {
                IterationEnd::Killed => {
                    return Ok(Termination::new(LoopState::Stopped, ExitReason::Killed, None))
                }
                IterationEnd::Crashed(message) => {
                    return Ok(Termination::new(
                        LoopState::Error,
                        ExitReason::SessionCrash,
                        Some(message),
                    ))
                }
                IterationEnd::Finished { promise_found } => {
                    if promise_found {
                        info!(
                            "Promise fulfilled after {} iterations: {}",
                            iteration, self.config.completion_promise
                        );
                        return Ok(Termination::new(
                            LoopState::Completed,
                            ExitReason::CompletionPromise,
                            None,
                        ));
                    }
                    if self.config.complete_on_checklist && self.checklist_complete() {
                        info!("Every checklist item is done after {} iterations", iteration);
                        return Ok(Termination::new(
                            LoopState::Completed,
                            ExitReason::ChecklistComplete,
                            None,
                        ));
                    }
                    if let Some(max) = self.config.max_iterations {
                        if self.snapshot.iteration >= max {
                            info!("Reached max iterations ({})", max);
                            return Ok(Termination::new(
                                LoopState::Completed,
                                ExitReason::MaxIterations,
                                None,
                            ));
                        }
                    }
                }
            }

            if let Err(e) = session.reset_context().await {
                return Ok(Termination::new(
                    LoopState::Error,
                    ExitReason::SessionCrash,
                    Some(format!("context reset failed: {}", e)),
                ));
            }
            debug!("Iteration {} complete, context reset", iteration);
        }
    }

    async fn run_iteration(
        &mut self,
        session: &dyn AgentSession,
        iteration: u32,
        events: &mut EventStream,
        steer_rx: &mut mpsc::UnboundedReceiver<String>,
        kill_rx: &mut watch::Receiver<bool>,
    ) -> Result<IterationEnd> {
        let task = self.read_task()?;
        let reflection = reflection_due(iteration, self.config.reflect_every);
        let follow_ups = self.router.drain_follow_ups();
        let follow_up_text = join_follow_ups(&follow_ups);
        let task_path = self.store.task_path().display().to_string();
        let prompt = compose_prompt(&PromptParts {
            iteration,
            max_iterations: self.config.max_iterations,
            task_path: &task_path,
            task: &task,
            completion_promise: &self.config.completion_promise,
            reflect: reflection,
            follow_ups: follow_up_text.as_deref(),
        });

        self.telemetry.begin_iteration(iteration, Utc::now());
        info!(
            iteration,
            reflection,
            follow_ups = follow_ups.len(),
            "Starting iteration {}",
            iteration
        );
        self.publish(LoopEvent::IterationStarted {
            iteration,
            reflection,
            follow_ups: follow_ups.len(),
        });

        let mut turn = TurnState {
            output: String::new(),
            guard: ContextGuard::new(&self.config.context_limit),
            context_abort: false,
        };
        self.router.set_turn_in_flight(true);

        let result = {
            let prompt_fut = session.prompt(&prompt);
            tokio::pin!(prompt_fut);
            loop {
                tokio::select! {
                    biased;
                    Ok(()) = kill_rx.changed() => {
                        let killed = *kill_rx.borrow();
                        if killed {
                            if let Err(e) = session.abort().await {
                                warn!("abort failed during kill: {}", e);
                            }
                            break TurnResult::Killed;
                        }
                    }
                    result = &mut prompt_fut => break TurnResult::Returned(result),
                    Some(event) = events.recv() => {
                        if self.observe(iteration, event, &mut turn) && !turn.context_abort {
                            turn.context_abort = true;
                            if let Err(e) = session.abort().await {
                                warn!("abort at context limit failed: {}", e);
                            }
                        }
                    }
                    Some(text) = steer_rx.recv() => {
                        if let Err(e) = session.steer(&text).await {
                            warn!("steer not delivered, queued as follow-up: {}", e);
                            self.router.follow_up(text);
                        }
                    }
                }
            }
        };

        self.router.set_turn_in_flight(false);
        for text in session.take_undelivered_steers().await {
            debug!("steer never reached the turn; queued as follow-up");
            self.router.follow_up(text);
        }
        while let Ok(text) = steer_rx.try_recv() {
            debug!("steer arrived as the turn ended; queued as follow-up");
            self.router.follow_up(text);
        }
        while let Ok(event) = events.try_recv() {
            self.observe(iteration, event, &mut turn);
        }

        let (outcome, note, end) = match result {
            TurnResult::Killed => (
                IterationOutcome::Aborted,
                Some("killed".to_string()),
                IterationEnd::Killed,
            ),
            TurnResult::Returned(Ok(TurnOutcome::Completed)) => (
                IterationOutcome::Completed,
                None,
                IterationEnd::Finished {
                    promise_found: self.promise.is_match(&turn.output),
                },
            ),
            TurnResult::Returned(Ok(TurnOutcome::Aborted)) => {
                let note = if turn.context_abort {
                    "context limit"
                } else {
                    "aborted by agent"
                };
                (
                    IterationOutcome::Aborted,
                    Some(note.to_string()),
                    IterationEnd::Finished {
                        promise_found: false,
                    },
                )
            }
            TurnResult::Returned(Err(e)) => {
                let message = match e {
                    LoopError::SessionCrash(message) => message,
                    other => other.to_string(),
                };
                error!(iteration, "agent session crashed: {}", message);
                (
                    IterationOutcome::Errored,
                    Some(message.clone()),
                    IterationEnd::Crashed(message),
                )
            }
        };

        let close = IterationClose {
            note,
            reflection,
            follow_ups: follow_ups.len(),
        };
        if let Some(record) = self.telemetry.finish_iteration(outcome, Utc::now(), close) {
            info!(
                iteration,
                outcome = ?record.outcome,
                turns = record.turns,
                tool_calls = record.tool_calls,
                tokens = record.usage.total(),
                cost = record.usage.cost,
                "Iteration {} finished",
                iteration
            );
            // the record lands before the state that counts it
            if !self
                .persist("iteration record", |store| store.write_iteration(&record))
                .await
            {
                self.snapshot.degraded = true;
            }
            self.publish(LoopEvent::IterationFinished(record));
        }

        self.snapshot.iteration = iteration;
        self.snapshot.telemetry = self.telemetry.cumulative();
        self.persist_state().await;
        self.refresh_registry();

        Ok(end)
    }

    /// Feed one event to telemetry, the event log and observers.
    /// Returns true when it pushed the iteration over its context limit.
    fn observe(&mut self, iteration: u32, event: SessionEvent, turn: &mut TurnState) -> bool {
        self.telemetry.observe(&event);

        if let Some(log) = self.event_log.as_mut() {
            if let Err(e) = log.append(iteration, &event) {
                warn!("event log write failed: {}", e);
                self.snapshot.degraded = true;
            }
        }

        if let Some(text) = event.text() {
            turn.output.push_str(text);
        }

        let mut over_limit = false;
        match &event.kind {
            EventKind::Usage { usage, .. } => over_limit = turn.guard.check(usage.total()),
            EventKind::Error { message } => warn!(iteration, "agent reported an error: {}", message),
            EventKind::Retry { attempt, message } => {
                info!(iteration, attempt, "agent retrying: {}", message)
            }
            EventKind::Compaction { reason } => info!(iteration, "agent compacted context: {}", reason),
            _ => debug!(iteration, kind = event.event_type(), "session event"),
        }

        self.publish(LoopEvent::Session { iteration, event });
        over_limit
    }

    fn read_task(&self) -> Result<String> {
        match self.store.read_task() {
            Ok(task) => Ok(task),
            Err(LoopError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("task document was deleted; recreating it");
                self.store
                    .ensure_task(self.task_content.as_deref().unwrap_or(TASK_TEMPLATE))?;
                self.store.read_task()
            }
            Err(e) => Err(e),
        }
    }

    fn checklist_complete(&self) -> bool {
        match self.store.read_task() {
            Ok(task) => Checklist::parse(&task).is_complete(),
            Err(e) => {
                warn!("could not re-read the task document: {}", e);
                false
            }
        }
    }

    async fn stop_requested(&self) -> bool {
        if self.store.take_stop_request() {
            info!(name = %self.name, "stop requested by another process");
            self.shared.request_stop().await;
        }
        self.shared.is_stop_requested().await
    }

    /// Write with one retry; false means the write failed twice
    async fn persist<F>(&self, what: &str, write: F) -> bool
    where
        F: Fn(&LoopStore) -> Result<()>,
    {
        match write(&self.store) {
            Ok(()) => return true,
            Err(e) => warn!("{} write failed, retrying: {}", what, e),
        }
        tokio::time::sleep(PERSIST_RETRY_DELAY).await;
        match write(&self.store) {
            Ok(()) => true,
            Err(e) => {
                warn!("{} write failed again; continuing degraded: {}", what, e);
                false
            }
        }
    }

    async fn persist_state(&mut self) {
        self.snapshot.updated_at = Utc::now();
        let snapshot = self.snapshot.clone();
        if !self
            .persist("state", |store| store.write_state(&snapshot))
            .await
        {
            self.snapshot.degraded = true;
        }
        self.shared.set_snapshot(self.snapshot.clone()).await;
    }

    async fn finish(&mut self, termination: Termination) {
        if let Err(e) =
            self.snapshot
                .finish(termination.state, termination.reason, termination.error)
        {
            warn!("{}", e);
            return;
        }
        self.persist_state().await;
        self.publish_state();

        match self.snapshot.state {
            LoopState::Error => error!(
                name = %self.name,
                reason = termination.reason.as_str(),
                "loop ended in error: {}",
                self.snapshot.error.as_deref().unwrap_or("unknown error")
            ),
            state => info!(
                name = %self.name,
                iterations = self.snapshot.iteration,
                reason = termination.reason.as_str(),
                "loop {}",
                state
            ),
        }
    }

    fn shutdown(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.deregister(&self.working_dir, &self.name) {
                warn!("failed to deregister loop: {}", e);
            }
        }
    }

    fn refresh_registry(&self) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.heartbeat(&self.snapshot) {
                debug!("registry refresh failed: {}", e);
            }
        }
    }

    fn spawn_heartbeat(&self) -> Option<JoinHandle<()>> {
        let registry = self.registry.clone()?;
        let shared = Arc::clone(&self.shared);
        let period = Duration::from_secs(self.config.heartbeat_secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately; registration already wrote the entry
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = shared.snapshot().await;
                if let Err(e) = registry.heartbeat(&snapshot) {
                    warn!("registry heartbeat failed: {}", e);
                }
            }
        }))
    }

    fn publish(&self, event: LoopEvent) {
        // no observers is fine
        let _ = self.events_tx.send(event);
    }

    fn publish_state(&self) {
        self.publish(LoopEvent::StateChanged {
            state: self.snapshot.state,
            exit_reason: self.snapshot.exit_reason,
            error: self.snapshot.error.clone(),
        });
    }
}

impl<B: AgentBridge> Drop for LoopController<B> {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}
