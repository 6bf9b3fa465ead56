//! In-process bridge: drives an agent object living in the same process.
//!
//! The session owns the conversation history and hands a copy to the agent
//! for each prompt. Steers land in a FIFO inbox the agent drains at its
//! tool-call boundaries with [`TurnContext::take_steering`]; anything not yet
//! taken when a turn ends stays queued for the next turn.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::bridge::{AgentBridge, AgentSession, EventHub, EventStream, TurnOutcome};
use crate::config::LoopConfig;
use crate::error::{LoopError, Result};
use crate::events::{EventKind, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

type SteeringInbox = Arc<StdMutex<VecDeque<String>>>;

/// Everything an embedded agent sees while running one prompt
pub struct TurnContext {
    /// The prompt for this turn
    pub prompt: String,
    /// Conversation so far, excluding `prompt`
    pub history: Vec<ChatMessage>,
    pub working_dir: PathBuf,
    hub: EventHub,
    steering: SteeringInbox,
}

impl TurnContext {
    pub fn emit(&self, kind: EventKind) {
        self.hub.emit_kind(kind);
    }

    /// Publish an event with a caller-chosen identity
    pub fn emit_event(&self, event: SessionEvent) {
        self.hub.emit(event);
    }

    /// Take every steer delivered so far, oldest first
    pub fn take_steering(&self) -> Vec<String> {
        self.steering
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect()
    }
}

/// An agent that can be driven directly
#[async_trait]
pub trait EmbeddedAgent: Send + Sync {
    /// Run one prompt and return the messages it adds to the conversation
    async fn run(&self, turn: TurnContext) -> Result<Vec<ChatMessage>>;
}

/// Opens sessions over a shared embedded agent
pub struct InProcessBridge<A> {
    agent: Arc<A>,
}

impl<A> InProcessBridge<A> {
    pub fn new(agent: A) -> Self {
        Self {
            agent: Arc::new(agent),
        }
    }

    pub fn from_arc(agent: Arc<A>) -> Self {
        Self { agent }
    }
}

impl<A> Clone for InProcessBridge<A> {
    fn clone(&self) -> Self {
        Self {
            agent: Arc::clone(&self.agent),
        }
    }
}

#[async_trait]
impl<A: EmbeddedAgent + 'static> AgentBridge for InProcessBridge<A> {
    async fn open(&self, _config: &LoopConfig, working_dir: &Path) -> Result<Box<dyn AgentSession>> {
        Ok(Box::new(InProcessSession::new(
            Arc::clone(&self.agent),
            working_dir,
        )))
    }
}

pub struct InProcessSession<A> {
    agent: Arc<A>,
    working_dir: PathBuf,
    history: Mutex<Vec<ChatMessage>>,
    hub: EventHub,
    steering: SteeringInbox,
    abort_tx: watch::Sender<bool>,
    disposed: AtomicBool,
}

impl<A: EmbeddedAgent> InProcessSession<A> {
    pub fn new(agent: Arc<A>, working_dir: &Path) -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            agent,
            working_dir: working_dir.to_path_buf(),
            history: Mutex::new(Vec::new()),
            hub: EventHub::new(),
            steering: Arc::new(StdMutex::new(VecDeque::new())),
            abort_tx,
            disposed: AtomicBool::new(false),
        }
    }

    /// Current conversation history
    pub async fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().await.clone()
    }
}

async fn aborted(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl<A: EmbeddedAgent + 'static> AgentSession for InProcessSession<A> {
    async fn prompt(&self, text: &str) -> Result<TurnOutcome> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(LoopError::SessionCrash("session already disposed".to_string()));
        }

        self.abort_tx.send_replace(false);
        let mut abort_rx = self.abort_tx.subscribe();

        let turn = TurnContext {
            prompt: text.to_string(),
            history: self.history.lock().await.clone(),
            working_dir: self.working_dir.clone(),
            hub: self.hub.clone(),
            steering: Arc::clone(&self.steering),
        };

        self.hub.emit_kind(EventKind::AgentStart);
        let result = tokio::select! {
            result = self.agent.run(turn) => Some(result),
            _ = aborted(&mut abort_rx) => None,
        };

        match result {
            Some(Ok(messages)) => {
                let mut history = self.history.lock().await;
                history.push(ChatMessage::user(text));
                history.extend(messages);
                drop(history);
                self.hub.emit_kind(EventKind::AgentEnd { aborted: false });
                Ok(TurnOutcome::Completed)
            }
            None => {
                debug!("in-process turn aborted");
                self.history.lock().await.push(ChatMessage::user(text));
                self.hub.emit_kind(EventKind::AgentEnd { aborted: true });
                Ok(TurnOutcome::Aborted)
            }
            Some(Err(e)) => {
                let message = match e {
                    LoopError::SessionCrash(message) => message,
                    other => other.to_string(),
                };
                self.hub.emit_kind(EventKind::Error {
                    message: message.clone(),
                });
                Err(LoopError::SessionCrash(message))
            }
        }
    }

    async fn steer(&self, text: &str) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            warn!("steer after dispose ignored");
            return Ok(());
        }
        self.steering
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(text.to_string());
        self.hub.emit_kind(EventKind::Steered {
            message: text.to_string(),
        });
        Ok(())
    }

    async fn take_undelivered_steers(&self) -> Vec<String> {
        self.steering
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect()
    }

    async fn reset_context(&self) -> Result<()> {
        self.history.lock().await.clear();
        let dropped = self.take_undelivered_steers().await;
        if !dropped.is_empty() {
            warn!(count = dropped.len(), "steers discarded by context reset");
        }
        Ok(())
    }

    fn subscribe(&self) -> EventStream {
        self.hub.subscribe()
    }

    async fn abort(&self) -> Result<()> {
        self.abort_tx.send_replace(true);
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_tx.send_replace(true);
        self.history.lock().await.clear();
    }
}
