//! The agent session abstraction the loop controller drives.
//!
//! A bridge opens sessions; a session runs one prompt at a time and publishes
//! its events to every subscriber. Both implementations publish the terminal
//! `agent_end` event before `prompt` resolves, so a subscriber that drains its
//! stream after `prompt` returns has seen the whole turn.

pub mod in_process;
pub mod rpc;

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::LoopConfig;
use crate::error::Result;
use crate::events::{EventKind, SessionEvent};

pub use in_process::{ChatMessage, EmbeddedAgent, InProcessBridge, Role, TurnContext};
pub use rpc::RpcBridge;

/// Ordered stream of events from one session
pub type EventStream = mpsc::UnboundedReceiver<SessionEvent>;

/// How a prompt ended when the session itself survived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Aborted,
}

/// Opens agent sessions
#[async_trait]
pub trait AgentBridge: Send + Sync {
    /// Open a session rooted at `working_dir`; failures surface as `BridgeUnavailable`
    async fn open(&self, config: &LoopConfig, working_dir: &Path) -> Result<Box<dyn AgentSession>>;
}

#[async_trait]
impl<T: AgentBridge + ?Sized> AgentBridge for Arc<T> {
    async fn open(&self, config: &LoopConfig, working_dir: &Path) -> Result<Box<dyn AgentSession>> {
        (**self).open(config, working_dir).await
    }
}

/// A live agent conversation
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Run one prompt; resolves after the terminal event has been published.
    /// A crash or exit mid-turn is `Err(SessionCrash)`.
    async fn prompt(&self, text: &str) -> Result<TurnOutcome>;

    /// Inject a message into the in-flight turn
    async fn steer(&self, text: &str) -> Result<()>;

    /// Steers accepted by `steer` that the finished turn never consumed,
    /// oldest first. Called once `prompt` has resolved.
    async fn take_undelivered_steers(&self) -> Vec<String> {
        Vec::new()
    }

    /// Drop the conversation history so the next prompt starts fresh
    async fn reset_context(&self) -> Result<()>;

    fn subscribe(&self) -> EventStream;

    /// Cancel the in-flight turn without resetting context
    async fn abort(&self) -> Result<()>;

    /// Release every resource; safe to call more than once
    async fn dispose(&self);
}

/// Fan-out of session events to subscribers
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Deliver to every live subscriber, forgetting closed ones
    pub fn emit(&self, event: SessionEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn emit_kind(&self, kind: EventKind) {
        self.emit(SessionEvent::new(kind));
    }
}
