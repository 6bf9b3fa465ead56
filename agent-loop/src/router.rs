//! Classification of operator input into steers and follow-ups.
//!
//! A steer is forwarded to the live session as soon as the controller picks it
//! up; a follow-up waits for the next iteration boundary. Whether a turn is in
//! flight decides which one a plain submission becomes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

/// Operator input after classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingMessage {
    /// Delivered to the in-flight turn
    Steer(String),
    /// Delivered with the next iteration's prompt
    FollowUp(String),
}

#[derive(Debug, Default)]
struct RouterState {
    turn_in_flight: bool,
    follow_ups: VecDeque<String>,
}

/// Shared entry point for operator input; clones feed the same queue
#[derive(Debug, Clone)]
pub struct InputRouter {
    state: Arc<Mutex<RouterState>>,
    steer_tx: mpsc::UnboundedSender<String>,
}

impl InputRouter {
    /// Create a router and the receiving end of its steer channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (steer_tx, steer_rx) = mpsc::unbounded_channel();
        let router = Self {
            state: Arc::new(Mutex::new(RouterState::default())),
            steer_tx,
        };
        (router, steer_rx)
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Steer when a turn is in flight, follow-up otherwise
    pub fn submit(&self, text: impl Into<String>) -> PendingMessage {
        self.steer(text)
    }

    /// Interrupt the current turn; becomes a follow-up when there is nothing to interrupt
    pub fn steer(&self, text: impl Into<String>) -> PendingMessage {
        let text = text.into();
        let mut state = self.lock();
        // Decided under the lock so a turn ending concurrently cannot strand the message
        if state.turn_in_flight && self.steer_tx.send(text.clone()).is_ok() {
            debug!("operator input routed as steer");
            return PendingMessage::Steer(text);
        }
        debug!("operator input queued as follow-up");
        state.follow_ups.push_back(text.clone());
        PendingMessage::FollowUp(text)
    }

    /// Queue for the next iteration regardless of turn state
    pub fn follow_up(&self, text: impl Into<String>) -> PendingMessage {
        let text = text.into();
        self.lock().follow_ups.push_back(text.clone());
        PendingMessage::FollowUp(text)
    }

    /// Take every queued follow-up, oldest first
    pub fn drain_follow_ups(&self) -> Vec<String> {
        self.lock().follow_ups.drain(..).collect()
    }

    pub fn pending_follow_ups(&self) -> usize {
        self.lock().follow_ups.len()
    }

    pub fn set_turn_in_flight(&self, in_flight: bool) {
        self.lock().turn_in_flight = in_flight;
    }

    pub fn is_turn_in_flight(&self) -> bool {
        self.lock().turn_in_flight
    }
}

/// Concatenate drained follow-ups in submission order
pub fn join_follow_ups(follow_ups: &[String]) -> Option<String> {
    if follow_ups.is_empty() {
        None
    } else {
        Some(follow_ups.join("\n\n"))
    }
}
