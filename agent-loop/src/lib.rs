//! Agent Loop: drives a long-running LLM agent task as a series of
//! fresh-context iterations.
//!
//! The task document on disk is the agent's only memory between iterations.
//! Operators can steer the in-flight turn or queue follow-ups for the next
//! iteration, and every iteration leaves durable telemetry behind.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod events;
pub mod loop_controller;
pub mod monitor;
pub mod process;
pub mod registry;
pub mod router;
pub mod state;
pub mod store;
pub mod task;
pub mod telemetry;

pub use bridge::{AgentBridge, AgentSession, EmbeddedAgent, InProcessBridge, RpcBridge, TurnOutcome};
pub use config::{ConfigOverrides, LoopConfig, ThinkingLevel};
pub use engine::LoopEngine;
pub use error::{LoopError, Result};
pub use events::{EventKind, SessionEvent, TokenUsage};
pub use loop_controller::{LoopController, LoopEvent, LoopHandle};
pub use router::{InputRouter, PendingMessage};
pub use state::{ExitReason, LoopSnapshot, LoopState};
pub use telemetry::{IterationOutcome, IterationRecord, TelemetryTotals};
