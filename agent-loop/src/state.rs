use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{LoopError, Result};
use crate::telemetry::TelemetryTotals;

/// Lifecycle state of a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Starting,
    Running,
    Stopped,
    Completed,
    Error,
}

impl LoopState {
    /// Stopped, completed and error are sinks
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopState::Stopped | LoopState::Completed | LoopState::Error
        )
    }

    pub fn can_transition_to(&self, next: LoopState) -> bool {
        matches!(
            (self, next),
            (LoopState::Starting, LoopState::Running)
                | (LoopState::Starting, LoopState::Error)
                | (LoopState::Running, LoopState::Stopped)
                | (LoopState::Running, LoopState::Completed)
                | (LoopState::Running, LoopState::Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::Stopped => "stopped",
            LoopState::Completed => "completed",
            LoopState::Error => "error",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a loop reached its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The iteration counter reached the configured maximum
    MaxIterations,
    /// The agent emitted the completion promise
    CompletionPromise,
    /// Every checklist item in the task document is ticked
    ChecklistComplete,
    /// An operator stop was honored at an iteration boundary
    StopRequested,
    /// An operator force-terminated the loop mid-turn
    Killed,
    /// The agent session terminated abnormally
    SessionCrash,
    /// The agent session could not be opened
    BridgeUnavailable,
    /// The process that owned the loop disappeared
    OwnerLost,
    /// The controller hit an error it could not continue past
    Failed,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::MaxIterations => "max iterations",
            ExitReason::CompletionPromise => "promise fulfilled",
            ExitReason::ChecklistComplete => "checklist complete",
            ExitReason::StopRequested => "stop requested",
            ExitReason::Killed => "killed",
            ExitReason::SessionCrash => "session crash",
            ExitReason::BridgeUnavailable => "bridge unavailable",
            ExitReason::OwnerLost => "owner lost",
            ExitReason::Failed => "failed",
        }
    }
}

/// Snapshot of a loop instance, persisted as `state.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSnapshot {
    pub name: String,
    pub working_directory: PathBuf,
    pub loop_directory: PathBuf,
    /// Process that owns the controller
    pub pid: u32,
    pub state: LoopState,
    /// Number of completed iterations
    pub iteration: u32,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub telemetry: TelemetryTotals,
    /// Set once a durable write has failed twice in a row
    #[serde(default)]
    pub degraded: bool,
}

impl LoopSnapshot {
    /// Create a snapshot in the starting state owned by this process
    pub fn new(
        name: &str,
        working_directory: PathBuf,
        loop_directory: PathBuf,
        max_iterations: Option<u32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            working_directory,
            loop_directory,
            pid: std::process::id(),
            state: LoopState::Starting,
            iteration: 0,
            max_iterations,
            created_at: now,
            updated_at: now,
            exit_reason: None,
            error: None,
            telemetry: TelemetryTotals::default(),
            degraded: false,
        }
    }

    /// Move to `next`, refusing anything the state machine forbids
    pub fn transition(&mut self, next: LoopState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(LoopError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to a terminal state, recording why
    pub fn finish(
        &mut self,
        next: LoopState,
        reason: ExitReason,
        error: Option<String>,
    ) -> Result<()> {
        self.transition(next)?;
        self.exit_reason = Some(reason);
        self.error = error;
        Ok(())
    }
}

/// Live state shared between a running controller and its handles
#[derive(Debug)]
pub struct SharedState {
    /// Latest snapshot; the controller is the only writer
    pub snapshot: RwLock<LoopSnapshot>,
    /// Set by an operator stop, honored at the next iteration boundary
    pub stop_requested: RwLock<bool>,
}

impl SharedState {
    /// Create an Arc-wrapped SharedState for sharing between tasks
    pub fn new_shared(snapshot: LoopSnapshot) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(snapshot),
            stop_requested: RwLock::new(false),
        })
    }

    pub async fn snapshot(&self) -> LoopSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn set_snapshot(&self, snapshot: LoopSnapshot) {
        *self.snapshot.write().await = snapshot;
    }

    pub async fn request_stop(&self) {
        *self.stop_requested.write().await = true;
    }

    pub async fn is_stop_requested(&self) -> bool {
        *self.stop_requested.read().await
    }
}
