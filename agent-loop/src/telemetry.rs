//! Per-iteration and cumulative usage accounting.
//!
//! Every event is counted at most once, keyed by its id, so a transport that
//! redelivers an event (or a late usage report after an abort) never inflates
//! the numbers. Ids are remembered for the current and the previous
//! iteration, which is as far back as a late report can arrive.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{EventKind, SessionEvent, TokenUsage};

/// Totals across every iteration of a loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryTotals {
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub turns: u32,
    #[serde(default)]
    pub tool_calls: u32,
    #[serde(default)]
    pub tool_errors: u32,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub duration_ms: u64,
}

/// How an iteration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    /// The agent finished its turn
    Completed,
    /// The turn was cut short (kill or context limit)
    Aborted,
    /// The session crashed mid-turn
    Errored,
}

/// One completed iteration, persisted as `iterations/NNN.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// Iteration number (1-indexed)
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub usage: TokenUsage,
    pub turns: u32,
    pub tool_calls: u32,
    #[serde(default)]
    pub tool_errors: u32,
    pub outcome: IterationOutcome,
    /// Error message or abort reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Whether the prompt carried the reflection instruction
    #[serde(default)]
    pub reflection: bool,
    /// Number of operator follow-ups folded into the prompt
    #[serde(default)]
    pub follow_ups: usize,
}

/// Details of the finished iteration that telemetry cannot see
#[derive(Debug, Clone, Default)]
pub struct IterationClose {
    pub note: Option<String>,
    pub reflection: bool,
    pub follow_ups: usize,
}

#[derive(Debug)]
struct IterationAccumulator {
    iteration: u32,
    started_at: DateTime<Utc>,
    usage: TokenUsage,
    turns: u32,
    tool_calls: u32,
    tool_errors: u32,
}

/// Consumes session events into per-iteration and cumulative numbers
#[derive(Debug, Default)]
pub struct TelemetryAggregator {
    seen: HashSet<String>,
    seen_before: HashSet<String>,
    current: Option<IterationAccumulator>,
    cumulative: TelemetryTotals,
}

impl TelemetryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the per-iteration accumulator
    pub fn begin_iteration(&mut self, iteration: u32, started_at: DateTime<Utc>) {
        self.seen_before = std::mem::take(&mut self.seen);
        self.current = Some(IterationAccumulator {
            iteration,
            started_at,
            usage: TokenUsage::default(),
            turns: 0,
            tool_calls: 0,
            tool_errors: 0,
        });
    }

    /// Account for one event; returns false if it was already counted or carries nothing
    pub fn observe(&mut self, event: &SessionEvent) -> bool {
        let counts = matches!(
            event.kind,
            EventKind::Usage { .. }
                | EventKind::TurnStart
                | EventKind::ToolCallStart { .. }
                | EventKind::ToolCallEnd { is_error: true, .. }
        );
        if !counts {
            return false;
        }
        if self.seen_before.contains(&event.id) || !self.seen.insert(event.id.clone()) {
            debug!(id = %event.id, kind = event.event_type(), "duplicate event ignored");
            return false;
        }

        let mut usage = TokenUsage::default();
        let (mut turns, mut tool_calls, mut tool_errors) = (0, 0, 0);
        match &event.kind {
            EventKind::Usage { usage: u, .. } => usage = *u,
            EventKind::TurnStart => turns = 1,
            EventKind::ToolCallStart { .. } => tool_calls = 1,
            EventKind::ToolCallEnd { .. } => tool_errors = 1,
            _ => {}
        }

        self.cumulative.usage += usage;
        self.cumulative.turns += turns;
        self.cumulative.tool_calls += tool_calls;
        self.cumulative.tool_errors += tool_errors;

        match self.current.as_mut() {
            Some(acc) => {
                acc.usage += usage;
                acc.turns += turns;
                acc.tool_calls += tool_calls;
                acc.tool_errors += tool_errors;
            }
            None => debug!(id = %event.id, "event outside an iteration folded into totals"),
        }
        true
    }

    /// Usage so far in the active iteration
    pub fn current_usage(&self) -> TokenUsage {
        self.current
            .as_ref()
            .map(|acc| acc.usage)
            .unwrap_or_default()
    }

    /// Close the active iteration and produce its record
    pub fn finish_iteration(
        &mut self,
        outcome: IterationOutcome,
        ended_at: DateTime<Utc>,
        close: IterationClose,
    ) -> Option<IterationRecord> {
        let acc = self.current.take()?;
        let duration_ms = (ended_at - acc.started_at).num_milliseconds().max(0) as u64;

        self.cumulative.iterations += 1;
        self.cumulative.duration_ms += duration_ms;

        Some(IterationRecord {
            iteration: acc.iteration,
            started_at: acc.started_at,
            ended_at,
            duration_ms,
            usage: acc.usage,
            turns: acc.turns,
            tool_calls: acc.tool_calls,
            tool_errors: acc.tool_errors,
            outcome,
            note: close.note,
            reflection: close.reflection,
            follow_ups: close.follow_ups,
        })
    }

    pub fn cumulative(&self) -> TelemetryTotals {
        self.cumulative
    }

    /// Ids currently remembered for deduplication
    pub fn remembered(&self) -> usize {
        self.seen.len() + self.seen_before.len()
    }
}
