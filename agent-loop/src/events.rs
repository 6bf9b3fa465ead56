//! Session events and the agent's JSON-lines wire format.
//!
//! The out-of-process agent speaks one JSON object per line on stdout:
//! - `response`: acknowledgement of a command, correlated by `id`
//! - `agent_start` / `agent_end`: bracket the work for one prompt
//! - `turn_start` / `turn_end`: one LLM round inside a prompt
//! - `message_update`: streaming assistant deltas
//! - `message_end`: a finished message, carrying usage for assistant messages
//! - `tool_execution_start` / `tool_execution_end`: tool calls
//! - `auto_retry_start`, `auto_compaction_start`: recovery activity
//!
//! Events that telemetry counts get ids derived from the line itself (tool
//! call ids, response ids, prompt and turn positions) so a line delivered
//! twice is recognized as the same event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::ops::AddAssign;
use uuid::Uuid;

use crate::error::{LoopError, Result};

/// Token and cost usage reported for one assistant message
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
    #[serde(default)]
    pub cost: f64,
}

impl TokenUsage {
    /// Get total tokens (input + output)
    pub fn total(&self) -> u64 {
        self.input + self.output
    }

    /// Parse the agent's usage object (`cacheRead`, `cacheWrite`, `cost.total`)
    pub fn from_wire(value: &Value) -> Self {
        let count = |key: &str| value.get(key).and_then(Value::as_u64).unwrap_or(0);
        let cost = match value.get("cost") {
            Some(Value::Object(obj)) => obj.get("total").and_then(Value::as_f64).unwrap_or(0.0),
            Some(other) => other.as_f64().unwrap_or(0.0),
            None => 0.0,
        };
        Self {
            input: count("input"),
            output: count("output"),
            cache_read: count("cacheRead"),
            cache_write: count("cacheWrite"),
            cost,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input += rhs.input;
        self.output += rhs.output;
        self.cache_read += rhs.cache_read;
        self.cache_write += rhs.cache_write;
        self.cost += rhs.cost;
    }
}

/// What happened in one unit of agent activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The agent began working on a prompt
    AgentStart,
    /// One LLM round started
    TurnStart,
    /// Streaming assistant text
    MessageDelta { text: String },
    /// A tool call began
    ToolCallStart {
        call_id: String,
        tool: String,
        #[serde(default)]
        args: Value,
    },
    /// A tool call finished
    ToolCallEnd {
        call_id: String,
        tool: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        output: String,
    },
    /// Usage for a completed assistant message
    Usage {
        usage: TokenUsage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },
    /// One LLM round finished
    TurnEnd,
    /// The prompt is finished; always the last event of an iteration
    AgentEnd {
        #[serde(default)]
        aborted: bool,
    },
    /// The agent is retrying a failed request
    Retry { attempt: u32, message: String },
    /// The agent compacted its context
    Compaction { reason: String },
    /// A steering message was handed to the session
    Steered { message: String },
    /// The agent reported an error
    Error { message: String },
}

/// One event from an agent session, with the identity used for deduplication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SessionEvent {
    /// Create an event with a fresh identity
    pub fn new(kind: EventKind) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind)
    }

    /// Create an event with a caller-chosen identity
    pub fn with_id(id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Whether this event ends the prompt it belongs to
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::AgentEnd { .. })
    }

    /// Get the event type as a string for logging
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::AgentStart => "agent_start",
            EventKind::TurnStart => "turn_start",
            EventKind::MessageDelta { .. } => "message_delta",
            EventKind::ToolCallStart { .. } => "tool_call_start",
            EventKind::ToolCallEnd { .. } => "tool_call_end",
            EventKind::Usage { .. } => "usage",
            EventKind::TurnEnd => "turn_end",
            EventKind::AgentEnd { .. } => "agent_end",
            EventKind::Retry { .. } => "retry",
            EventKind::Compaction { .. } => "compaction",
            EventKind::Steered { .. } => "steered",
            EventKind::Error { .. } => "error",
        }
    }

    /// Assistant text carried by this event, if any
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            EventKind::MessageDelta { text } => Some(text),
            _ => None,
        }
    }
}

/// Acknowledgement of a command written to the agent
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: Option<String>,
    pub command: String,
    pub success: bool,
    pub error: Option<String>,
}

/// A parsed line of agent output
#[derive(Debug, Clone)]
pub enum RpcLine {
    Response(RpcResponse),
    Events(Vec<SessionEvent>),
    /// Recognized JSON with nothing to report (kept for debug logging)
    Ignored(String),
}

/// Where an agent's output stream currently is, so ids survive replayed lines.
///
/// A `turn_start` seen while a turn is already open is the same turn again;
/// likewise for `agent_start` inside an open prompt.
#[derive(Debug, Clone)]
pub struct WireCursor {
    stream: String,
    prompt: u64,
    turn: u64,
    in_prompt: bool,
    in_turn: bool,
}

impl Default for WireCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCursor {
    pub fn new() -> Self {
        let stream = Uuid::new_v4().simple().to_string();
        Self {
            stream: stream[..8].to_string(),
            prompt: 0,
            turn: 0,
            in_prompt: false,
            in_turn: false,
        }
    }

    fn start_prompt(&mut self) -> String {
        if !self.in_prompt {
            self.prompt += 1;
            self.turn = 0;
            self.in_prompt = true;
            self.in_turn = false;
        }
        format!("agent-start-{}-{}", self.stream, self.prompt)
    }

    fn end_prompt(&mut self) -> String {
        self.in_prompt = false;
        self.in_turn = false;
        format!("agent-end-{}-{}", self.stream, self.prompt)
    }

    fn start_turn(&mut self) -> String {
        if !self.in_turn {
            self.turn += 1;
            self.in_turn = true;
        }
        format!("turn-start-{}-{}-{}", self.stream, self.prompt, self.turn)
    }

    fn end_turn(&mut self) -> String {
        self.in_turn = false;
        format!("turn-end-{}-{}-{}", self.stream, self.prompt, self.turn)
    }

    /// Id for a line with no identity of its own, scoped to the current prompt
    fn content_id(&self, prefix: &str, value: &Value) -> String {
        format!(
            "{}-{}-{}-{}",
            prefix,
            self.stream,
            self.prompt,
            content_hash(value)
        )
    }
}

/// First 16 hex chars of the SHA-256 of the value's JSON
fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

impl RpcLine {
    /// Parse a JSON line on its own; ids of position-keyed events are not
    /// comparable with any other line's
    pub fn parse(line: &str) -> Result<Self> {
        Self::parse_at(line, &mut WireCursor::new())
    }

    /// Parse a JSON line from the agent's stdout, advancing `cursor`
    pub fn parse_at(line: &str, cursor: &mut WireCursor) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(LoopError::JsonParse("empty line".to_string()));
        }

        let value: Value = serde_json::from_str(line)?;
        let line_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let str_field = |v: &Value, key: &str| -> String {
            v.get(key).and_then(Value::as_str).unwrap_or("").to_string()
        };
        let call_id = |prefix: &str, cursor: &WireCursor| -> String {
            match value.get("toolCallId").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => format!("{}-{}", prefix, id),
                _ => cursor.content_id(prefix, &value),
            }
        };

        let events = match line_type.as_str() {
            "response" => {
                return Ok(RpcLine::Response(RpcResponse {
                    id: value.get("id").and_then(Value::as_str).map(String::from),
                    command: str_field(&value, "command"),
                    success: value.get("success").and_then(Value::as_bool).unwrap_or(false),
                    error: value.get("error").and_then(Value::as_str).map(String::from),
                }))
            }
            "agent_start" => vec![SessionEvent::with_id(
                cursor.start_prompt(),
                EventKind::AgentStart,
            )],
            "agent_end" => vec![SessionEvent::with_id(
                cursor.end_prompt(),
                EventKind::AgentEnd {
                    aborted: value.get("aborted").and_then(Value::as_bool).unwrap_or(false),
                },
            )],
            "turn_start" => vec![SessionEvent::with_id(
                cursor.start_turn(),
                EventKind::TurnStart,
            )],
            "turn_end" => vec![SessionEvent::with_id(cursor.end_turn(), EventKind::TurnEnd)],
            "message_update" => {
                let delta = value.get("assistantMessageEvent");
                let kind = delta.and_then(|d| d.get("type")).and_then(Value::as_str);
                match (kind, delta) {
                    (Some("text_delta"), Some(d)) => vec![SessionEvent::new(
                        EventKind::MessageDelta {
                            text: str_field(d, "delta"),
                        },
                    )],
                    _ => Vec::new(),
                }
            }
            "message_end" => {
                parse_message_end(value.get("message").unwrap_or(&Value::Null), cursor)
            }
            "tool_execution_start" => vec![SessionEvent::with_id(
                call_id("tool-start", &*cursor),
                EventKind::ToolCallStart {
                    call_id: str_field(&value, "toolCallId"),
                    tool: str_field(&value, "toolName"),
                    args: value.get("args").cloned().unwrap_or(Value::Null),
                },
            )],
            "tool_execution_end" => vec![SessionEvent::with_id(
                call_id("tool-end", &*cursor),
                EventKind::ToolCallEnd {
                    call_id: str_field(&value, "toolCallId"),
                    tool: str_field(&value, "toolName"),
                    is_error: value.get("isError").and_then(Value::as_bool).unwrap_or(false),
                    output: extract_result_text(value.get("result").unwrap_or(&Value::Null)),
                },
            )],
            "auto_retry_start" => vec![SessionEvent::new(EventKind::Retry {
                attempt: value.get("attempt").and_then(Value::as_u64).unwrap_or(1) as u32,
                message: str_field(&value, "errorMessage"),
            })],
            "auto_compaction_start" => vec![SessionEvent::new(EventKind::Compaction {
                reason: str_field(&value, "reason"),
            })],
            _ => Vec::new(),
        };

        if events.is_empty() {
            Ok(RpcLine::Ignored(line_type))
        } else {
            Ok(RpcLine::Events(events))
        }
    }
}

/// Usage and error reporting for a finished assistant message
fn parse_message_end(message: &Value, cursor: &WireCursor) -> Vec<SessionEvent> {
    if message.get("role").and_then(Value::as_str) != Some("assistant") {
        return Vec::new();
    }

    let mut events = Vec::new();
    if let Some(usage) = message.get("usage") {
        let id = message
            .get("responseId")
            .and_then(Value::as_str)
            .map(|id| format!("usage-{}", id))
            .or_else(|| {
                message
                    .get("timestamp")
                    .and_then(Value::as_i64)
                    .map(|ts| format!("usage-ts-{}", ts))
            })
            .unwrap_or_else(|| cursor.content_id("usage", message));
        events.push(SessionEvent::with_id(
            id,
            EventKind::Usage {
                usage: TokenUsage::from_wire(usage),
                model: message.get("model").and_then(Value::as_str).map(String::from),
                provider: message
                    .get("provider")
                    .and_then(Value::as_str)
                    .map(String::from),
            },
        ));
    }

    if message.get("stopReason").and_then(Value::as_str) == Some("error") {
        let text = message
            .get("errorMessage")
            .and_then(Value::as_str)
            .unwrap_or("assistant message ended with an error");
        events.push(SessionEvent::new(EventKind::Error {
            message: text.to_string(),
        }));
    }
    events
}

/// Flatten a tool result (string or `{content: [{type: text, text}]}`) to text
fn extract_result_text(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        Value::Object(_) => result
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default(),
        _ => String::new(),
    }
}
