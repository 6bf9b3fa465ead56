//! Per-iteration summaries built from a loop's event log.
//!
//! Tool failures that are not real errors (a search that matched nothing,
//! usage messages, inspector rebuild chatter) are filtered out before
//! counting. What remains is classified so recurring problems stand out.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use agent_loop::event_log::LoggedEvent;
use agent_loop::events::EventKind;
use agent_loop::telemetry::IterationRecord;

/// Longest error text kept per failure
pub const MAX_ERROR_TEXT: usize = 500;

/// A tool failure that counts as a real error
#[derive(Debug, Clone, PartialEq)]
pub struct ToolError {
    pub tool: String,
    pub text: String,
    /// Turn within the iteration, 1-based; 0 before the first turn
    pub turn: u32,
}

/// Everything one iteration did, as seen in the event log
#[derive(Debug, Clone, Default)]
pub struct IterationSummary {
    pub iteration: u32,
    pub timestamp: Option<DateTime<Utc>>,
    pub model: String,
    pub provider: String,
    pub turns: u32,
    pub tool_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub cost: f64,
    pub errors: Vec<ToolError>,
    /// Tool name and call count, most used first
    pub tools_used: Vec<(String, usize)>,
    pub files_read: Vec<String>,
    pub files_written: Vec<String>,
    /// Outcome from the iteration record, when one was written
    pub outcome: Option<String>,
}

/// Group logged events by iteration and summarize each group.
/// Events replayed with the same id are counted once.
pub fn summarize(events: &[LoggedEvent], records: &[IterationRecord]) -> Vec<IterationSummary> {
    let mut summaries: Vec<IterationSummary> = Vec::new();
    let mut tools: Vec<Vec<String>> = Vec::new();
    let mut seen = HashSet::new();

    for logged in events {
        if !seen.insert(logged.event.id.clone()) {
            continue;
        }

        let index = match summaries.iter().position(|s| s.iteration == logged.iteration) {
            Some(index) => index,
            None => {
                summaries.push(IterationSummary {
                    iteration: logged.iteration,
                    timestamp: Some(logged.event.timestamp),
                    ..Default::default()
                });
                tools.push(Vec::new());
                summaries.len() - 1
            }
        };
        let summary = &mut summaries[index];

        match &logged.event.kind {
            EventKind::TurnStart => summary.turns += 1,
            EventKind::Usage {
                usage,
                model,
                provider,
            } => {
                summary.input_tokens += usage.input;
                summary.output_tokens += usage.output;
                summary.cache_read += usage.cache_read;
                summary.cache_write += usage.cache_write;
                summary.cost += usage.cost;
                if summary.model.is_empty() {
                    summary.model = model.clone().unwrap_or_default();
                    summary.provider = provider.clone().unwrap_or_default();
                }
            }
            EventKind::ToolCallStart { tool, args, .. } => {
                summary.tool_calls += 1;
                tools[index].push(tool.clone());
                let path = args
                    .get("path")
                    .and_then(|p| p.as_str())
                    .unwrap_or("")
                    .to_string();
                match tool.as_str() {
                    "read" => summary.files_read.push(path),
                    "write" | "edit" => summary.files_written.push(path),
                    _ => {}
                }
            }
            EventKind::ToolCallEnd {
                tool,
                is_error: true,
                output,
                ..
            } => {
                if is_real_error(output) {
                    summary.errors.push(ToolError {
                        tool: tool.clone(),
                        text: output.chars().take(MAX_ERROR_TEXT).collect(),
                        turn: summary.turns,
                    });
                }
            }
            _ => {}
        }
    }

    for (summary, names) in summaries.iter_mut().zip(tools) {
        summary.tools_used = most_common(names);
        if let Some(record) = records.iter().find(|r| r.iteration == summary.iteration) {
            summary.outcome = Some(format!("{:?}", record.outcome).to_lowercase());
        }
    }
    summaries.sort_by_key(|s| s.iteration);
    summaries
}

fn exit_code_one() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*\s+)?Command exited with code 1$").expect("valid regex"))
}

/// Whether a failed tool call's output is worth counting
pub fn is_real_error(text: &str) -> bool {
    let stripped = text.trim();
    if stripped.is_empty() {
        return false;
    }
    // grep and rg exit 1 when nothing matches
    if exit_code_one().is_match(stripped) {
        return false;
    }
    if stripped == "Command exited with code 2" {
        return false;
    }
    !(text.contains("Building Python inspector") && text.contains("Successfully built"))
}

/// Bucket an error by what kind of problem it is
pub fn classify_error(error: &ToolError) -> String {
    static CODE: OnceLock<Regex> = OnceLock::new();
    let text = error.text.to_lowercase();

    if text.contains("enoent") || text.contains("no such file") {
        return "file-not-found".to_string();
    }
    if text.contains("error[e") {
        let code = CODE.get_or_init(|| Regex::new(r"error\[(e\d+)\]").expect("valid regex"));
        return match code.captures(&text) {
            Some(caps) => format!("compile-{}", caps[1].to_uppercase()),
            None => "compile-error".to_string(),
        };
    }
    if text.contains("warning:") && (text.contains("clippy") || text.contains("#[warn")) {
        return "clippy-warning".to_string();
    }
    if text.starts_with("error:") {
        return "clippy-warning".to_string();
    }
    if text.contains("cannot find") || text.contains("not found") {
        return "not-found".to_string();
    }
    if text.contains("mismatched types") || text.contains("type mismatch") {
        return "type-error".to_string();
    }
    if text.contains("unresolved") {
        return "unresolved-import".to_string();
    }
    "other".to_string()
}

/// The one line of an error that says what went wrong
pub fn error_essence(text: &str) -> String {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(error\[E\d+\]:[^\n]*)").expect("valid regex"),
            Regex::new(r"(error:[^\n]*)").expect("valid regex"),
            Regex::new(r"(warning:[^\n]*)").expect("valid regex"),
        ]
    });

    for pattern in patterns.iter() {
        if let Some(caps) = pattern.captures(text) {
            return caps[1].trim().to_string();
        }
    }
    text.chars()
        .take(200)
        .collect::<String>()
        .replace('\n', " ")
        .trim()
        .to_string()
}

/// Count occurrences, most common first; ties keep first-seen order
pub fn most_common<I>(items: I) -> Vec<(String, usize)>
where
    I: IntoIterator<Item = String>,
{
    let mut counts: Vec<(String, usize)> = Vec::new();
    for item in items {
        match counts.iter_mut().find(|(name, _)| *name == item) {
            Some((_, count)) => *count += 1,
            None => counts.push((item, 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
}

/// Keep the last three path components
pub fn short_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    let start = parts.len().saturating_sub(3);
    parts[start..].join("/")
}
