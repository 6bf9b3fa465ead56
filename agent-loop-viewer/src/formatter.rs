//! Formatted replay of a loop's event log.

use std::io::Write;

use colored::Colorize;

use agent_loop::event_log::{read_events, LoggedEvent};
use agent_loop::events::EventKind;

use crate::error::Result;
use crate::loops::{format_tokens, LoopRun};

/// Prints logged events, inserting a header whenever the iteration changes
#[derive(Debug, Default)]
pub struct EventPrinter {
    current_iteration: Option<u32>,
}

impl EventPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display a single logged event
    pub fn display(&mut self, logged: &LoggedEvent) {
        if self.current_iteration != Some(logged.iteration) {
            self.current_iteration = Some(logged.iteration);
            print_iteration_header(logged.iteration);
        }
        display_event(&logged.event.kind);
    }
}

/// Print every event recorded for a loop, optionally one iteration only
pub fn display_events(run: &LoopRun, iteration: Option<u32>) -> Result<()> {
    let path = run.events_path();
    if !path.exists() {
        eprintln!("No events recorded for loop {}", run.name());
        return Ok(());
    }
    eprintln!("{} {}", "Events from:".dimmed(), path.display());

    let mut printer = EventPrinter::new();
    for logged in read_events(&path)? {
        if iteration.map_or(true, |i| i == logged.iteration) {
            printer.display(&logged);
        }
    }
    println!();
    Ok(())
}

/// Display a single event with formatting
pub fn display_event(kind: &EventKind) {
    match kind {
        EventKind::MessageDelta { text } => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        EventKind::ToolCallStart { tool, args, .. } => {
            println!("\n{} {}", "Tool:".yellow().bold(), tool.cyan());
            if let Some(obj) = args.as_object() {
                for (key, value) in obj {
                    let display_value = format_input_value(value);
                    if !display_value.is_empty() {
                        println!("  {}: {}", key.dimmed(), display_value);
                    }
                }
            }
        }
        EventKind::ToolCallEnd {
            is_error, output, ..
        } => {
            let preview = summarize_content(output, 200);
            if *is_error {
                println!("{} {}", "✗".red(), preview.red());
            } else if !preview.is_empty() {
                println!("{} {}", "→".green(), preview.dimmed());
            }
        }
        EventKind::Usage { usage, .. } => {
            println!(
                "\n{} {} tokens (input: {}, output: {}) ${:.4}",
                "Σ".magenta(),
                format_tokens(usage.total()).bold(),
                usage.input,
                usage.output,
                usage.cost
            );
        }
        EventKind::AgentEnd { aborted: true } => {
            println!("\n{}", "⏹ aborted".yellow());
        }
        EventKind::Retry { attempt, message } => {
            println!("\n{} retry {}: {}", "⚠".yellow(), attempt, message);
        }
        EventKind::Compaction { reason } => {
            println!("\n{} context compacted ({})", "⚠".yellow(), reason);
        }
        EventKind::Steered { message } => {
            println!("\n{} {}", "⇢ steer:".blue().bold(), message);
        }
        EventKind::Error { message } => {
            println!("\n{} {}", "ERROR:".red().bold(), message);
        }
        _ => {}
    }
}

fn print_iteration_header(iteration: u32) {
    let header = format!("━━━ Iteration {} ", iteration);
    let padding = "━".repeat(60_usize.saturating_sub(header.chars().count()));
    println!("\n{}{}", header.bold(), padding);
}

/// Format an input value for display
fn format_input_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => summarize_content(s, 100),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Array(arr) => format!("[{} items]", arr.len()),
        serde_json::Value::Object(obj) => format!("{{{} keys}}", obj.len()),
    }
}

/// Summarize long content for display
fn summarize_content(content: &str, max_len: usize) -> String {
    let content = content.trim();
    let len = content.chars().count();
    if len <= max_len {
        content.to_string()
    } else {
        let kept: String = content.chars().take(max_len).collect();
        format!("{}... ({} chars)", kept, len)
    }
}
