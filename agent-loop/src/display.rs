//! Terminal rendering for the foreground loop and the status commands.

use std::io::Write;

use colored::Colorize;
use serde_json::Value;

use agent_loop::events::EventKind;
use agent_loop::registry::LoopDescriptor;
use agent_loop::{LoopEvent, LoopSnapshot, LoopState, PendingMessage, TokenUsage};

/// Render one loop event as it arrives
pub fn render_event(event: &LoopEvent, verbose: bool) {
    match event {
        LoopEvent::StateChanged {
            state,
            exit_reason,
            error,
        } => {
            let label = format!("[{}]", state);
            let label = match state {
                LoopState::Error => label.red().bold(),
                LoopState::Completed => label.green().bold(),
                LoopState::Stopped => label.yellow().bold(),
                _ => label.dimmed(),
            };
            match (exit_reason, error) {
                (Some(reason), Some(error)) => {
                    println!("\n{} {}: {}", label, reason.as_str(), error)
                }
                (Some(reason), None) => println!("\n{} {}", label, reason.as_str()),
                _ => println!("{}", label),
            }
        }
        LoopEvent::IterationStarted {
            iteration,
            reflection,
            follow_ups,
        } => {
            let header = format!("━━━ Iteration {} ", iteration);
            let padding = "━".repeat(60_usize.saturating_sub(header.chars().count()));
            println!("\n{}{}", header.bold(), padding);
            if *reflection {
                println!("{}", "Reflection checkpoint".magenta());
            }
            if *follow_ups > 0 {
                println!("{} {}", "Follow-ups delivered:".dimmed(), follow_ups);
            }
        }
        LoopEvent::Session { event, .. } => render_session(&event.kind, verbose),
        LoopEvent::IterationFinished(record) => {
            println!();
            println!(
                "{} {} in {} ({} turns, {} tool calls, {} tool errors)",
                "⏹".magenta(),
                format!("{:?}", record.outcome).to_lowercase().bold(),
                format_duration(record.duration_ms),
                record.turns,
                record.tool_calls,
                record.tool_errors
            );
            println!("  {}", format_usage(&record.usage).dimmed());
            if let Some(note) = &record.note {
                println!("  Note: {}", note);
            }
        }
    }
}

fn render_session(kind: &EventKind, verbose: bool) {
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
            tool,
            is_error,
            output,
            ..
        } => {
            if *is_error {
                println!("{} {} {}", "✗".red(), tool, truncate(output, 200).red());
            } else if verbose {
                println!("{} {}", "→".green(), truncate(output, 200).dimmed());
            }
        }
        EventKind::Usage {
            usage,
            model,
            provider,
        } if verbose => {
            let source = match (provider, model) {
                (Some(p), Some(m)) => format!("{}/{}", p, m),
                (None, Some(m)) => m.clone(),
                _ => String::new(),
            };
            println!("\n{} {} {}", "Σ".dimmed(), format_usage(usage).dimmed(), source.dimmed());
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

/// Confirm where an operator message went
pub fn render_routed(routed: &PendingMessage) {
    match routed {
        PendingMessage::Steer(_) => eprintln!("{}", "(steering the current turn)".dimmed()),
        PendingMessage::FollowUp(_) => {
            eprintln!("{}", "(queued for the next iteration)".dimmed())
        }
    }
}

/// One loop's status, human readable
pub fn print_snapshot(snapshot: &LoopSnapshot) {
    println!("{} {}", "Loop:".bold(), snapshot.name.cyan());
    println!("  State:      {}", color_state(snapshot.state));
    let iterations = match snapshot.max_iterations {
        Some(max) => format!("{} / {}", snapshot.iteration, max),
        None => snapshot.iteration.to_string(),
    };
    println!("  Iterations: {}", iterations);
    if let Some(reason) = snapshot.exit_reason {
        println!("  Exit:       {}", reason.as_str());
    }
    if let Some(error) = &snapshot.error {
        println!("  Error:      {}", error.red());
    }
    println!("  Owner pid:  {}", snapshot.pid);
    println!("  Directory:  {}", snapshot.loop_directory.display());
    println!(
        "  Updated:    {}",
        snapshot.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let totals = &snapshot.telemetry;
    println!(
        "  Telemetry:  {} turns, {} tool calls ({} errors), {}",
        totals.turns,
        totals.tool_calls,
        totals.tool_errors,
        format_usage(&totals.usage)
    );
    if snapshot.degraded {
        println!("  {}", "Persistence degraded: some writes failed".yellow());
    }
}

/// Loops of one working directory as a table
pub fn print_snapshots(snapshots: &[LoopSnapshot]) {
    if snapshots.is_empty() {
        println!("No loops found.");
        return;
    }
    println!(
        "{:<24} {:<10} {:>10} {:>10}  {}",
        "NAME".bold(),
        "STATE".bold(),
        "ITERATION".bold(),
        "TOKENS".bold(),
        "UPDATED".bold()
    );
    for snapshot in snapshots {
        println!(
            "{:<24} {:<10} {:>10} {:>10}  {}",
            snapshot.name,
            color_state(snapshot.state),
            snapshot.iteration,
            format_tokens(snapshot.telemetry.usage.total()),
            snapshot.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
}

/// Registered loops across working directories
pub fn print_descriptors(descriptors: &[LoopDescriptor]) {
    if descriptors.is_empty() {
        println!("No active loops registered.");
        return;
    }
    for d in descriptors {
        let iterations = match d.max_iterations {
            Some(max) => format!("{}/{}", d.iteration, max),
            None => d.iteration.to_string(),
        };
        println!(
            "{} {} {} pid {} (seen {})",
            d.name.cyan(),
            color_state(d.status),
            iterations,
            d.pid,
            d.last_seen.format("%H:%M:%S")
        );
        println!("  {}", d.working_directory.display().to_string().dimmed());
    }
}

fn color_state(state: LoopState) -> colored::ColoredString {
    let text = state.as_str();
    match state {
        LoopState::Running | LoopState::Starting => text.cyan(),
        LoopState::Completed => text.green(),
        LoopState::Stopped => text.yellow(),
        LoopState::Error => text.red(),
    }
}

fn format_usage(usage: &TokenUsage) -> String {
    format!(
        "{} tokens (input: {}, output: {}, cache read: {}, cache write: {}) ${:.4}",
        format_tokens(usage.total()),
        usage.input,
        usage.output,
        usage.cache_read,
        usage.cache_write,
        usage.cost
    )
}

pub fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}m", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{}k", n / 1_000)
    } else {
        n.to_string()
    }
}

fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}.{}s", secs, (ms % 1000) / 100)
    }
}

fn format_input_value(value: &Value) -> String {
    match value {
        Value::String(s) => truncate(s, 100),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        Value::Array(arr) => format!("[{} items]", arr.len()),
        Value::Object(obj) => format!("{{{} fields}}", obj.len()),
    }
}

fn truncate(s: &str, max: usize) -> String {
    let flat = s.trim().replace('\n', " ");
    if flat.chars().count() > max {
        let cut: String = flat.chars().take(max).collect();
        format!("{}...", cut)
    } else {
        flat
    }
}
