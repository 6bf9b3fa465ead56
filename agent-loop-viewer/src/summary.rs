//! Summary display for agent loops and their iterations.

use std::fmt::Write as _;

use colored::Colorize;

use agent_loop::state::LoopState;

use crate::loops::{format_tokens, LoopRun};
use crate::session_log::{
    classify_error, error_essence, most_common, short_path, IterationSummary, ToolError,
};

/// Unique essences listed per error class in the agent report
const MAX_ESSENCES: usize = 8;
const MAX_REPEATED_READS: usize = 15;
const MAX_MODIFIED_FILES: usize = 10;

/// Display a summary of all loops
pub fn display_loops(loops: &[LoopRun]) {
    if loops.is_empty() {
        println!("No loops found.");
        return;
    }

    let (running, finished): (Vec<_>, Vec<_>) = loops.iter().partition(|l| l.is_active());

    if !running.is_empty() {
        println!("{}", "Currently Running".bold().green());
        println!("{}", "─".repeat(80));
        for run in &running {
            display_loop_row(run);
        }
        println!();
    }

    if !finished.is_empty() {
        println!("{}", "Finished Loops".bold());
        println!("{}", "─".repeat(80));
        for run in &finished {
            display_loop_row(run);
        }
    }

    println!();
    println!("{}", "─".repeat(80));
    let total_tokens: u64 = loops.iter().map(|l| l.total_tokens()).sum();
    println!(
        "{} total loops, {} running, {} tokens used",
        loops.len().to_string().bold(),
        running.len().to_string().bold(),
        format_tokens(total_tokens).bold()
    );
}

/// Display a single loop as a row
fn display_loop_row(run: &LoopRun) {
    let status_indicator = match run.snapshot.state {
        LoopState::Starting | LoopState::Running => "●".green(),
        LoopState::Completed => "✓".blue(),
        LoopState::Error => "✗".red(),
        LoopState::Stopped => "○".yellow(),
    };

    // [indicator] name | duration | iterations | tokens | exit reason
    println!(
        "{} {} {} {} {} {} {} {} {} {}",
        status_indicator,
        truncate(run.name(), 24).dimmed(),
        "|".dimmed(),
        format!("{:>10}", run.duration_display()).cyan(),
        "|".dimmed(),
        format!("{} iter", run.current_iteration()),
        "|".dimmed(),
        format!("{:>8} tok", format_tokens(run.total_tokens())),
        "|".dimmed(),
        format!("{:18}", run.exit_reason_display()).yellow(),
    );

    if let Some(error) = &run.snapshot.error {
        println!("  {} {}", "!".red(), truncate(error, 70).red());
    }
    println!("  {} {}", "→".dimmed(), truncate(&run.task_preview(), 70).dimmed());
}

/// Error classes in first-seen order with their counts
fn class_counts(errors: &[&ToolError]) -> String {
    let counts: Vec<String> = most_common(errors.iter().map(|e| classify_error(e)))
        .into_iter()
        .map(|(class, count)| format!("{}={}", class, count))
        .collect();
    counts.join(", ")
}

/// Print one iteration's summary
pub fn print_iteration(summary: &IterationSummary, verbose: bool) {
    let timestamp = summary
        .timestamp
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("\n{}", "─".repeat(70));
    print!("  {} {}", "Iteration".bold(), summary.iteration.to_string().bold());
    print!("  {}", timestamp.dimmed());
    if !summary.model.is_empty() {
        print!("  {}/{}", summary.provider, summary.model.cyan());
    }
    if let Some(outcome) = &summary.outcome {
        print!("  [{}]", outcome);
    }
    println!();
    println!(
        "  turns={}  tools={}  ↑{} ↓{}  cache: r={} w={}  ${:.3}",
        summary.turns,
        summary.tool_calls,
        format_tokens(summary.input_tokens),
        format_tokens(summary.output_tokens),
        format_tokens(summary.cache_read),
        format_tokens(summary.cache_write),
        summary.cost
    );

    if !summary.errors.is_empty() {
        let errors: Vec<&ToolError> = summary.errors.iter().collect();
        println!(
            "  {}: {}",
            format!("errors={}", errors.len()).red(),
            class_counts(&errors)
        );

        if verbose {
            for error in &summary.errors {
                println!(
                    "    turn {} [{}] ({}): {}",
                    error.turn,
                    error.tool.cyan(),
                    classify_error(error),
                    error_essence(&error.text)
                );
            }
        }
    }

    if verbose && !summary.tools_used.is_empty() {
        let tools: Vec<String> = summary
            .tools_used
            .iter()
            .map(|(name, count)| format!("{}={}", name, count))
            .collect();
        println!("  tools: {}", tools.join(", "));
    }
}

/// Print totals across iterations
pub fn print_aggregate(summaries: &[IterationSummary]) {
    let turns: u32 = summaries.iter().map(|s| s.turns).sum();
    let tools: u32 = summaries.iter().map(|s| s.tool_calls).sum();
    let input: u64 = summaries.iter().map(|s| s.input_tokens).sum();
    let output: u64 = summaries.iter().map(|s| s.output_tokens).sum();
    let cost: f64 = summaries.iter().map(|s| s.cost).sum();
    let errors: Vec<&ToolError> = summaries.iter().flat_map(|s| &s.errors).collect();

    println!("\n{}", "━".repeat(70));
    println!("  {} {} iterations", "TOTAL:".bold(), summaries.len());
    println!(
        "  turns={}  tools={}  ↑{} ↓{}  ${:.3}",
        turns,
        tools,
        format_tokens(input),
        format_tokens(output),
        cost
    );
    println!("  errors={}", errors.len());

    if !errors.is_empty() {
        println!("  error breakdown: {}", class_counts(&errors));

        let repeated: Vec<(String, usize)> = most_common(
            errors
                .iter()
                .map(|e| format!("{}:{}", e.tool, classify_error(e))),
        )
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .collect();
        if !repeated.is_empty() {
            println!("  repeated patterns:");
            for (pattern, count) in repeated {
                println!("    {}: {}x", pattern, count);
            }
        }
    }

    println!("{}", "━".repeat(70));
}

/// Markdown review of the iterations, meant to be fed back to an agent
pub fn agent_report(summaries: &[IterationSummary]) -> String {
    let mut out = String::new();
    let cost: f64 = summaries.iter().map(|s| s.cost).sum();
    let turns: u32 = summaries.iter().map(|s| s.turns).sum();
    let errors: Vec<&ToolError> = summaries.iter().flat_map(|s| &s.errors).collect();

    let _ = writeln!(out, "# Session Review");
    let _ = writeln!(
        out,
        "\n{} iterations, {} turns, ${:.2} total, {} real errors",
        summaries.len(),
        turns,
        cost,
        errors.len()
    );
    let _ = writeln!(
        out,
        "(grep/rg no-match and inspector rebuild warnings are filtered out)"
    );

    if errors.is_empty() {
        let _ = writeln!(out, "\n## No real errors found, all iterations clean");
    } else {
        let _ = writeln!(out, "\n## Errors by Type");
        let mut by_class: Vec<(String, Vec<&ToolError>)> = Vec::new();
        for error in errors.iter().copied() {
            let class = classify_error(error);
            match by_class.iter_mut().find(|(c, _)| *c == class) {
                Some((_, group)) => group.push(error),
                None => by_class.push((class, vec![error])),
            }
        }
        by_class.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        for (class, group) in by_class {
            let _ = writeln!(out, "\n### {} ({}x)", class, group.len());
            let mut essences: Vec<String> = Vec::new();
            for error in group {
                let essence = error_essence(&error.text);
                if !essences.contains(&essence) {
                    essences.push(essence);
                }
            }
            for essence in essences.iter().take(MAX_ESSENCES) {
                let _ = writeln!(out, "  - {}", essence);
            }
            if essences.len() > MAX_ESSENCES {
                let _ = writeln!(
                    out,
                    "  - ...and {} more unique errors",
                    essences.len() - MAX_ESSENCES
                );
            }
        }
    }

    let reads = most_common(summaries.iter().flat_map(|s| s.files_read.iter().cloned()));
    let repeated_reads: Vec<_> = reads.into_iter().filter(|(_, count)| *count > 3).collect();
    if !repeated_reads.is_empty() {
        let _ = writeln!(out, "\n## Files read 4+ times across iterations");
        let _ = writeln!(out, "(Consider documenting these paths in the task file)");
        for (path, count) in repeated_reads.iter().take(MAX_REPEATED_READS) {
            let _ = writeln!(out, "  - {}: {}x", short_path(path), count);
        }
    }

    let writes = most_common(summaries.iter().flat_map(|s| s.files_written.iter().cloned()));
    if !writes.is_empty() {
        let _ = writeln!(out, "\n## Most-modified files");
        for (path, count) in writes.iter().take(MAX_MODIFIED_FILES) {
            let _ = writeln!(out, "  - {}: {} edits", short_path(path), count);
        }
    }

    out
}

/// Truncate a string to a maximum number of characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(tool: &str, text: &str) -> ToolError {
        ToolError {
            tool: tool.to_string(),
            text: text.to_string(),
            turn: 1,
        }
    }

    #[test]
    fn test_truncate_short() {
        assert_eq!(truncate("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_long() {
        assert_eq!(truncate("hello world!", 8), "hello...");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("ééééééééé", 6), "ééé...");
    }

    #[test]
    fn test_agent_report_clean() {
        let summaries = vec![IterationSummary {
            iteration: 1,
            turns: 3,
            cost: 0.5,
            ..Default::default()
        }];
        let report = agent_report(&summaries);
        assert!(report.starts_with("# Session Review"));
        assert!(report.contains("1 iterations, 3 turns, $0.50 total, 0 real errors"));
        assert!(report.contains("No real errors found"));
        assert!(!report.contains("Most-modified"));
    }

    #[test]
    fn test_agent_report_groups_errors() {
        let mut errors: Vec<ToolError> = (0..10)
            .map(|i| error("bash", &format!("error[E0308]: mismatched types #{}", i)))
            .collect();
        errors.push(error("read", "ENOENT: no such file"));
        let summaries = vec![IterationSummary {
            iteration: 1,
            errors,
            files_read: vec!["/a/b/c/d.rs".to_string(); 4],
            files_written: vec!["src/x.rs".to_string(), "src/x.rs".to_string()],
            ..Default::default()
        }];

        let report = agent_report(&summaries);
        assert!(report.contains("### compile-E0308 (10x)"));
        assert!(report.contains("### file-not-found (1x)"));
        assert!(report.find("compile-E0308").unwrap() < report.find("file-not-found").unwrap());
        assert!(report.contains("...and 2 more unique errors"));
        assert!(report.contains("  - b/c/d.rs: 4x"));
        assert!(report.contains("  - src/x.rs: 2 edits"));
    }

    #[test]
    fn test_reads_below_threshold_are_omitted() {
        let summaries = vec![IterationSummary {
            files_read: vec!["src/lib.rs".to_string(); 3],
            ..Default::default()
        }];
        assert!(!agent_report(&summaries).contains("Files read 4+ times"));
    }
}
