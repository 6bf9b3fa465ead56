use std::path::PathBuf;

use clap::Parser;

mod error;
mod formatter;
mod loops;
mod picker;
mod session_log;
mod summary;
mod watcher;

use agent_loop::event_log::read_events;
use agent_loop::LoopConfig;

use error::Result;
use loops::{LoopDiscovery, LoopRun};

/// Agent Loop Viewer: review what an agent loop did, iteration by iteration
#[derive(Parser, Debug)]
#[command(name = "agent-loop-viewer")]
#[command(version, about, long_about = None)]
struct Cli {
    /// State directory to scan (default: .agent-loop)
    #[arg(short = 'd', long = "dir")]
    state_dir: Option<PathBuf>,

    /// Loop to review
    #[arg(short = 'n', long = "loop")]
    name: Option<String>,

    /// Only the last N iterations
    #[arg(long = "last", default_value_t = 0)]
    last: usize,

    /// Only iterations with errors
    #[arg(long = "errors")]
    errors: bool,

    /// Only the aggregate statistics
    #[arg(long = "stats")]
    stats: bool,

    /// Show individual errors and tool usage
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Markdown review meant to be fed to a reflecting agent
    #[arg(long = "for-agent")]
    for_agent: bool,

    /// List all loops and exit
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Replay the raw event log instead of summarizing it
    #[arg(short = 'e', long = "events")]
    events: bool,

    /// With --events, only this iteration (1-indexed)
    #[arg(short = 'i', long = "iteration", requires = "events")]
    iteration: Option<u32>,

    /// Follow the event log live
    #[arg(short = 'f', long = "follow")]
    follow: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| LoopConfig::default().state_dir);

    if !state_dir.exists() {
        eprintln!("State directory does not exist: {}", state_dir.display());
        eprintln!("Run agent-loop first to create a loop.");
        std::process::exit(1);
    }

    let discovery = LoopDiscovery::new(&state_dir)?;

    if cli.list {
        summary::display_loops(&discovery.list_loops()?);
        return Ok(());
    }

    let selected = match &cli.name {
        Some(name) => discovery.get_loop(name)?,
        None => {
            let mut loops = discovery.list_loops()?;
            if loops.is_empty() {
                eprintln!("No loops found in {}", state_dir.display());
                eprintln!("Run agent-loop first to create a loop.");
                std::process::exit(1);
            }
            if loops.len() == 1 {
                loops.remove(0)
            } else {
                picker::select_loop(loops)?
            }
        }
    };

    if cli.follow {
        return watcher::watch_events(&selected).await;
    }
    if cli.events {
        return formatter::display_events(&selected, cli.iteration);
    }

    review(&selected, &cli)
}

/// Summarize the loop's iterations the way the flags ask
fn review(run: &LoopRun, cli: &Cli) -> Result<()> {
    let path = run.events_path();
    let events = if path.exists() {
        read_events(&path)?
    } else {
        Vec::new()
    };

    let mut summaries = session_log::summarize(&events, &run.iterations);
    if cli.last > 0 && summaries.len() > cli.last {
        summaries.drain(..summaries.len() - cli.last);
    }
    if cli.errors {
        summaries.retain(|s| !s.errors.is_empty());
    }

    if cli.for_agent {
        print!("{}", summary::agent_report(&summaries));
        return Ok(());
    }

    if summaries.is_empty() {
        eprintln!("No iterations to show for loop {}", run.name());
        return Ok(());
    }

    if cli.stats {
        summary::print_aggregate(&summaries);
    } else {
        for s in &summaries {
            summary::print_iteration(s, cli.verbose);
        }
        if summaries.len() > 1 {
            summary::print_aggregate(&summaries);
        }
    }

    Ok(())
}
