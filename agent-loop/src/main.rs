use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use agent_loop::{
    ConfigOverrides, LoopConfig, LoopController, LoopEngine, LoopHandle, LoopSnapshot, LoopState,
    RpcBridge, ThinkingLevel,
};

mod display;

/// Agent Loop: run an LLM agent on a task in fresh-context iterations
#[derive(Parser, Debug)]
#[command(name = "agent-loop")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (TOML format)
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// State directory, relative to the working directory (default: .agent-loop)
    #[arg(long = "state-dir", global = true)]
    state_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a loop and run it in the foreground
    Start(StartArgs),
    /// Ask a loop to stop after its current iteration
    Stop { name: String },
    /// Abort a loop's in-flight turn and stop it now
    Kill { name: String },
    /// Show a loop's state and telemetry
    Status {
        name: String,
        /// Print the raw state as JSON
        #[arg(long)]
        json: bool,
    },
    /// List loops in this directory
    List {
        /// List every registered loop on this machine
        #[arg(long)]
        all: bool,
    },
    /// Delete a finished loop's files
    Cleanup { name: String },
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Loop name, used as the directory name
    name: String,

    /// Task text (alternative to task file)
    #[arg(short = 'p', long = "prompt", conflicts_with = "prompt_file")]
    prompt: Option<String>,

    /// Task file path
    #[arg(short = 'f', long = "prompt-file")]
    prompt_file: Option<PathBuf>,

    /// Maximum number of iterations (omit for no limit)
    #[arg(short = 'm', long = "max-iterations")]
    max_iterations: Option<u32>,

    /// Insert a reflection checkpoint every N iterations (0 disables)
    #[arg(long = "reflect-every")]
    reflect_every: Option<u32>,

    /// Model selector passed to the agent
    #[arg(long)]
    model: Option<String>,

    /// Provider selector passed to the agent
    #[arg(long)]
    provider: Option<String>,

    /// Thinking level: off, minimal, low, medium, high, xhigh
    #[arg(long)]
    thinking: Option<ThinkingLevel>,

    /// Promise text to detect completion (default: "TASK COMPLETE")
    #[arg(short = 'c', long = "completion-promise")]
    completion_promise: Option<String>,

    /// Agent executable (default: pi)
    #[arg(long = "agent")]
    agent: Option<String>,
}

/// What an operator typed while the loop runs
#[derive(Debug, PartialEq, Eq)]
enum OperatorInput {
    Stop,
    Kill,
    Steer(String),
    FollowUp(String),
    Submit(String),
    Empty,
}

impl OperatorInput {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return OperatorInput::Empty;
        }
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        match command {
            "/stop" => OperatorInput::Stop,
            "/kill" => OperatorInput::Kill,
            "/steer" if !rest.is_empty() => OperatorInput::Steer(rest.to_string()),
            "/follow" if !rest.is_empty() => OperatorInput::FollowUp(rest.to_string()),
            "/steer" | "/follow" => OperatorInput::Empty,
            _ => OperatorInput::Submit(line.to_string()),
        }
    }
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("agent_loop=debug,info")
    } else {
        EnvFilter::new("agent_loop=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli, start: Option<&StartArgs>) -> anyhow::Result<LoopConfig> {
    let mut config = match cli.config {
        Some(ref path) => LoopConfig::from_file(path)?,
        None => LoopConfig::default(),
    };

    let mut overrides = ConfigOverrides {
        state_dir: cli.state_dir.clone(),
        ..ConfigOverrides::default()
    };
    if let Some(args) = start {
        overrides.model = args.model.clone();
        overrides.provider = args.provider.clone();
        overrides.thinking = args.thinking;
        overrides.max_iterations = args.max_iterations;
        overrides.reflect_every = args.reflect_every;
        overrides.completion_promise = args.completion_promise.clone();
        overrides.agent_path = args.agent.clone();
    }
    config.merge_overrides(overrides);
    config.validate()?;
    Ok(config)
}

fn read_task(args: &StartArgs) -> anyhow::Result<Option<String>> {
    match (&args.prompt_file, &args.prompt) {
        (Some(path), _) => {
            let task = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read task file {}", path.display()))?;
            Ok(Some(task))
        }
        (None, Some(prompt)) => Ok(Some(prompt.clone())),
        (None, None) => Ok(None),
    }
}

fn working_dir() -> anyhow::Result<PathBuf> {
    let cwd = std::env::current_dir().context("cannot determine the working directory")?;
    Ok(cwd.canonicalize().unwrap_or(cwd))
}

/// Forward operator lines from stdin until it closes
fn spawn_operator_input(handle: LoopHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("stopped reading operator input: {}", e);
                    break;
                }
            };
            match OperatorInput::parse(&line) {
                OperatorInput::Stop => handle.stop().await,
                OperatorInput::Kill => handle.kill(),
                OperatorInput::Steer(text) => display::render_routed(&handle.steer(text)),
                OperatorInput::FollowUp(text) => {
                    display::render_routed(&handle.follow_up(text))
                }
                OperatorInput::Submit(text) => display::render_routed(&handle.submit(text)),
                OperatorInput::Empty => {}
            }
        }
    })
}

/// First Ctrl+C stops at the iteration boundary, the second kills; SIGTERM kills
fn spawn_signal_handlers(handle: LoopHandle) -> Vec<tokio::task::JoinHandle<()>> {
    let mut tasks = Vec::new();

    let interrupt = handle.clone();
    tasks.push(tokio::spawn(async move {
        let mut count = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            count += 1;
            if count == 1 {
                info!("Received Ctrl+C, stopping after the current iteration (Ctrl+C again to kill)");
                interrupt.stop().await;
            } else {
                warn!("Received second Ctrl+C, killing the loop");
                interrupt.kill();
            }
        }
    }));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => tasks.push(tokio::spawn(async move {
                if terminate.recv().await.is_some() {
                    warn!("Received SIGTERM, killing the loop");
                    handle.kill();
                }
            })),
            Err(e) => warn!("SIGTERM handler not installed: {}", e),
        }
    }

    tasks
}

async fn start_loop(cli: &Cli, args: &StartArgs) -> anyhow::Result<i32> {
    let config = load_config(cli, Some(args))?;
    let task = read_task(args)?;
    let working_dir = working_dir()?;

    info!(
        "Starting loop '{}' with completion promise: {}",
        args.name,
        config.completion_promise.cyan()
    );
    match config.max_iterations {
        Some(max) => info!("Max iterations: {}", max),
        None => info!("No iteration limit (until promise found or stopped)"),
    }
    info!("Context limit: {} tokens", config.context_limit.max_tokens);

    let mut controller = LoopController::new(&args.name, &working_dir, task, config, RpcBridge)?;
    controller
        .start()
        .await
        .with_context(|| format!("loop '{}' could not start", args.name))?;
    println!(
        "Task document: {}",
        controller.store().task_path().display().to_string().cyan()
    );
    println!(
        "{}",
        "Type to steer the agent; /steer, /follow, /stop and /kill are also accepted.".dimmed()
    );

    let handle = controller.handle();
    let mut events = handle.subscribe();
    let input = spawn_operator_input(handle.clone());
    let signals = spawn_signal_handlers(handle.clone());

    let mut run = tokio::spawn(controller.run());
    let mut events_open = true;
    let joined = loop {
        tokio::select! {
            joined = &mut run => break joined,
            received = events.recv(), if events_open => match received {
                Ok(event) => display::render_event(&event, cli.verbose),
                Err(RecvError::Lagged(skipped)) => warn!("display fell behind; {} events skipped", skipped),
                Err(RecvError::Closed) => events_open = false,
            },
        }
    };
    while let Ok(event) = events.try_recv() {
        display::render_event(&event, cli.verbose);
    }
    input.abort();
    for task in signals {
        task.abort();
    }

    let snapshot = joined.context("loop task panicked")??;
    Ok(report(&snapshot))
}

/// Print the final outcome and choose the exit code
fn report(snapshot: &LoopSnapshot) -> i32 {
    let reason = snapshot.exit_reason.map(|r| r.as_str()).unwrap_or("unknown");
    match snapshot.state {
        LoopState::Completed => {
            println!(
                "\n{} Loop '{}' completed after {} iteration(s): {}",
                "SUCCESS:".green().bold(),
                snapshot.name.cyan(),
                snapshot.iteration,
                reason
            );
            0
        }
        LoopState::Stopped => {
            println!(
                "\n{} Loop '{}' stopped after {} iteration(s): {}",
                "INTERRUPTED:".yellow().bold(),
                snapshot.name.cyan(),
                snapshot.iteration,
                reason
            );
            130
        }
        _ => {
            println!(
                "\n{} Loop '{}' ended after {} iteration(s): {}",
                "FAILED:".red().bold(),
                snapshot.name.cyan(),
                snapshot.iteration,
                snapshot.error.as_deref().unwrap_or(reason)
            );
            1
        }
    }
}

fn engine(cli: &Cli) -> anyhow::Result<LoopEngine<RpcBridge>> {
    let config = load_config(cli, None)?;
    Ok(LoopEngine::new(working_dir()?, config, RpcBridge))
}

async fn run(cli: &Cli) -> anyhow::Result<i32> {
    match &cli.command {
        Command::Start(args) => start_loop(cli, args).await,
        Command::Stop { name } => {
            engine(cli)?.stop(name).await?;
            println!("Stop requested for '{}'", name.cyan());
            Ok(0)
        }
        Command::Kill { name } => {
            engine(cli)?.kill(name).await?;
            println!("Kill sent to '{}'", name.cyan());
            Ok(0)
        }
        Command::Status { name, json } => {
            let snapshot = engine(cli)?.status(name).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                display::print_snapshot(&snapshot);
            }
            Ok(0)
        }
        Command::List { all } => {
            let engine = engine(cli)?;
            if *all {
                display::print_descriptors(&engine.list_all()?);
            } else {
                display::print_snapshots(&engine.list().await?);
            }
            Ok(0)
        }
        Command::Cleanup { name } => {
            let engine = engine(cli)?;
            let dir = engine
                .working_dir()
                .join(&engine.config().state_dir)
                .join(name);
            if !dir.is_dir() {
                bail!("no loop named '{}' in {}", name, engine.working_dir().display());
            }
            engine.cleanup(name).await?;
            println!("Removed {}", dir.display());
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(&cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", "ERROR:".red().bold(), e);
            std::process::exit(1);
        }
    }
}
