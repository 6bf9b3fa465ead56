use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LoopError, Result};

/// Reasoning effort requested from the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Minimal => "minimal",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
            ThinkingLevel::Xhigh => "xhigh",
        }
    }
}

impl fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThinkingLevel {
    type Err = LoopError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(ThinkingLevel::Off),
            "minimal" => Ok(ThinkingLevel::Minimal),
            "low" => Ok(ThinkingLevel::Low),
            "medium" => Ok(ThinkingLevel::Medium),
            "high" => Ok(ThinkingLevel::High),
            "xhigh" => Ok(ThinkingLevel::Xhigh),
            other => Err(LoopError::Configuration(format!(
                "unknown thinking level '{}'",
                other
            ))),
        }
    }
}

/// Per-iteration context budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextLimitConfig {
    /// Reported tokens at which the turn is aborted and a fresh iteration starts
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    /// Reported tokens at which a warning is logged
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u64,
}

fn default_max_tokens() -> u64 {
    180_000
}

fn default_warning_threshold() -> u64 {
    150_000
}

impl Default for ContextLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            warning_threshold: default_warning_threshold(),
        }
    }
}

/// Configuration captured when a loop starts and frozen into `config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Model selector passed to the agent
    #[serde(default)]
    pub model: Option<String>,
    /// Provider selector passed to the agent
    #[serde(default)]
    pub provider: Option<String>,
    /// Thinking level passed to the agent
    #[serde(default)]
    pub thinking: Option<ThinkingLevel>,
    /// Maximum number of iterations (None = until completion or stop)
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Insert a reflection instruction every N iterations (0 = never)
    #[serde(default)]
    pub reflect_every: u32,
    /// Text inside `<promise>...</promise>` that marks the task complete
    #[serde(default = "default_completion_promise")]
    pub completion_promise: String,
    /// Treat a task document with every checklist item ticked as complete
    #[serde(default = "default_true")]
    pub complete_on_checklist: bool,
    /// Context budget for a single iteration
    #[serde(default)]
    pub context_limit: ContextLimitConfig,
    /// Directory (relative to the working directory) holding loop state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Global registry directory override
    #[serde(default)]
    pub registry_dir: Option<PathBuf>,
    /// Seconds between registry heartbeats
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Path to the agent executable for the out-of-process bridge
    #[serde(default = "default_agent_path")]
    pub agent_path: String,
    /// Base arguments for the agent executable
    #[serde(default = "default_agent_args")]
    pub agent_args: Vec<String>,
    /// Seconds to wait for the agent to acknowledge a command
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
}

fn default_completion_promise() -> String {
    "TASK COMPLETE".to_string()
}

fn default_true() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".agent-loop")
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_agent_path() -> String {
    "pi".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec![
        "--mode".to_string(),
        "rpc".to_string(),
        "--no-session".to_string(),
    ]
}

fn default_response_timeout_secs() -> u64 {
    30
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider: None,
            thinking: None,
            max_iterations: None,
            reflect_every: 0,
            completion_promise: default_completion_promise(),
            complete_on_checklist: true,
            context_limit: ContextLimitConfig::default(),
            state_dir: default_state_dir(),
            registry_dir: None,
            heartbeat_secs: default_heartbeat_secs(),
            agent_path: default_agent_path(),
            agent_args: default_agent_args(),
            response_timeout_secs: default_response_timeout_secs(),
        }
    }
}

/// Values supplied on the command line; each one wins over the config file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub thinking: Option<ThinkingLevel>,
    pub max_iterations: Option<u32>,
    pub reflect_every: Option<u32>,
    pub completion_promise: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub agent_path: Option<String>,
}

impl LoopConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LoopError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| LoopError::Configuration(e.to_string()))
    }

    /// Merge CLI arguments into this configuration
    pub fn merge_overrides(&mut self, overrides: ConfigOverrides) {
        if overrides.model.is_some() {
            self.model = overrides.model;
        }
        if overrides.provider.is_some() {
            self.provider = overrides.provider;
        }
        if overrides.thinking.is_some() {
            self.thinking = overrides.thinking;
        }
        if overrides.max_iterations.is_some() {
            self.max_iterations = overrides.max_iterations;
        }
        if let Some(n) = overrides.reflect_every {
            self.reflect_every = n;
        }
        if let Some(cp) = overrides.completion_promise {
            self.completion_promise = cp;
        }
        if let Some(dir) = overrides.state_dir {
            self.state_dir = dir;
        }
        if let Some(path) = overrides.agent_path {
            self.agent_path = path;
        }
    }

    /// Reject configurations that cannot produce a running loop
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == Some(0) {
            return Err(LoopError::Configuration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.completion_promise.trim().is_empty() {
            return Err(LoopError::Configuration(
                "completion_promise must not be empty".to_string(),
            ));
        }
        if self.agent_path.trim().is_empty() {
            return Err(LoopError::Configuration(
                "agent_path must not be empty".to_string(),
            ));
        }
        if self.heartbeat_secs == 0 {
            return Err(LoopError::Configuration(
                "heartbeat_secs must be at least 1".to_string(),
            ));
        }
        if self.response_timeout_secs == 0 {
            return Err(LoopError::Configuration(
                "response_timeout_secs must be at least 1".to_string(),
            ));
        }
        let limits = &self.context_limit;
        if limits.max_tokens == 0 || limits.warning_threshold > limits.max_tokens {
            return Err(LoopError::Configuration(format!(
                "context limit warning threshold ({}) must not exceed max tokens ({})",
                limits.warning_threshold, limits.max_tokens
            )));
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(LoopError::Configuration(
                "state_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Full argument list for the agent executable, selectors appended
    pub fn agent_command_args(&self) -> Vec<String> {
        let mut args = self.agent_args.clone();
        if let Some(ref provider) = self.provider {
            args.push("--provider".to_string());
            args.push(provider.clone());
        }
        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(thinking) = self.thinking {
            args.push("--thinking".to_string());
            args.push(thinking.to_string());
        }
        args
    }
}

/// Loop names are used as directory and file name components
pub fn validate_loop_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(LoopError::Configuration(format!(
            "invalid loop name '{}': use letters, digits, '-', '_' or '.'",
            name
        )))
    }
}
