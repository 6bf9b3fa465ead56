//! Loop discovery and metadata loading.

use std::path::{Path, PathBuf};

use agent_loop::state::{LoopSnapshot, LoopState};
use agent_loop::store::{list_stores, LoopStore};
use agent_loop::telemetry::IterationRecord;

use crate::error::{Result, ViewerError};

/// One loop's persisted state and iteration records
#[derive(Debug, Clone)]
pub struct LoopRun {
    pub store: LoopStore,
    pub snapshot: LoopSnapshot,
    pub iterations: Vec<IterationRecord>,
}

impl LoopRun {
    /// Load a loop from its directory
    pub fn load(store: LoopStore) -> Result<Self> {
        let snapshot = store.read_state()?;
        let iterations = store.read_iterations()?;
        Ok(Self {
            store,
            snapshot,
            iterations,
        })
    }

    pub fn name(&self) -> &str {
        &self.snapshot.name
    }

    /// Get a display string for the status
    pub fn status_display(&self) -> &'static str {
        match self.snapshot.state {
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::Completed => "done",
            LoopState::Stopped => "stopped",
            LoopState::Error => "error",
        }
    }

    /// Check if the loop is still active
    pub fn is_active(&self) -> bool {
        !self.snapshot.state.is_terminal()
    }

    /// Number of iterations the loop has recorded
    pub fn current_iteration(&self) -> u32 {
        self.snapshot.iteration
    }

    /// Get total tokens across all iterations
    pub fn total_tokens(&self) -> u64 {
        self.snapshot.telemetry.usage.total()
    }

    pub fn events_path(&self) -> PathBuf {
        self.store.events_path()
    }

    pub fn exit_reason_display(&self) -> &'static str {
        self.snapshot
            .exit_reason
            .map(|reason| reason.as_str())
            .unwrap_or("-")
    }

    /// Wall time from creation to the last state update
    pub fn duration_display(&self) -> String {
        let secs = (self.snapshot.updated_at - self.snapshot.created_at)
            .num_seconds()
            .max(0);
        if secs >= 3600 {
            format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
        } else if secs >= 60 {
            format!("{}m{:02}s", secs / 60, secs % 60)
        } else {
            format!("{}s", secs)
        }
    }

    /// First line of the task document
    pub fn task_preview(&self) -> String {
        self.store
            .read_task()
            .ok()
            .and_then(|task| {
                task.lines()
                    .map(|line| line.trim().trim_start_matches('#').trim())
                    .find(|line| !line.is_empty())
                    .map(String::from)
            })
            .unwrap_or_default()
    }
}

/// Discovers the loops under one state directory
pub struct LoopDiscovery {
    state_dir: PathBuf,
}

impl LoopDiscovery {
    /// `state_dir` is the directory that holds one subdirectory per loop
    pub fn new(state_dir: &Path) -> Result<Self> {
        if !state_dir.exists() {
            return Err(ViewerError::NoLoopsAvailable(
                state_dir.display().to_string(),
            ));
        }
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
        })
    }

    /// List all loops, newest first
    pub fn list_loops(&self) -> Result<Vec<LoopRun>> {
        let mut loops = Vec::new();

        for store in list_stores(&self.state_dir)? {
            let dir = store.loop_dir().to_path_buf();
            match LoopRun::load(store) {
                Ok(run) => loops.push(run),
                Err(e) => {
                    eprintln!(
                        "Warning: skipping unreadable loop directory {}: {}",
                        dir.display(),
                        e
                    );
                }
            }
        }

        loops.sort_by(|a, b| b.snapshot.created_at.cmp(&a.snapshot.created_at));
        Ok(loops)
    }

    /// Get a specific loop by name
    pub fn get_loop(&self, name: &str) -> Result<LoopRun> {
        let store = LoopStore::new(self.state_dir.join(name));
        if !store.exists() {
            return Err(ViewerError::LoopNotFound(name.to_string()));
        }
        LoopRun::load(store)
    }
}

/// Format a token count for display (1.2m, 34k, 999)
pub fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}m", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{}k", n / 1_000)
    } else {
        n.to_string()
    }
}
