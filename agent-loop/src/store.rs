//! Durable per-loop state.
//!
//! Layout under `<working_dir>/<state_dir>/<name>/`:
//! - `task.md`: the task document (created once, never overwritten)
//! - `config.json`: frozen configuration
//! - `state.json`: latest snapshot, atomically replaced
//! - `events.log`: owned by the event log
//! - `iterations/NNN.json`: one record per completed iteration
//! - `stop-requested`: marker left by another process asking for a stop

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::LoopConfig;
use crate::error::{LoopError, Result};
use crate::state::LoopSnapshot;
use crate::telemetry::IterationRecord;

pub const TASK_FILE: &str = "task.md";
pub const CONFIG_FILE: &str = "config.json";
pub const STATE_FILE: &str = "state.json";
pub const EVENTS_FILE: &str = "events.log";
pub const ITERATIONS_DIR: &str = "iterations";
pub const STOP_REQUEST_FILE: &str = "stop-requested";

/// Reads and writes the files of one loop directory
#[derive(Debug, Clone)]
pub struct LoopStore {
    loop_dir: PathBuf,
}

impl LoopStore {
    pub fn new(loop_dir: impl Into<PathBuf>) -> Self {
        Self {
            loop_dir: loop_dir.into(),
        }
    }

    /// Store for loop `name` in `working_dir`
    pub fn for_loop(working_dir: &Path, state_dir: &Path, name: &str) -> Self {
        Self::new(working_dir.join(state_dir).join(name))
    }

    pub fn loop_dir(&self) -> &Path {
        &self.loop_dir
    }

    /// Directory name, which is the loop name
    pub fn name(&self) -> String {
        self.loop_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn task_path(&self) -> PathBuf {
        self.loop_dir.join(TASK_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.loop_dir.join(STATE_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.loop_dir.join(CONFIG_FILE)
    }

    pub fn events_path(&self) -> PathBuf {
        self.loop_dir.join(EVENTS_FILE)
    }

    pub fn iterations_dir(&self) -> PathBuf {
        self.loop_dir.join(ITERATIONS_DIR)
    }

    pub fn iteration_path(&self, iteration: u32) -> PathBuf {
        self.iterations_dir().join(format!("{:03}.json", iteration))
    }

    /// Whether a loop has been started here before
    pub fn exists(&self) -> bool {
        self.state_path().exists()
    }

    /// Create the directory structure
    pub fn create(&self) -> Result<()> {
        let dir = self.iterations_dir();
        fs::create_dir_all(&dir).map_err(|e| {
            LoopError::Persistence(format!("create directory {}: {}", dir.display(), e))
        })
    }

    /// Write the task document only if it does not exist yet
    pub fn ensure_task(&self, content: &str) -> Result<bool> {
        let path = self.task_path();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(content.as_bytes())
                    .and_then(|_| file.sync_all())
                    .map_err(|e| {
                        LoopError::Persistence(format!("write {}: {}", path.display(), e))
                    })?;
                debug!(path = %path.display(), "task document created");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(LoopError::Persistence(format!(
                "create {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Read the task document as the agent last left it
    pub fn read_task(&self) -> Result<String> {
        Ok(fs::read_to_string(self.task_path())?)
    }

    pub fn write_config(&self, config: &LoopConfig) -> Result<()> {
        write_json_atomic(&self.config_path(), config)
    }

    pub fn read_config(&self) -> Result<LoopConfig> {
        read_json(&self.config_path())
    }

    pub fn write_state(&self, snapshot: &LoopSnapshot) -> Result<()> {
        debug!(
            state = %snapshot.state,
            iteration = snapshot.iteration,
            "writing loop state"
        );
        write_json_atomic(&self.state_path(), snapshot)
    }

    pub fn read_state(&self) -> Result<LoopSnapshot> {
        let path = self.state_path();
        if !path.exists() {
            return Err(LoopError::LoopNotFound(self.name()));
        }
        read_json(&path)
    }

    pub fn write_iteration(&self, record: &IterationRecord) -> Result<()> {
        write_json_atomic(&self.iteration_path(record.iteration), record)
    }

    /// All iteration records, in iteration order
    pub fn read_iterations(&self) -> Result<Vec<IterationRecord>> {
        let dir = self.iterations_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                records.push(read_json::<IterationRecord>(&path)?);
            }
        }
        records.sort_by_key(|r| r.iteration);
        Ok(records)
    }

    /// Ask whichever process owns this loop to stop at the next boundary
    pub fn request_stop(&self) -> Result<()> {
        let path = self.loop_dir.join(STOP_REQUEST_FILE);
        fs::write(&path, b"").map_err(|e| {
            LoopError::Persistence(format!("write {}: {}", path.display(), e))
        })
    }

    /// Consume a pending stop request, if any
    pub fn take_stop_request(&self) -> bool {
        fs::remove_file(self.loop_dir.join(STOP_REQUEST_FILE)).is_ok()
    }

    /// Delete every artifact of the loop
    pub fn remove(&self) -> Result<()> {
        if self.loop_dir.exists() {
            fs::remove_dir_all(&self.loop_dir)?;
        }
        Ok(())
    }
}

/// Stores of every loop under `base` that has a state file
pub fn list_stores(base: &Path) -> Result<Vec<LoopStore>> {
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut stores = Vec::new();
    for entry in fs::read_dir(base)? {
        let path = entry?.path();
        if path.is_dir() {
            let store = LoopStore::new(path);
            if store.exists() {
                stores.push(store);
            }
        }
    }
    stores.sort_by_key(|s| s.name());
    Ok(stores)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| LoopError::JsonParse(format!("{}: {}", path.display(), e)))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write to `<path>.tmp`, then rename over `path`
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        LoopError::Persistence(format!("path has no parent: {}", path.display()))
    })?;
    fs::create_dir_all(parent).map_err(|e| {
        LoopError::Persistence(format!("create directory {}: {}", parent.display(), e))
    })?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let write_tmp = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()
    };
    write_tmp().map_err(|e| {
        LoopError::Persistence(format!("write temp file {}: {}", tmp_path.display(), e))
    })?;
    fs::rename(&tmp_path, path)
        .map_err(|e| LoopError::Persistence(format!("replace {}: {}", path.display(), e)))
}
