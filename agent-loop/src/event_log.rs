//! Append-only record of every session event, one JSON object per line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LoopError, Result};
use crate::events::SessionEvent;

/// A session event tagged with the iteration it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub iteration: u32,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Writer for `events.log`
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: File,
}

impl EventLog {
    /// Open the log for appending, creating it if needed
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| LoopError::Persistence(format!("open {}: {}", path.display(), e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and flush it
    pub fn append(&mut self, iteration: u32, event: &SessionEvent) -> Result<()> {
        let entry = LoggedEvent {
            iteration,
            event: event.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|e| LoopError::Persistence(format!("append {}: {}", self.path.display(), e)))
    }
}

/// Read every event back, skipping lines that do not parse (e.g. a torn last line)
pub fn read_events(path: &Path) -> Result<Vec<LoggedEvent>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LoggedEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(
                path = %path.display(),
                line = number + 1,
                "skipping unreadable event: {}",
                e
            ),
        }
    }

    Ok(events)
}
