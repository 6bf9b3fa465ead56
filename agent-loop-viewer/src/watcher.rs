//! Live tail of a loop's event log.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use agent_loop::event_log::LoggedEvent;

use crate::error::{Result, ViewerError};
use crate::formatter::{display_events, EventPrinter};
use crate::loops::LoopRun;

/// Show what the loop has logged so far, then follow new events until Ctrl+C
pub async fn watch_events(run: &LoopRun) -> Result<()> {
    display_events(run, None)?;

    let path = run.events_path();
    if !path.exists() {
        if !run.is_active() {
            return Ok(());
        }
        // the loop creates the log with its first event
        File::create(&path)?;
    }

    follow(&path)
}

/// Watch a file for changes and display new events
fn follow(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let mut tail = LogTail::new(file.seek(SeekFrom::End(0))?);
    let mut printer = EventPrinter::new();

    let (tx, rx) = std_mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        Config::default().with_poll_interval(Duration::from_millis(100)),
    )
    .map_err(|e| ViewerError::WatcherError(e.to_string()))?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(|e| ViewerError::WatcherError(e.to_string()))?;

    println!("\n{}\n", "--- Watching for new events (Ctrl+C to exit) ---".dimmed());

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    let _ = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    });

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(_event) => {
                for logged in tail.read_new(&mut file)? {
                    printer.display(&logged);
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    println!("\n--- Stopped watching ---");
    Ok(())
}

/// Reads complete lines appended since the last read
#[derive(Debug)]
struct LogTail {
    position: u64,
}

impl LogTail {
    fn new(position: u64) -> Self {
        Self { position }
    }

    /// Parse every complete line past the current position.
    /// A trailing partial line, possibly cut inside a character, is left for
    /// the next call.
    fn read_new(&mut self, file: &mut File) -> Result<Vec<LoggedEvent>> {
        if file.metadata()?.len() < self.position {
            // truncated or replaced
            self.position = 0;
        }
        file.seek(SeekFrom::Start(self.position))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let Some(end) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(Vec::new());
        };
        self.position += end as u64 + 1;

        Ok(String::from_utf8_lossy(&buf[..end])
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
