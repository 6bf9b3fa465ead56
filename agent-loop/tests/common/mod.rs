//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use agent_loop::{LoopConfig, LoopEvent};
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Config that keeps the registry inside the test's temp directory
pub fn test_config(temp: &TempDir) -> LoopConfig {
    LoopConfig {
        registry_dir: Some(temp.path().join("registry")),
        ..LoopConfig::default()
    }
}

pub fn loop_dir(temp: &TempDir, name: &str) -> std::path::PathBuf {
    temp.path()
        .canonicalize()
        .unwrap_or_else(|_| temp.path().to_path_buf())
        .join(".agent-loop")
        .join(name)
}

/// Wait for the first loop event matching `pred`
pub async fn wait_for<F>(events: &mut broadcast::Receiver<LoopEvent>, pred: F) -> LoopEvent
where
    F: Fn(&LoopEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("loop event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for loop event")
}

pub fn iteration_started(n: u32) -> impl Fn(&LoopEvent) -> bool {
    move |event| matches!(event, LoopEvent::IterationStarted { iteration, .. } if *iteration == n)
}

pub fn read_file(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|e| panic!("read {}: {}", path.display(), e))
}
