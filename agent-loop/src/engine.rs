//! Command surface over many loops.
//!
//! Loops started through this engine run as owned tasks in this process.
//! Loops on disk that belong to another process are reached through their
//! files: a stop becomes a marker file, a kill becomes a signal to the owner.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex as StdMutex, PoisonError};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::AgentBridge;
use crate::config::{validate_loop_name, LoopConfig};
use crate::error::{LoopError, Result};
use crate::loop_controller::{LoopController, LoopHandle};
use crate::registry::{process_alive, terminate_process, LoopDescriptor, Registry};
use crate::state::{ExitReason, LoopSnapshot, LoopState};
use crate::store::{list_stores, LoopStore};

/// Message recorded when a loop's owner disappeared without finishing it
pub const OWNER_LOST_MESSAGE: &str = "owner process no longer alive";

struct RunningLoop {
    handle: LoopHandle,
    task: JoinHandle<Result<LoopSnapshot>>,
}

impl RunningLoop {
    fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Holds a loop name while its controller starts outside the engine lock
struct StartReservation<'a> {
    starting: &'a StdMutex<HashSet<String>>,
    name: String,
}

impl Drop for StartReservation<'_> {
    fn drop(&mut self) {
        self.starting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

/// Starts and supervises loops in one working directory
pub struct LoopEngine<B> {
    working_dir: PathBuf,
    config: LoopConfig,
    bridge: B,
    loops: Mutex<HashMap<String, RunningLoop>>,
    starting: StdMutex<HashSet<String>>,
}

impl<B> LoopEngine<B>
where
    B: AgentBridge + Clone + 'static,
{
    /// `config` provides the defaults for new loops and locates existing ones
    pub fn new(working_dir: impl Into<PathBuf>, config: LoopConfig, bridge: B) -> Self {
        Self {
            working_dir: working_dir.into(),
            config,
            bridge,
            loops: Mutex::new(HashMap::new()),
            starting: StdMutex::new(HashSet::new()),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    fn store(&self, name: &str) -> LoopStore {
        LoopStore::for_loop(&self.working_dir, &self.config.state_dir, name)
    }

    /// Start a loop with the engine's configuration
    pub async fn start(&self, name: &str, task: Option<String>) -> Result<LoopHandle> {
        self.start_with(name, task, self.config.clone()).await
    }

    /// Start a loop and run it in the background.
    ///
    /// Opening the agent session can take as long as the handshake timeout,
    /// so the loop map is only locked to reserve the name and to insert the
    /// started loop. A reserved name refuses a second start until the first
    /// one has been inserted or has failed.
    pub async fn start_with(
        &self,
        name: &str,
        task: Option<String>,
        config: LoopConfig,
    ) -> Result<LoopHandle> {
        let _reservation = {
            let loops = self.loops.lock().await;
            if loops.get(name).is_some_and(RunningLoop::is_active) {
                return Err(LoopError::LoopActive(name.to_string()));
            }
            self.reserve(name)?
        };

        let mut controller =
            LoopController::new(name, &self.working_dir, task, config, self.bridge.clone())?;
        controller.start().await?;

        let handle = controller.handle();
        let task = tokio::spawn(controller.run());
        self.loops.lock().await.insert(
            name.to_string(),
            RunningLoop {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    fn reserve(&self, name: &str) -> Result<StartReservation<'_>> {
        let mut starting = self.starting.lock().unwrap_or_else(PoisonError::into_inner);
        if !starting.insert(name.to_string()) {
            return Err(LoopError::LoopActive(name.to_string()));
        }
        Ok(StartReservation {
            starting: &self.starting,
            name: name.to_string(),
        })
    }

    /// Handle for a loop running in this process
    pub async fn handle(&self, name: &str) -> Option<LoopHandle> {
        self.loops
            .lock()
            .await
            .get(name)
            .map(|running| running.handle.clone())
    }

    /// Ask a loop to stop at its next iteration boundary
    pub async fn stop(&self, name: &str) -> Result<()> {
        if let Some(handle) = self.handle(name).await {
            handle.stop().await;
            return Ok(());
        }

        let snapshot = self.status(name).await?;
        if snapshot.state.is_terminal() {
            info!(name, state = %snapshot.state, "loop already finished");
            return Ok(());
        }
        self.store(name).request_stop()?;
        info!(name, pid = snapshot.pid, "stop request left for the owning process");
        Ok(())
    }

    /// Abort the in-flight turn and stop the loop now
    pub async fn kill(&self, name: &str) -> Result<()> {
        if let Some(handle) = self.handle(name).await {
            handle.kill();
            return Ok(());
        }

        let snapshot = self.status(name).await?;
        if snapshot.state.is_terminal() {
            info!(name, state = %snapshot.state, "loop already finished");
            return Ok(());
        }
        if snapshot.pid == std::process::id() {
            return Err(LoopError::LoopActive(format!(
                "{} belongs to another engine in this process",
                name
            )));
        }
        terminate_process(snapshot.pid)?;
        info!(name, pid = snapshot.pid, "termination signal sent to the owning process");
        Ok(())
    }

    /// Current snapshot; a running loop whose owner is gone is marked as errored
    pub async fn status(&self, name: &str) -> Result<LoopSnapshot> {
        validate_loop_name(name)?;
        if let Some(handle) = self.handle(name).await {
            return Ok(handle.snapshot().await);
        }

        let store = self.store(name);
        let mut snapshot = store.read_state()?;
        if snapshot.state.is_terminal() || self.owner_alive(&snapshot) {
            return Ok(snapshot);
        }

        warn!(
            name,
            pid = snapshot.pid,
            "{}",
            LoopError::StaleLoop(format!("{}: {}", name, OWNER_LOST_MESSAGE))
        );
        snapshot.finish(
            LoopState::Error,
            ExitReason::OwnerLost,
            Some(OWNER_LOST_MESSAGE.to_string()),
        )?;
        store.write_state(&snapshot)?;
        if let Ok(registry) = Registry::from_config(&self.config) {
            if let Err(e) = registry.deregister(&snapshot.working_directory, name) {
                warn!("failed to drop stale registry entry: {}", e);
            }
        }
        Ok(snapshot)
    }

    /// Without a way to check the pid, only a fresh registry heartbeat counts
    fn owner_alive(&self, snapshot: &LoopSnapshot) -> bool {
        match process_alive(snapshot.pid) {
            Some(alive) => alive,
            None => Registry::from_config(&self.config)
                .map(|r| r.heartbeat_fresh(&snapshot.working_directory, &snapshot.name, Utc::now()))
                .unwrap_or(false),
        }
    }

    /// Every loop in this working directory
    pub async fn list(&self) -> Result<Vec<LoopSnapshot>> {
        let base = self.working_dir.join(&self.config.state_dir);
        let mut snapshots = Vec::new();
        for store in list_stores(&base)? {
            match self.status(&store.name()).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(loop_dir = %store.loop_dir().display(), "skipping loop: {}", e),
            }
        }
        Ok(snapshots)
    }

    /// Every registered loop on this machine
    pub fn list_all(&self) -> Result<Vec<LoopDescriptor>> {
        Registry::from_config(&self.config)?.list()
    }

    /// Delete a finished loop's files
    pub async fn cleanup(&self, name: &str) -> Result<()> {
        let snapshot = self.status(name).await?;
        if !snapshot.state.is_terminal() {
            return Err(LoopError::LoopActive(name.to_string()));
        }

        let running = self.loops.lock().await.remove(name);
        if let Some(running) = running {
            if let Err(e) = running.task.await {
                warn!(name, "loop task ended abnormally: {}", e);
            }
        }
        self.store(name).remove()?;
        if let Ok(registry) = Registry::from_config(&self.config) {
            registry.deregister(&snapshot.working_directory, name)?;
        }
        info!(name, "loop cleaned up");
        Ok(())
    }

    /// Wait for a loop started by this engine to reach a terminal state
    pub async fn wait(&self, name: &str) -> Result<LoopSnapshot> {
        let running = self.loops.lock().await.remove(name);
        match running {
            Some(running) => {
                running.task.await.map_err(|e| {
                    LoopError::SessionCrash(format!("loop task for '{}' failed: {}", name, e))
                })?
            }
            None => {
                let snapshot = self.status(name).await?;
                if snapshot.state.is_terminal() {
                    Ok(snapshot)
                } else {
                    Err(LoopError::LoopActive(format!(
                        "{} is owned by process {}",
                        name, snapshot.pid
                    )))
                }
            }
        }
    }
}
