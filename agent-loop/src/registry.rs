//! Global registry of active loops.
//!
//! Each running loop keeps one descriptor file in a shared directory so loops
//! in other working directories can be listed. Descriptors are refreshed on a
//! heartbeat and pruned once their owner is gone.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LoopConfig;
use crate::error::{LoopError, Result};
use crate::state::{LoopSnapshot, LoopState};
use crate::store::write_atomic;

/// Environment variable overriding the registry's home directory
pub const HOME_ENV: &str = "AGENT_LOOP_HOME";

/// Heartbeats a descriptor may miss before it is considered stale
pub const STALE_HEARTBEATS: i64 = 10;

/// What the registry knows about one active loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDescriptor {
    pub pid: u32,
    pub working_directory: PathBuf,
    pub loop_directory: PathBuf,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: LoopState,
    pub iteration: u32,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

impl LoopDescriptor {
    pub fn from_snapshot(snapshot: &LoopSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            pid: snapshot.pid,
            working_directory: snapshot.working_directory.clone(),
            loop_directory: snapshot.loop_directory.clone(),
            name: snapshot.name.clone(),
            started_at: snapshot.created_at,
            last_seen: now,
            status: snapshot.state,
            iteration: snapshot.iteration,
            max_iterations: snapshot.max_iterations,
        }
    }
}

/// Descriptor files in one directory
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
    heartbeat_secs: u64,
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>, heartbeat_secs: u64) -> Self {
        Self {
            dir: dir.into(),
            heartbeat_secs: heartbeat_secs.max(1),
        }
    }

    /// Registry at the configured directory, else the default one
    pub fn from_config(config: &LoopConfig) -> Result<Self> {
        let dir = match &config.registry_dir {
            Some(dir) => dir.clone(),
            None => default_dir().ok_or_else(|| {
                LoopError::Configuration(
                    "cannot locate the registry: no home directory and AGENT_LOOP_HOME unset"
                        .to_string(),
                )
            })?,
        };
        Ok(Self::new(dir, config.heartbeat_secs))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, working_dir: &Path, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}--{}.json", sanitize_path(working_dir), name))
    }

    /// Write or refresh the descriptor for a loop
    pub fn heartbeat(&self, snapshot: &LoopSnapshot) -> Result<()> {
        let descriptor = LoopDescriptor::from_snapshot(snapshot, Utc::now());
        let path = self.entry_path(&snapshot.working_directory, &snapshot.name);
        let mut json = serde_json::to_string_pretty(&descriptor)?;
        json.push('\n');
        write_atomic(&path, &json)?;
        debug!(path = %path.display(), "registry heartbeat");
        Ok(())
    }

    pub fn register(&self, snapshot: &LoopSnapshot) -> Result<()> {
        self.heartbeat(snapshot)?;
        info!(
            name = %snapshot.name,
            registry = %self.dir.display(),
            "loop registered"
        );
        Ok(())
    }

    pub fn deregister(&self, working_dir: &Path, name: &str) -> Result<()> {
        let path = self.entry_path(working_dir, name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LoopError::Persistence(format!(
                "remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// A descriptor is stale when its owner is dead or it missed too many heartbeats
    pub fn is_stale(&self, descriptor: &LoopDescriptor, now: DateTime<Utc>) -> bool {
        self.missed_heartbeats(descriptor, now) || process_alive(descriptor.pid) == Some(false)
    }

    fn missed_heartbeats(&self, descriptor: &LoopDescriptor, now: DateTime<Utc>) -> bool {
        let window = Duration::seconds(self.heartbeat_secs as i64 * STALE_HEARTBEATS);
        now - descriptor.last_seen > window
    }

    /// Whether a loop's descriptor exists and its heartbeat is recent
    pub fn heartbeat_fresh(&self, working_dir: &Path, name: &str, now: DateTime<Utc>) -> bool {
        fs::read_to_string(self.entry_path(working_dir, name))
            .ok()
            .and_then(|s| serde_json::from_str::<LoopDescriptor>(&s).ok())
            .is_some_and(|d| !self.missed_heartbeats(&d, now))
    }

    /// Every live descriptor; stale and unreadable ones are removed
    pub fn list(&self) -> Result<Vec<LoopDescriptor>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut live = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let descriptor = fs::read_to_string(&path)
                .ok()
                .and_then(|s| serde_json::from_str::<LoopDescriptor>(&s).ok());
            let prune = match &descriptor {
                Some(d) => self.is_stale(d, now),
                None => true,
            };

            if prune {
                let err = LoopError::StaleLoop(path.display().to_string());
                warn!("{}; pruning", err);
                if let Err(e) = fs::remove_file(&path) {
                    warn!("failed to prune {}: {}", path.display(), e);
                }
                continue;
            }
            if let Some(d) = descriptor {
                live.push(d);
            }
        }

        live.sort_by(|a, b| {
            a.working_directory
                .cmp(&b.working_directory)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(live)
    }
}

/// `$AGENT_LOOP_HOME/registry`, else `~/.agent-loop/registry`
pub fn default_dir() -> Option<PathBuf> {
    match std::env::var_os(HOME_ENV) {
        Some(home) if !home.is_empty() => Some(PathBuf::from(home).join("registry")),
        _ => dirs::home_dir().map(|home| home.join(".agent-loop").join("registry")),
    }
}

/// Flatten a path into a single file name component
pub fn sanitize_path(path: &Path) -> String {
    let flat: String = path
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '-' })
        .collect();
    flat.trim_matches('-').to_string()
}

/// Whether a process with this id exists; `None` when the platform cannot tell
#[cfg(unix)]
pub fn process_alive(pid: u32) -> Option<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(target) = signal_target(pid) else {
        return Some(false);
    };
    match kill(target, None) {
        Ok(()) | Err(Errno::EPERM) => Some(true),
        Err(Errno::ESRCH) => Some(false),
        Err(e) => {
            debug!(pid, "liveness check failed: {}", e);
            Some(false)
        }
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> Option<bool> {
    None
}

/// Ask another process to terminate
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    let not_running = || LoopError::StaleLoop(format!("process {} is not running", pid));
    let target = signal_target(pid).ok_or_else(not_running)?;
    match kill(target, Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(not_running()),
        Err(e) => Err(LoopError::ProcessIo(std::io::Error::from(e))),
    }
}

#[cfg(not(unix))]
pub fn terminate_process(pid: u32) -> Result<()> {
    Err(LoopError::Configuration(format!(
        "cannot signal process {} on this platform",
        pid
    )))
}

/// Pids 0 and below address process groups, never a single loop owner
#[cfg(unix)]
fn signal_target(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(name: &str) -> LoopSnapshot {
        LoopSnapshot::new(
            name,
            PathBuf::from("/home/dev/project"),
            PathBuf::from("/home/dev/project/.agent-loop").join(name),
            Some(5),
        )
    }

    #[test]
    fn sanitizes_working_directory() {
        assert_eq!(
            sanitize_path(Path::new("/home/dev/my project")),
            "home-dev-my-project"
        );
    }

    #[test]
    fn register_list_deregister() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::new(temp.path(), 15);
        let snap = snapshot("demo");

        registry.register(&snap).unwrap();
        assert!(registry
            .entry_path(&snap.working_directory, "demo")
            .ends_with("home-dev-project--demo.json"));

        let listed = registry.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "demo");
        assert_eq!(listed[0].pid, std::process::id());
        assert_eq!(listed[0].max_iterations, Some(5));

        registry
            .deregister(&snap.working_directory, "demo")
            .unwrap();
        assert!(registry.list().unwrap().is_empty());
        registry
            .deregister(&snap.working_directory, "demo")
            .unwrap();
    }

    #[test]
    fn missed_heartbeats_are_pruned() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::new(temp.path(), 1);
        let snap = snapshot("old");
        registry.register(&snap).unwrap();

        let path = registry.entry_path(&snap.working_directory, "old");
        let mut descriptor: LoopDescriptor =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        descriptor.last_seen = Utc::now() - Duration::seconds(60);
        fs::write(&path, serde_json::to_string(&descriptor).unwrap()).unwrap();

        assert!(registry.list().unwrap().is_empty());
        assert!(!path.exists());
    }

    #[cfg(unix)]
    fn exited_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[cfg(unix)]
    #[test]
    fn liveness_follows_the_process() {
        assert_eq!(process_alive(std::process::id()), Some(true));
        assert_eq!(process_alive(exited_pid()), Some(false));
        assert_eq!(process_alive(0), Some(false));
        // pid 1 belongs to another user when not root; still alive
        assert_eq!(process_alive(1), Some(true));
    }

    #[cfg(unix)]
    #[test]
    fn terminating_an_exited_process_is_stale() {
        let pid = exited_pid();
        match terminate_process(pid) {
            Err(LoopError::StaleLoop(msg)) => assert!(msg.contains(&pid.to_string())),
            other => panic!("expected StaleLoop, got {:?}", other),
        }
        assert!(matches!(terminate_process(0), Err(LoopError::StaleLoop(_))));
    }

    #[cfg(unix)]
    #[test]
    fn terminate_signals_a_running_process() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        terminate_process(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn heartbeat_freshness_reads_the_descriptor() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::new(temp.path(), 1);
        let snap = snapshot("beat");
        let now = Utc::now();
        assert!(!registry.heartbeat_fresh(&snap.working_directory, "beat", now));

        registry.register(&snap).unwrap();
        assert!(registry.heartbeat_fresh(&snap.working_directory, "beat", now));
        assert!(!registry.heartbeat_fresh(
            &snap.working_directory,
            "beat",
            now + Duration::seconds(60)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn dead_owner_is_pruned() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::new(temp.path(), 15);

        let mut snap = snapshot("orphan");
        snap.pid = exited_pid();
        registry.register(&snap).unwrap();
        registry.register(&snapshot("alive")).unwrap();

        let names: Vec<String> = registry.list().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alive".to_string()]);
    }

    #[test]
    fn unreadable_descriptor_is_pruned() {
        let temp = TempDir::new().unwrap();
        let registry = Registry::new(temp.path(), 15);
        fs::write(temp.path().join("broken.json"), "{not json").unwrap();
        assert!(registry.list().unwrap().is_empty());
        assert!(!temp.path().join("broken.json").exists());
    }

    #[test]
    fn configured_directory_wins() {
        let config = LoopConfig {
            registry_dir: Some(PathBuf::from("/tmp/loops")),
            ..LoopConfig::default()
        };
        let registry = Registry::from_config(&config).unwrap();
        assert_eq!(registry.dir(), Path::new("/tmp/loops"));
    }
}
