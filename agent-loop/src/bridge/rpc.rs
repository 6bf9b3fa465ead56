//! Out-of-process bridge: the agent runs as a child process and speaks JSON
//! lines over its standard streams.
//!
//! Every command carries an `id` and is answered by a `response` line with the
//! same id. Steers are written as soon as they arrive; the agent applies them
//! in arrival order once its in-flight tool call finishes.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{AgentBridge, AgentSession, EventHub, EventStream, TurnOutcome};
use crate::config::LoopConfig;
use crate::error::{LoopError, Result};
use crate::events::{EventKind, RpcResponse};
use crate::monitor::{spawn_monitors, PendingResponses, RpcMonitor, StderrTail, TurnSignal};
use crate::process::{write_line, AgentProcess};

/// Opens sessions by spawning `config.agent_path` with `config.agent_command_args()`
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcBridge;

impl RpcBridge {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AgentBridge for RpcBridge {
    async fn open(&self, config: &LoopConfig, working_dir: &Path) -> Result<Box<dyn AgentSession>> {
        let session = RpcSession::spawn(config, working_dir).await?;
        Ok(Box::new(session))
    }
}

/// A session backed by one agent process
pub struct RpcSession {
    process: Mutex<AgentProcess>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingResponses,
    hub: EventHub,
    turn_rx: Mutex<mpsc::UnboundedReceiver<TurnSignal>>,
    monitors: StdMutex<Vec<JoinHandle<()>>>,
    stderr_tail: StderrTail,
    response_timeout: Duration,
    aborting: AtomicBool,
    disposed: AtomicBool,
}

impl RpcSession {
    /// Spawn the agent and confirm it answers before handing out the session
    pub async fn spawn(config: &LoopConfig, working_dir: &Path) -> Result<Self> {
        let mut process =
            AgentProcess::spawn(&config.agent_path, &config.agent_command_args(), working_dir)?;

        let stdin = process.stdin.take();
        let stdout = process.stdout.take().ok_or_else(|| {
            LoopError::BridgeUnavailable("agent stdout was not captured".to_string())
        })?;
        let stderr = process.stderr.take().ok_or_else(|| {
            LoopError::BridgeUnavailable("agent stderr was not captured".to_string())
        })?;

        let pending: PendingResponses = Arc::new(StdMutex::new(HashMap::new()));
        let hub = EventHub::new();
        let stderr_tail: StderrTail = Arc::new(StdMutex::new(VecDeque::new()));
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();

        let monitor = RpcMonitor::new(Arc::clone(&pending), hub.clone(), turn_tx);
        let (stdout_handle, stderr_handle) =
            spawn_monitors(stdout, stderr, monitor, Arc::clone(&stderr_tail));

        info!(pid = ?process.id(), agent = %config.agent_path, "agent process started");

        let session = Self {
            process: Mutex::new(process),
            stdin: Mutex::new(stdin),
            pending,
            hub,
            turn_rx: Mutex::new(turn_rx),
            monitors: StdMutex::new(vec![stdout_handle, stderr_handle]),
            stderr_tail,
            response_timeout: Duration::from_secs(config.response_timeout_secs),
            aborting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        };

        if let Err(e) = session.request("get_state", json!({})).await {
            session.dispose().await;
            return Err(LoopError::BridgeUnavailable(format!(
                "agent did not complete the handshake: {}",
                e
            )));
        }

        Ok(session)
    }

    /// Recent stderr output, for crash messages
    fn stderr_context(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if tail.is_empty() {
            String::new()
        } else {
            format!(" (stderr: {})", tail.iter().cloned().collect::<Vec<_>>().join(" | "))
        }
    }

    fn forget(&self, id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
    }

    /// Send a command and wait for its acknowledgement
    async fn request(&self, command: &str, fields: Value) -> Result<RpcResponse> {
        let id = Uuid::new_v4().to_string();
        let mut payload = match fields {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        payload.insert("id".to_string(), Value::String(id.clone()));
        payload.insert("type".to_string(), Value::String(command.to_string()));
        let line = Value::Object(payload).to_string();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone(), tx);

        {
            let mut stdin = self.stdin.lock().await;
            let result = match stdin.as_mut() {
                Some(stdin) => write_line(stdin, &line).await,
                None => Err(LoopError::SessionCrash("agent stdin is closed".to_string())),
            };
            if let Err(e) = result {
                self.forget(&id);
                return Err(e);
            }
        }
        debug!(command, id = %id, "command sent to agent");

        match tokio::time::timeout(self.response_timeout, rx).await {
            Err(_) => {
                self.forget(&id);
                Err(LoopError::SessionCrash(format!(
                    "no response to '{}' within {}s",
                    command,
                    self.response_timeout.as_secs()
                )))
            }
            Ok(Err(_)) => Err(LoopError::SessionCrash(format!(
                "agent exited before answering '{}'{}",
                command,
                self.stderr_context()
            ))),
            Ok(Ok(response)) if !response.success => Err(LoopError::SessionCrash(format!(
                "agent rejected '{}': {}",
                command,
                response.error.unwrap_or_else(|| "no reason given".to_string())
            ))),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

#[async_trait]
impl AgentSession for RpcSession {
    async fn prompt(&self, text: &str) -> Result<TurnOutcome> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(LoopError::SessionCrash("session already disposed".to_string()));
        }

        let mut turn_rx = self.turn_rx.lock().await;
        // an aborted turn may have ended after its prompt was abandoned
        while let Ok(signal) = turn_rx.try_recv() {
            if signal == TurnSignal::Exited {
                return Err(LoopError::SessionCrash(format!(
                    "agent process exited{}",
                    self.stderr_context()
                )));
            }
        }
        self.aborting.store(false, Ordering::SeqCst);

        self.request("prompt", json!({ "message": text })).await?;

        match turn_rx.recv().await {
            Some(TurnSignal::Ended { aborted }) => {
                if aborted || self.aborting.load(Ordering::SeqCst) {
                    Ok(TurnOutcome::Aborted)
                } else {
                    Ok(TurnOutcome::Completed)
                }
            }
            Some(TurnSignal::Exited) | None => Err(LoopError::SessionCrash(format!(
                "agent process exited mid-turn{}",
                self.stderr_context()
            ))),
        }
    }

    async fn steer(&self, text: &str) -> Result<()> {
        self.request("steer", json!({ "message": text })).await?;
        self.hub.emit_kind(EventKind::Steered {
            message: text.to_string(),
        });
        Ok(())
    }

    async fn reset_context(&self) -> Result<()> {
        self.request("new_session", json!({})).await?;
        Ok(())
    }

    fn subscribe(&self) -> EventStream {
        self.hub.subscribe()
    }

    async fn abort(&self) -> Result<()> {
        self.aborting.store(true, Ordering::SeqCst);
        self.request("abort", json!({})).await?;
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        // closing stdin lets a well-behaved agent exit on its own
        self.stdin.lock().await.take();

        let mut process = self.process.lock().await;
        match process.try_wait() {
            Ok(Some(status)) => debug!("agent process already exited: {:?}", status),
            _ => {
                if let Err(e) = process.kill().await {
                    warn!("failed to kill agent process: {}", e);
                }
            }
        }
        if let Err(e) = process.wait().await {
            debug!("failed to reap agent process: {}", e);
        }

        let monitors: Vec<JoinHandle<()>> = self
            .monitors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for handle in monitors {
            handle.abort();
        }
        info!("agent session disposed");
    }
}
