//! Output monitoring for the agent process streams.
//!
//! stdout carries JSON lines: command responses are routed to the waiting
//! request by id, everything else is published as session events. stderr is
//! plain text, logged and kept as a short tail for crash reports.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::EventHub;
use crate::events::{EventKind, RpcLine, RpcResponse, WireCursor};

const STDERR_TAIL_LINES: usize = 20;

/// Turn boundaries observed on stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSignal {
    /// `agent_end` was published
    Ended { aborted: bool },
    /// stdout closed; the agent is gone
    Exited,
}

/// Requests waiting for their `response` line, keyed by request id
pub type PendingResponses = Arc<Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>>;

/// Last lines the agent wrote to stderr
pub type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// JSON line monitor for stdout
pub struct RpcMonitor {
    pending: PendingResponses,
    hub: EventHub,
    turn_tx: mpsc::UnboundedSender<TurnSignal>,
    cursor: WireCursor,
}

impl RpcMonitor {
    pub fn new(
        pending: PendingResponses,
        hub: EventHub,
        turn_tx: mpsc::UnboundedSender<TurnSignal>,
    ) -> Self {
        Self {
            pending,
            hub,
            turn_tx,
            cursor: WireCursor::new(),
        }
    }

    /// Monitor stdout until it closes, then fail everything still waiting
    pub async fn monitor_stream<R>(&mut self, reader: &mut BufReader<R>)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("stdout stream closed");
                    break;
                }
                Ok(_) => self.process_line(&line),
                Err(e) => {
                    warn!("stdout read error: {}", e);
                    break;
                }
            }
        }
        self.close();
    }

    fn process_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let parsed = match RpcLine::parse_at(line, &mut self.cursor) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Failed to parse agent output: {} - line: {}", e, line.trim());
                return;
            }
        };

        match parsed {
            RpcLine::Response(response) => {
                let waiter = response.id.as_ref().and_then(|id| {
                    self.pending
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .remove(id)
                });
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(
                        command = %response.command,
                        "response without a waiting request"
                    ),
                }
            }
            RpcLine::Events(events) => {
                for event in events {
                    let end = match event.kind {
                        EventKind::AgentEnd { aborted } => Some(TurnSignal::Ended { aborted }),
                        _ => None,
                    };
                    self.hub.emit(event);
                    // published before the signal so the turn is complete when prompt resolves
                    if let Some(signal) = end {
                        let _ = self.turn_tx.send(signal);
                    }
                }
            }
            RpcLine::Ignored(kind) => debug!("Event: {}", kind),
        }
    }

    fn close(&self) {
        // dropping the senders wakes every waiter with an error
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        let _ = self.turn_tx.send(TurnSignal::Exited);
    }
}

/// Plain text monitor for stderr
pub struct StderrMonitor {
    tail: StderrTail,
}

impl StderrMonitor {
    pub fn new(tail: StderrTail) -> Self {
        Self { tail }
    }

    /// Monitor stderr for plain text output
    pub async fn monitor_stream<R>(&mut self, reader: &mut BufReader<R>)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("stderr stream closed");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        debug!("stderr: {}", trimmed);
                        let mut tail = self
                            .tail
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(trimmed.to_string());
                    }
                }
                Err(e) => {
                    warn!("stderr read error: {}", e);
                    break;
                }
            }
        }
    }
}

/// Spawn monitor tasks for stdout (JSON) and stderr (plain text)
pub fn spawn_monitors<O, E>(
    stdout: BufReader<O>,
    stderr: BufReader<E>,
    monitor: RpcMonitor,
    tail: StderrTail,
) -> (JoinHandle<()>, JoinHandle<()>)
where
    O: tokio::io::AsyncRead + Unpin + Send + 'static,
    E: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let stdout_handle = tokio::spawn(async move {
        let mut stdout = stdout;
        let mut monitor = monitor;
        monitor.monitor_stream(&mut stdout).await;
    });

    let stderr_handle = tokio::spawn(async move {
        let mut stderr = stderr;
        let mut monitor = StderrMonitor::new(tail);
        monitor.monitor_stream(&mut stderr).await;
    });

    (stdout_handle, stderr_handle)
}
