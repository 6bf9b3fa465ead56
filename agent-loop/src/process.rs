use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::error::{LoopError, Result};

/// Wrapper around an agent subprocess speaking JSON lines over its standard streams
pub struct AgentProcess {
    child: Child,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<BufReader<ChildStdout>>,
    pub stderr: Option<BufReader<ChildStderr>>,
}

impl AgentProcess {
    /// Spawn the agent in `working_dir`; it is killed if the handle is dropped
    pub fn spawn(agent_path: &str, args: &[String], working_dir: &Path) -> Result<Self> {
        debug!("Spawning agent process: {} {:?}", agent_path, args);

        let mut cmd = Command::new(agent_path);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            LoopError::BridgeUnavailable(format!("failed to spawn '{}': {}", agent_path, e))
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);
        let stderr = child.stderr.take().map(BufReader::new);

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    /// Wait for the process to exit and return the exit status
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child.wait().await.map_err(LoopError::ProcessIo)
    }

    /// Kill the process
    pub async fn kill(&mut self) -> Result<()> {
        self.child.kill().await.map_err(LoopError::ProcessIo)
    }

    /// Check if the process has exited
    pub fn try_wait(&mut self) -> Result<Option<std::process::ExitStatus>> {
        self.child.try_wait().map_err(LoopError::ProcessIo)
    }

    /// Get the process ID
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Write one line to the agent's stdin and flush it
pub async fn write_line(stdin: &mut ChildStdin, line: &str) -> Result<()> {
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(LoopError::ProcessIo)?;
    stdin.write_all(b"\n").await.map_err(LoopError::ProcessIo)?;
    stdin.flush().await.map_err(LoopError::ProcessIo)
}
