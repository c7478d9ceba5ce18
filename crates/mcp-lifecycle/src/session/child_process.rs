//! Child process pipes for stdio servers
//!
//! A [`ChildProcess`] owns a spawned server and three background tasks:
//! a stdin writer fed by a channel, a stdout line reader feeding a channel,
//! and a stderr drain that forwards the server's diagnostics to `debug!`.
//!
//! Shutdown closes stdin first so well-behaved servers exit on their own,
//! then kills the process if it outlives `shutdown_timeout`. Dropping a
//! running `ChildProcess` kills it.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::error::{LifecycleError, Result};

/// Configuration for a stdio server process
#[derive(Debug, Clone)]
pub struct ChildProcessConfig {
    /// Command to execute
    pub command: String,

    /// Arguments to pass to the command
    pub args: Vec<String>,

    /// Working directory for the process
    pub working_directory: Option<String>,

    /// Extra environment variables
    pub environment: HashMap<String, String>,

    /// How long to wait for a graceful exit before killing
    pub shutdown_timeout: Duration,

    /// Lines longer than this are dropped
    pub max_message_size: usize,

    /// Buffered lines per direction
    pub channel_capacity: usize,

    /// Whether the OS process is killed when the handle is dropped
    pub kill_on_drop: bool,
}

impl Default for ChildProcessConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_directory: None,
            environment: HashMap::new(),
            shutdown_timeout: Duration::from_secs(5),
            max_message_size: 10 * 1024 * 1024, // 10MB
            channel_capacity: 100,
            kill_on_drop: true,
        }
    }
}

impl ChildProcessConfig {
    /// Config for `command` with `args`
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }
}

/// A running stdio server
#[derive(Debug)]
pub struct ChildProcess {
    server: String,
    config: ChildProcessConfig,
    child: Option<Child>,
    stdin_tx: Option<mpsc::Sender<String>>,
    stdout_rx: mpsc::Receiver<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChildProcess {
    /// Spawn the process and start its pipe tasks
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Connection`] if the command is empty, cannot
    /// be spawned, or its stdio handles are unavailable.
    pub fn spawn(server: &str, config: ChildProcessConfig) -> Result<Self> {
        if config.command.trim().is_empty() {
            return Err(LifecycleError::connection(server, "command cannot be empty"));
        }

        info!(server = %server, command = %config.command, args = ?config.args, "Starting child process");

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(config.kill_on_drop);

        if let Some(ref wd) = config.working_directory {
            cmd.current_dir(wd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!(server = %server, command = %config.command, error = %e, "Failed to spawn child process");
            LifecycleError::connection(server, format!("failed to spawn '{}': {e}", config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LifecycleError::connection(server, "failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LifecycleError::connection(server, "failed to get stdout handle"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LifecycleError::connection(server, "failed to get stderr handle"))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(config.channel_capacity);
        let (stdout_tx, stdout_rx) = mpsc::channel::<String>(config.channel_capacity);

        let writer_task = {
            let server = server.to_string();
            let mut writer = BufWriter::new(stdin);
            tokio::spawn(async move {
                while let Some(message) = stdin_rx.recv().await {
                    let written = async {
                        writer.write_all(message.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                        writer.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        error!(server = %server, error = %e, "Failed to write to process stdin");
                        break;
                    }
                    trace!(server = %server, message = %message, "Sent line to child process");
                }
                debug!(server = %server, "STDIN writer task completed");
            })
        };

        let reader_task = {
            let server = server.to_string();
            let max_size = config.max_message_size;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.len() > max_size {
                        warn!(server = %server, bytes = line.len(), "Dropping oversized line from child process");
                        continue;
                    }
                    trace!(server = %server, line = %line, "Received line from child process");
                    if stdout_tx.send(line).await.is_err() {
                        break;
                    }
                }
                debug!(server = %server, "STDOUT reader task completed");
            })
        };

        let stderr_task = {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "stderr: {}", line);
                }
            })
        };

        Ok(Self {
            server: server.to_string(),
            config,
            child: Some(child),
            stdin_tx: Some(stdin_tx),
            stdout_rx,
            tasks: vec![writer_task, reader_task, stderr_task],
        })
    }

    /// OS process id, while running
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Whether the process is still running
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(_)) | Err(_)) | None => false,
        }
    }

    /// Queue one line for the process's stdin
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Connection`] if stdin is closed.
    pub async fn send_line(&self, line: String) -> Result<()> {
        let tx = self
            .stdin_tx
            .as_ref()
            .ok_or_else(|| LifecycleError::connection(&self.server, "stdin is closed"))?;
        tx.send(line)
            .await
            .map_err(|_| LifecycleError::connection(&self.server, "child process stdin closed"))
    }

    /// Next line from the process's stdout
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Connection`] once stdout reaches EOF.
    pub async fn recv_line(&mut self) -> Result<String> {
        match self.stdout_rx.recv().await {
            Some(line) => Ok(line),
            None => {
                let status = self
                    .child
                    .as_mut()
                    .and_then(|c| c.try_wait().ok().flatten())
                    .map_or_else(|| "stdout closed".to_string(), |s| format!("process exited: {s}"));
                Err(LifecycleError::connection(&self.server, status))
            }
        }
    }

    /// Close stdin, wait for exit, kill on timeout
    pub async fn stop(&mut self) {
        self.stdin_tx = None;

        if let Some(mut child) = self.child.take() {
            match timeout(self.config.shutdown_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(server = %self.server, %status, "Child process exited");
                }
                Ok(Err(e)) => {
                    error!(server = %self.server, error = %e, "Failed to wait for child process exit");
                }
                Err(_) => {
                    warn!(server = %self.server, "Child process shutdown timed out, forcing kill");
                    if let Err(e) = child.kill().await {
                        error!(server = %self.server, error = %e, "Failed to force kill child process");
                    }
                }
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if let Some(ref mut child) = self.child
            && let Err(e) = child.start_kill()
        {
            debug!(server = %self.server, error = %e, "Kill on drop failed (process likely exited)");
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}
