//! Child-process transport.
//!
//! Spawns the configured command with the parent environment overlaid by
//! the definition's `env`, frames JSON-RPC over the child's stdin/stdout,
//! and drains stderr into debug logs. Shutdown closes stdin, waits up to
//! five seconds for a graceful exit, then force-terminates.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, oneshot};

use super::transport::{Inbound, Transport};
use crate::config::session;
use crate::error::{UpstreamError, UpstreamResult};
use crate::protocol::{FrameDecoder, encode_message};
use crate::store::UpstreamDef;

/// Transport over a spawned MCP child process.
pub struct StdioTransport {
    command: String,
    stdin: Mutex<Option<ChildStdin>>,
    exited: Arc<AtomicBool>,
    shutdown: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl StdioTransport {
    /// Spawn the child and wire up its streams.
    pub fn spawn(def: &UpstreamDef) -> UpstreamResult<(Self, Inbound)> {
        let crate::store::UpstreamTransport::Stdio { command, args, env } = &def.transport else {
            return Err(UpstreamError::Config(format!(
                "upstream `{}` is not a stdio definition",
                def.name
            )));
        };

        tracing::info!(server = %def.name, command = %command, "spawning stdio upstream");

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| UpstreamError::Spawn { command: command.clone(), source })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (inbound_tx, inbound_rx) = mpsc::channel(session::INBOUND_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));

        if let Some(stdout) = stdout {
            let server = def.name.clone();
            tokio::spawn(read_stdout(stdout, inbound_tx, server));
        }

        if let Some(stderr) = stderr {
            let server = def.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "stderr: {line}");
                }
            });
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(supervise_child(child, shutdown_rx, Arc::clone(&exited), def.name.clone()));

        Ok((
            Self {
                command: command.clone(),
                stdin: Mutex::new(stdin),
                exited,
                shutdown: std::sync::Mutex::new(Some(shutdown_tx)),
            },
            inbound_rx,
        ))
    }
}

/// Pump framed stdout into the inbound channel until EOF.
async fn read_stdout(
    mut stdout: tokio::process::ChildStdout,
    inbound: mpsc::Sender<serde_json::Value>,
    server: String,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; session::READ_CHUNK_SIZE];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(server = %server, "stdout closed");
                break;
            }
            Ok(n) => {
                for message in decoder.push(&buf[..n]) {
                    if inbound.send(message).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::warn!(server = %server, error = %err, "stdout read failed");
                break;
            }
        }
    }
}

/// Own the child: record its exit, and on shutdown give it a grace period
/// before force-terminating.
async fn supervise_child(
    mut child: Child,
    shutdown: oneshot::Receiver<()>,
    exited: Arc<AtomicBool>,
    server: String,
) {
    tokio::select! {
        status = child.wait() => {
            exited.store(true, Ordering::SeqCst);
            match status {
                Ok(status) => tracing::info!(server = %server, %status, "upstream process exited"),
                Err(err) => tracing::warn!(server = %server, error = %err, "wait failed"),
            }
        }
        _ = shutdown => {
            // Stdin was already closed by the caller; give the child a
            // chance to exit on its own.
            let graceful =
                tokio::time::timeout(session::SHUTDOWN_GRACE, child.wait()).await;
            if graceful.is_err() {
                tracing::warn!(server = %server, "grace period elapsed, killing process");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            exited.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn send_json(&self, message: &serde_json::Value) -> UpstreamResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| UpstreamError::Transport("stdin closed".into()))?;

        stdin
            .write_all(&encode_message(message))
            .await
            .map_err(|err| UpstreamError::Transport(format!("stdin write failed: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| UpstreamError::Transport(format!("stdin flush failed: {err}")))
    }

    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        // Dropping stdin sends EOF, the polite MCP shutdown signal.
        self.stdin.lock().await.take();
        if let Some(tx) = self.shutdown.lock().expect("shutdown lock").take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.command)
            .field("alive", &self.is_alive())
            .finish()
    }
}
