//! Raw engine subprocess: spawn, line I/O tasks, and teardown.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::uci::{parse_uci_message, UciMessage};
use crate::{EngineError, EngineSpec};

/// Outcome of waiting for the next engine message.
#[derive(Debug)]
pub(crate) enum Recv {
    Message(UciMessage),
    /// Engine stdout closed; the process is gone or going.
    Closed,
    Deadline,
}

pub(crate) struct UciProcess {
    child: Child,
    stdin_tx: mpsc::Sender<String>,
    message_rx: mpsc::Receiver<UciMessage>,
    label: String,
}

impl UciProcess {
    /// Launch the executable with piped stdio and start the reader and
    /// writer tasks. No protocol traffic is sent yet.
    pub(crate) fn spawn(spec: &EngineSpec, label: &str) -> Result<Self, EngineError> {
        let path = spec.path.display();
        let mut child = tokio::process::Command::new(&spec.path)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::launch(&path, e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::launch(&path, "engine has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::launch(&path, "engine has no stdout"))?;

        tracing::debug!(engine = label, pid = ?child.id(), "Engine process spawned");

        let (message_tx, message_rx) = mpsc::channel::<UciMessage>(256);
        let reader_label = label.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        tracing::debug!(engine = %reader_label, "Engine stdout EOF");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        tracing::trace!(engine = %reader_label, "UCI << {}", trimmed);
                        match parse_uci_message(trimmed) {
                            Ok(msg) => {
                                if message_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::trace!(engine = %reader_label, "Ignoring engine output: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(engine = %reader_label, "Error reading engine stdout: {}", e);
                        break;
                    }
                }
            }
        });

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);
        let writer_label = label.to_string();
        tokio::spawn(async move {
            while let Some(cmd) = stdin_rx.recv().await {
                tracing::trace!(engine = %writer_label, "UCI >> {}", cmd);
                let line = format!("{cmd}\n");
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    tracing::debug!(engine = %writer_label, "Failed to write to engine stdin: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    tracing::debug!(engine = %writer_label, "Failed to flush engine stdin: {}", e);
                    break;
                }
            }
        });

        Ok(Self {
            child,
            stdin_tx,
            message_rx,
            label: label.to_string(),
        })
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) async fn send(&self, cmd: impl Into<String>) -> Result<(), EngineError> {
        self.stdin_tx
            .send(cmd.into())
            .await
            .map_err(|_| EngineError::Crashed)
    }

    pub(crate) async fn recv_until(&mut self, deadline: Instant) -> Recv {
        match timeout_at(deadline, self.message_rx.recv()).await {
            Ok(Some(msg)) => Recv::Message(msg),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Deadline,
        }
    }

    /// Discard messages until one satisfies `pred`.
    pub(crate) async fn wait_for(
        &mut self,
        deadline: Instant,
        mut pred: impl FnMut(&UciMessage) -> bool,
    ) -> Recv {
        loop {
            match self.recv_until(deadline).await {
                Recv::Message(msg) if pred(&msg) => return Recv::Message(msg),
                Recv::Message(_) => continue,
                other => return other,
            }
        }
    }

    /// Ask the engine to quit, then kill it if it has not exited within
    /// `grace`.
    pub(crate) async fn shutdown(mut self, grace: Duration) {
        let _ = self.send("quit").await;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(engine = %self.label, %status, "Engine exited");
            }
            _ => {
                tracing::debug!(engine = %self.label, "Engine ignored quit, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}
