//! Backend tool processes and their log streams.
//!
//! Lines read from a tool's stdout/stderr are re-logged through tracing and
//! forwarded to the backend's log broadcast, where the guest event source
//! picks up status signals.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use workshop_shared::errors::{WorkshopError, WorkshopResult};

/// Stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 5;

/// Log level for tool output streams.
#[derive(Debug, Clone, Copy)]
enum LogLevel {
    Debug,
    Warn,
}

/// Owns the reader tasks of one child process.
pub(crate) struct LogStreamHandler {
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl LogStreamHandler {
    /// Take the child's piped stdout/stderr and start streaming them.
    pub(crate) fn attach(child: &mut Child, lines: &broadcast::Sender<String>) -> Self {
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let stdout_task = child.stdout.take().map(|stdout| {
            Self::spawn_reader(stdout, LogLevel::Debug, lines.clone(), None)
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            Self::spawn_reader(
                stderr,
                LogLevel::Warn,
                lines.clone(),
                Some(Arc::clone(&stderr_tail)),
            )
        });

        Self {
            stdout_task,
            stderr_task,
            stderr_tail,
        }
    }

    /// Strips ANSI escape codes from a string.
    ///
    /// Tool output may carry color codes; re-logging them would double-format.
    pub(crate) fn strip_ansi_codes(text: &str) -> String {
        let mut result = String::with_capacity(text.len());
        let mut chars = text.chars();

        while let Some(c) = chars.next() {
            if c == '\x1b' {
                if chars.next() == Some('[') {
                    for next_char in chars.by_ref() {
                        if next_char == 'm' {
                            break;
                        }
                    }
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    fn spawn_reader<R>(
        reader: R,
        level: LogLevel,
        lines: broadcast::Sender<String>,
        tail: Option<Arc<Mutex<VecDeque<String>>>>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader).lines();
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        let clean_line = Self::strip_ansi_codes(&line);
                        match level {
                            LogLevel::Debug => {
                                tracing::debug!(target: "vm:stdout", "{}", clean_line);
                            }
                            LogLevel::Warn => {
                                tracing::warn!(target: "vm:stderr", "{}", clean_line);
                            }
                        }
                        if let Some(tail) = &tail {
                            let mut tail = tail.lock();
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(clean_line.clone());
                        }
                        // No subscribers is fine.
                        let _ = lines.send(clean_line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(target: "vm:stdout/stderr", "Failed to read from pipe: {}", e);
                        break;
                    }
                }
            }
            tracing::trace!(target: "vm:stdout/stderr", "Pipe closed, reader exiting");
        })
    }

    /// Last few stderr lines, oldest first.
    pub(crate) fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Wait for both readers to reach EOF.
    pub(crate) async fn shutdown(mut self) {
        for task in [self.stdout_task.take(), self.stderr_task.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = task.await {
                tracing::warn!("Tool output reader panicked: {:?}", e);
            }
        }
    }
}

impl Drop for LogStreamHandler {
    fn drop(&mut self) {
        // Readers end on EOF anyway; abort only ones left behind by an early drop.
        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Spawn `command` with piped output streams.
pub(crate) fn spawn_streaming(
    mut command: Command,
    action: &str,
    stdin: bool,
    lines: &broadcast::Sender<String>,
) -> WorkshopResult<(Child, LogStreamHandler)> {
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| WorkshopError::Backend(format!("failed to spawn {}: {}", action, e)))?;
    let handler = LogStreamHandler::attach(&mut child, lines);
    Ok((child, handler))
}

/// Run a tool to completion, streaming its output.
///
/// # Errors
/// `WorkshopError::Backend` when the tool cannot be spawned or exits
/// unsuccessfully; the message carries the tail of its stderr.
pub(crate) async fn run_tool(
    command: Command,
    action: &str,
    stdin: Option<String>,
    lines: &broadcast::Sender<String>,
) -> WorkshopResult<()> {
    tracing::debug!(action, "Running backend tool");
    let (mut child, handler) = spawn_streaming(command, action, stdin.is_some(), lines)?;

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|e| WorkshopError::Backend(format!("{}: failed to write stdin: {}", action, e)))?;
        // Closing stdin signals end of input.
        drop(pipe);
    }

    let status = child
        .wait()
        .await
        .map_err(|e| WorkshopError::Backend(format!("{}: failed to wait: {}", action, e)))?;
    let tail = handler.stderr_tail();
    handler.shutdown().await;

    if status.success() {
        tracing::debug!(action, "Backend tool finished");
        Ok(())
    } else {
        let tail = if tail.is_empty() {
            String::new()
        } else {
            format!(": {}", tail)
        };
        Err(WorkshopError::Backend(format!(
            "{} exited with {}{}",
            action, status, tail
        )))
    }
}
