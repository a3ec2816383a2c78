//! Guest lifecycle events.
//!
//! The guest reports its own status by printing `WORKSHOP_STATUS=<STATUS>`
//! to the boot console, which reaches the host through the backend log stream.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::broadcast;
use workshop_shared::constants::signal;

use crate::lifecycle::Status;

static STATUS_SIGNAL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(&format!(r"{}=([A-Z_]+)", signal::STATUS_MARKER)).ok());

/// Something the guest told the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestEvent {
    Status(Status),
}

impl GuestEvent {
    /// Parse a single log line. Unknown status names are ignored.
    pub fn parse(line: &str) -> Option<Self> {
        let captures = STATUS_SIGNAL.as_ref()?.captures(line)?;
        let status = captures.get(1)?.as_str().parse::<Status>().ok()?;
        Some(GuestEvent::Status(status))
    }
}

/// Typed stream of guest events.
#[async_trait]
pub trait GuestEventSource: Send {
    /// Next event, or `None` once the stream has ended.
    async fn next_event(&mut self) -> Option<GuestEvent>;
}

/// Reads guest events out of a backend log broadcast.
pub struct LogSignalSource {
    lines: broadcast::Receiver<String>,
}

impl LogSignalSource {
    pub fn new(lines: broadcast::Receiver<String>) -> Self {
        Self { lines }
    }
}

#[async_trait]
impl GuestEventSource for LogSignalSource {
    async fn next_event(&mut self) -> Option<GuestEvent> {
        loop {
            match self.lines.recv().await {
                Ok(line) => {
                    if let Some(event) = GuestEvent::parse(&line) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Guest log stream lagged, lines dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
