//! Pausing host-side watchers around VM restarts.
//!
//! Watchers that push changes into the guest must not fire while it is going
//! down. The supervisor follows the status stream: it pauses every watcher on
//! `STOPPING` or `RESTARTING` and resumes them once the guest reports
//! `RUNNING`. Watchers start out paused.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use workshop_shared::errors::WorkshopResult;

use crate::lifecycle::Status;

/// A watcher that can be suspended without losing its configuration.
#[async_trait]
pub trait Pausable: Send + Sync {
    fn name(&self) -> &str;

    async fn pause(&self) -> WorkshopResult<()>;

    async fn resume(&self) -> WorkshopResult<()>;
}

/// Drives registered watchers from status transitions.
pub struct WatcherSupervisor {
    task: JoinHandle<()>,
}

impl WatcherSupervisor {
    pub fn spawn(watchers: Vec<Arc<dyn Pausable>>, statuses: broadcast::Receiver<Status>) -> Self {
        Self {
            task: tokio::spawn(supervise(watchers, statuses)),
        }
    }

    /// Stop following status changes. Watchers are left as they are.
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn supervise(watchers: Vec<Arc<dyn Pausable>>, mut statuses: broadcast::Receiver<Status>) {
    let mut paused = true;
    loop {
        let status = match statuses.recv().await {
            Ok(status) => status,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Watcher supervisor lagged behind status changes");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match status {
            Status::Stopping | Status::Restarting if !paused => {
                paused = true;
                for watcher in &watchers {
                    if let Err(e) = watcher.pause().await {
                        tracing::warn!(watcher = watcher.name(), "Failed to pause watcher: {}", e);
                    }
                }
            }
            Status::Running if paused => {
                paused = false;
                for watcher in &watchers {
                    if let Err(e) = watcher.resume().await {
                        tracing::warn!(watcher = watcher.name(), "Failed to resume watcher: {}", e);
                    }
                }
            }
            _ => {}
        }
    }
}
