//! Workshop VM status and its broadcaster.
//!
//! Every transition is published to subscribers in the order it was produced.
//! Publishing the value already held is swallowed unless the caller asks for
//! an explicit re-emit (used to synchronise late subscribers).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle status of the workshop VM.
///
/// ```text
/// PENDING → CREATING → CREATED → STARTING → (guest) RUNNING
///                                              │
///                         STOPPED ← STOPPING ←─┘
///                            │
///            DELETED ← DELETING  (quit only)
/// ```
///
/// Every in-progress state has a `*_FAILED` sibling. Failed states are never
/// retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Nothing has been requested yet.
    Pending,
    Creating,
    CreateFailed,
    Created,
    Starting,
    StartFailed,
    /// Only ever set from a guest-reported signal.
    Running,
    Stopping,
    StopFailed,
    Stopped,
    Restarting,
    RestartFailed,
    Deleting,
    DeleteFailed,
    Deleted,
    WslInstalling,
    WslInstallFailed,
}

impl Status {
    pub const ALL: [Status; 17] = [
        Status::Pending,
        Status::Creating,
        Status::CreateFailed,
        Status::Created,
        Status::Starting,
        Status::StartFailed,
        Status::Running,
        Status::Stopping,
        Status::StopFailed,
        Status::Stopped,
        Status::Restarting,
        Status::RestartFailed,
        Status::Deleting,
        Status::DeleteFailed,
        Status::Deleted,
        Status::WslInstalling,
        Status::WslInstallFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Creating => "CREATING",
            Status::CreateFailed => "CREATE_FAILED",
            Status::Created => "CREATED",
            Status::Starting => "STARTING",
            Status::StartFailed => "START_FAILED",
            Status::Running => "RUNNING",
            Status::Stopping => "STOPPING",
            Status::StopFailed => "STOP_FAILED",
            Status::Stopped => "STOPPED",
            Status::Restarting => "RESTARTING",
            Status::RestartFailed => "RESTART_FAILED",
            Status::Deleting => "DELETING",
            Status::DeleteFailed => "DELETE_FAILED",
            Status::Deleted => "DELETED",
            Status::WslInstalling => "WSL_INSTALLING",
            Status::WslInstallFailed => "WSL_INSTALL_FAILED",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Status::CreateFailed
                | Status::StartFailed
                | Status::StopFailed
                | Status::RestartFailed
                | Status::DeleteFailed
                | Status::WslInstallFailed
        )
    }

    /// An operation is in flight.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Status::Creating
                | Status::Starting
                | Status::Stopping
                | Status::Restarting
                | Status::Deleting
                | Status::WslInstalling
        )
    }

    /// Fully torn down.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Stopped | Status::Deleted)
    }
}

impl std::str::FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or(())
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Holds the current status and fans transitions out to subscribers.
///
/// Subscribing returns a receiver; dropping it unsubscribes.
pub struct StatusBroadcaster {
    current: parking_lot::Mutex<Status>,
    tx: broadcast::Sender<Status>,
}

const STATUS_CHANNEL_CAPACITY: usize = 64;

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            current: parking_lot::Mutex::new(Status::Pending),
            tx,
        }
    }

    pub fn current(&self) -> Status {
        *self.current.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Status> {
        self.tx.subscribe()
    }

    /// Publish `status`. Returns false when it equals the current value.
    pub fn publish(&self, status: Status) -> bool {
        // Hold the lock while sending so concurrent publishers cannot reorder.
        let mut current = self.current.lock();
        if *current == status {
            return false;
        }
        *current = status;
        tracing::info!(target: "workshop::status", status = %status, "vm.status");
        let _ = self.tx.send(status);
        true
    }

    /// Re-emit the current value for subscribers that joined late.
    pub fn resync(&self) -> Status {
        let current = self.current.lock();
        let _ = self.tx.send(*current);
        *current
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
