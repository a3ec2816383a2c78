//! Error type shared across the workshop crates.

use thiserror::Error;

/// Result alias used by every fallible workshop operation.
pub type WorkshopResult<T> = Result<T, WorkshopError>;

/// Errors produced by the lifecycle controller and its collaborators.
#[derive(Debug, Error)]
pub enum WorkshopError {
    /// `start()` was called while a machine instance is already held.
    #[error("workshop VM is already running")]
    AlreadyRunning,

    /// A newer command replaced the one that produced this error.
    ///
    /// Never surfaced to callers of the controller: stale commands return quietly.
    #[error("command superseded by a newer command")]
    Superseded,

    /// A required host resource (base image, WSL, ...) is absent.
    #[error("prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    /// The host cannot run the requested backend.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A backend operation (create/start/stop/kill/delete) failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Traffic relay setup or teardown failed.
    #[error("relay error: {0}")]
    Relay(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    /// The guest API rejected or failed a request.
    #[error("api error: {0}")]
    Api(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WorkshopError {
    /// Whether this error only marks a command that lost to a newer one.
    pub fn is_superseded(&self) -> bool {
        matches!(self, WorkshopError::Superseded)
    }
}

impl From<serde_json::Error> for WorkshopError {
    fn from(e: serde_json::Error) -> Self {
        WorkshopError::Internal(format!("json: {}", e))
    }
}
