//! Backend abstraction for the workshop VM.
//!
//! A backend drives one named machine instance through some virtualization
//! technology. The controller never knows which one is active.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use workshop_shared::errors::{WorkshopError, WorkshopResult};

pub mod events;
#[cfg(feature = "lima-backend")]
pub mod lima;
pub(crate) mod process;
pub mod registry;
#[cfg(feature = "wsl-backend")]
pub mod wsl;

pub use events::{GuestEvent, GuestEventSource, LogSignalSource};
pub use registry::{
    BackendFactoryFn, BackendRegistration, available_backends, create_backend, is_registered,
};

/// Available backend implementations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hypervisor image boot through `limactl`.
    Lima,
    /// Managed distribution boot through `wsl.exe`.
    Wsl,
}

impl BackendKind {
    /// WSL on Windows, Lima everywhere else.
    pub fn for_host() -> Self {
        if cfg!(target_os = "windows") {
            BackendKind::Wsl
        } else {
            BackendKind::Lima
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Lima => "lima",
            BackendKind::Wsl => "wsl",
        }
    }
}

impl FromStr for BackendKind {
    type Err = WorkshopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lima" => Ok(BackendKind::Lima),
            "wsl" => Ok(BackendKind::Wsl),
            _ => Err(WorkshopError::Config(format!(
                "Unknown backend type: '{}'. Supported: lima, wsl",
                s
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host directory exposed to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: PathBuf,
    pub guest_path: String,
    pub writable: bool,
}

/// A guest port published on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub guest_port: u16,
    pub host_ip: String,
    /// Host port; `None` publishes on the guest port number.
    pub host_port: Option<u16>,
}

/// Everything a backend needs to create the machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineParams {
    pub name: String,
    /// Guest architecture in image naming form (`aarch64`, `x86_64`).
    pub arch: String,
    pub cpus: usize,
    pub memory_bytes: u64,
    /// Per-run copy of the base image the guest boots from.
    pub boot_disk: PathBuf,
    pub mounts: Vec<Mount>,
    pub port_forwards: Vec<PortForward>,
    /// Backend-private state directory (instance files, imported distribution).
    pub state_dir: PathBuf,
}

/// Settings a backend is constructed from.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub name: String,
    /// Directory holding bundled tools (`limactl`), if any.
    pub tools_dir: Option<PathBuf>,
    /// Backend-private home (e.g. `LIMA_HOME`).
    pub state_dir: PathBuf,
}

/// Driver for a single named machine instance.
#[async_trait]
pub trait VmBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &str;

    /// Lines logged by the backend and the guest boot.
    ///
    /// Subscribing after a line was sent misses it; subscribe before `create`.
    fn log_lines(&self) -> broadcast::Receiver<String>;

    async fn create(&self, params: &MachineParams) -> WorkshopResult<()>;

    async fn start(&self) -> WorkshopResult<()>;

    /// Stop the machine, forcing it down once `timeout` elapses.
    async fn stop(&self, timeout: Duration) -> WorkshopResult<()>;

    /// Terminate the machine without waiting for the guest.
    async fn kill(&self) -> WorkshopResult<()>;

    /// Remove the machine instance and its backend state.
    async fn delete(&self) -> WorkshopResult<()>;
}

/// Produces backend adapters for the controller.
pub trait BackendFactory: Send + Sync {
    fn create(&self, kind: BackendKind, options: BackendOptions)
    -> WorkshopResult<Arc<dyn VmBackend>>;
}

/// Factory backed by the compile-time backend registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegisteredBackends;

impl BackendFactory for RegisteredBackends {
    fn create(
        &self,
        kind: BackendKind,
        options: BackendOptions,
    ) -> WorkshopResult<Arc<dyn VmBackend>> {
        create_backend(kind, options)
    }
}
