//! Host prerequisites and capacity.

use async_trait::async_trait;
use std::sync::Arc;
use workshop_shared::errors::{WorkshopError, WorkshopResult};

pub mod host_check;
pub mod resources;

pub use host_check::{Accelerator, VirtualizationSupport, check_virtualization_support};
pub use resources::{GuestAllocation, HostResources};

/// Something the host must provide before the VM can be created.
#[async_trait]
pub trait HostPrerequisite: Send + Sync {
    /// Short name for prompts and logs.
    fn name(&self) -> &str;

    /// Whether [`HostPrerequisite::install`] can provide it.
    fn installable(&self) -> bool;

    /// `Ok(true)` when present.
    async fn check(&self) -> WorkshopResult<bool>;

    async fn install(&self) -> WorkshopResult<()>;
}

/// Windows Subsystem for Linux.
#[derive(Debug, Default)]
pub struct WslPrerequisite;

#[async_trait]
impl HostPrerequisite for WslPrerequisite {
    fn name(&self) -> &str {
        "WSL"
    }

    fn installable(&self) -> bool {
        true
    }

    async fn check(&self) -> WorkshopResult<bool> {
        match tokio::process::Command::new("wsl.exe")
            .arg("--status")
            .output()
            .await
        {
            Ok(output) => Ok(output.status.success()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn install(&self) -> WorkshopResult<()> {
        tracing::info!("Installing WSL");
        let status = tokio::process::Command::new("wsl.exe")
            .args(["--install", "--no-distribution"])
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(WorkshopError::PrerequisiteMissing(format!(
                "wsl.exe --install exited with {}",
                status
            )))
        }
    }
}

/// Hardware virtualization (KVM / Hypervisor.framework).
#[derive(Debug, Default)]
pub struct VirtualizationPrerequisite;

#[async_trait]
impl HostPrerequisite for VirtualizationPrerequisite {
    fn name(&self) -> &str {
        "hardware virtualization"
    }

    fn installable(&self) -> bool {
        false
    }

    async fn check(&self) -> WorkshopResult<bool> {
        let outcome = tokio::task::spawn_blocking(check_virtualization_support)
            .await
            .map_err(|e| WorkshopError::Internal(format!("virtualization check panicked: {}", e)))?;
        match outcome {
            Ok(support) => {
                tracing::debug!(reason = %support.reason, "Virtualization available");
                Ok(true)
            }
            Err(WorkshopError::Unsupported(reason)) => {
                tracing::warn!("Virtualization unavailable: {}", reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn install(&self) -> WorkshopResult<()> {
        Err(WorkshopError::Unsupported(
            check_virtualization_support()
                .err()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "virtualization cannot be installed".into()),
        ))
    }
}

/// The prerequisite matching the host platform.
pub fn host_prerequisite() -> Arc<dyn HostPrerequisite> {
    if cfg!(target_os = "windows") {
        Arc::new(WslPrerequisite)
    } else {
        Arc::new(VirtualizationPrerequisite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_prerequisite_matches_platform() {
        let prerequisite = host_prerequisite();
        if cfg!(target_os = "windows") {
            assert_eq!(prerequisite.name(), "WSL");
            assert!(prerequisite.installable());
        } else {
            assert_eq!(prerequisite.name(), "hardware virtualization");
            assert!(!prerequisite.installable());
        }
    }

    #[tokio::test]
    async fn test_virtualization_cannot_be_installed() {
        let err = VirtualizationPrerequisite.install().await.unwrap_err();
        assert!(matches!(err, WorkshopError::Unsupported(_)));
    }
}
