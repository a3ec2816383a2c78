//! Hardware acceleration checks for the Lima backend.
//!
//! Lima boots the workshop image through QEMU on Linux, which needs a usable
//! `/dev/kvm`, and through Apple's hypervisor on macOS, which the kernel
//! advertises as `kern.hv_support`. Windows hosts go through WSL instead.

use std::path::Path;

use workshop_shared::{WorkshopError, WorkshopResult};

/// Which accelerator Lima will use on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    Kvm,
    Hypervisor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualizationSupport {
    pub accelerator: Accelerator,
    pub reason: String,
}

/// Check that Lima can run accelerated guests here.
///
/// # Errors
/// `WorkshopError::Unsupported` naming what is missing.
pub fn check_virtualization_support() -> WorkshopResult<VirtualizationSupport> {
    #[cfg(target_os = "linux")]
    {
        check_kvm_device(Path::new("/dev/kvm"))
    }

    #[cfg(target_os = "macos")]
    {
        check_macos_hypervisor()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(WorkshopError::Unsupported(
            "the Lima backend runs on Linux and macOS only".into(),
        ))
    }
}

/// The KVM device must exist and be openable read-write by this user.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn check_kvm_device(device: &Path) -> WorkshopResult<VirtualizationSupport> {
    if !device.exists() {
        return Err(WorkshopError::Unsupported(format!(
            "Lima needs KVM to accelerate QEMU, but {} is missing; \
             enable virtualization in the firmware settings and load the kvm module",
            device.display()
        )));
    }

    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => WorkshopError::Unsupported(format!(
                "{} is not accessible to this user; join the kvm group and log in again",
                device.display()
            )),
            _ => WorkshopError::Unsupported(format!("cannot open {}: {}", device.display(), e)),
        })?;

    Ok(VirtualizationSupport {
        accelerator: Accelerator::Kvm,
        reason: format!("{} is usable", device.display()),
    })
}

#[cfg(target_os = "macos")]
fn check_macos_hypervisor() -> WorkshopResult<VirtualizationSupport> {
    let output = std::process::Command::new("sysctl")
        .args(["-n", "kern.hv_support"])
        .output()
        .map_err(|e| WorkshopError::Unsupported(format!("cannot run sysctl: {}", e)))?;

    if output.status.success() && hv_support_enabled(&String::from_utf8_lossy(&output.stdout)) {
        Ok(VirtualizationSupport {
            accelerator: Accelerator::Hypervisor,
            reason: "kern.hv_support is enabled".to_string(),
        })
    } else {
        Err(WorkshopError::Unsupported(
            "this Mac does not expose the hypervisor Lima needs (kern.hv_support is off)".into(),
        ))
    }
}

/// `sysctl -n kern.hv_support` prints `1` when the hypervisor is usable.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn hv_support_enabled(sysctl_output: &str) -> bool {
    sysctl_output.trim() == "1"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_kvm_device_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let err = check_kvm_device(&dir.path().join("kvm")).unwrap_err();
        assert!(matches!(err, WorkshopError::Unsupported(_)));
        assert!(err.to_string().contains("Lima needs KVM"));
    }

    #[test]
    fn test_openable_device_is_reported_as_kvm() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("kvm");
        std::fs::write(&device, b"").unwrap();

        let support = check_kvm_device(&device).unwrap();
        assert_eq!(support.accelerator, Accelerator::Kvm);
    }

    #[test]
    fn test_hv_support_parsing() {
        assert!(hv_support_enabled("1\n"));
        assert!(!hv_support_enabled("0\n"));
        assert!(!hv_support_enabled(""));
    }
}
