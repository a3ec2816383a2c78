//! WSL backend: boots the workshop distribution through `wsl.exe`.
//!
//! The distribution is imported once per instance. Booting runs a
//! long-lived `wsl.exe -d <name>` whose output is the guest console.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast};
use workshop_shared::constants::guest_paths;
use workshop_shared::errors::{WorkshopError, WorkshopResult};

use super::process::{LogStreamHandler, run_tool, spawn_streaming};
use super::registry::BackendRegistration;
use super::{BackendKind, BackendOptions, MachineParams, VmBackend};

const LOG_CHANNEL_CAPACITY: usize = 256;

/// Environment variable carrying the projects directory into the guest.
const PROJECTS_ENV: &str = "NOOP_PROJECTS_DIR";

struct BootProcess {
    child: Child,
    logs: LogStreamHandler,
}

/// Drives one WSL distribution.
pub struct WslBackend {
    name: String,
    wsl: PathBuf,
    state_dir: PathBuf,
    lines: broadcast::Sender<String>,
    projects_dir: parking_lot::Mutex<Option<PathBuf>>,
    boot: Mutex<Option<BootProcess>>,
}

impl WslBackend {
    pub fn new(options: BackendOptions) -> Self {
        let (lines, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            name: options.name,
            wsl: PathBuf::from("wsl.exe"),
            state_dir: options.state_dir,
            lines,
            projects_dir: parking_lot::Mutex::new(None),
            boot: Mutex::new(None),
        }
    }

    fn wsl<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.wsl);
        command.args(args);
        command
    }

    async fn is_registered(&self) -> WorkshopResult<bool> {
        let output = self
            .wsl(["--list", "--quiet"])
            .output()
            .await
            .map_err(|e| WorkshopError::Backend(format!("failed to run wsl.exe --list: {}", e)))?;
        if !output.status.success() {
            return Err(WorkshopError::Backend(format!(
                "wsl.exe --list exited with {}",
                output.status
            )));
        }
        let listing = decode_wsl_output(&output.stdout);
        Ok(listing.lines().any(|line| line.trim() == self.name))
    }

    async fn terminate(&self) -> WorkshopResult<()> {
        run_tool(
            self.wsl(["--terminate", self.name.as_str()]),
            "wsl.exe --terminate",
            None,
            &self.lines,
        )
        .await
    }

    /// Reap the boot process once it has exited.
    async fn reap(boot: BootProcess) {
        let BootProcess { mut child, logs } = boot;
        let _ = child.wait().await;
        logs.shutdown().await;
    }
}

/// `wsl.exe` writes its own messages as UTF-16LE.
fn decode_wsl_output(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes.iter().skip(1).step_by(2).all(|b| *b == 0) {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
            .trim_start_matches('\u{feff}')
            .to_string()
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

#[async_trait]
impl VmBackend for WslBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wsl
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn log_lines(&self) -> broadcast::Receiver<String> {
        self.lines.subscribe()
    }

    async fn create(&self, params: &MachineParams) -> WorkshopResult<()> {
        *self.projects_dir.lock() = params
            .mounts
            .iter()
            .find(|mount| mount.guest_path == guest_paths::PROJECTS)
            .map(|mount| mount.host_path.clone());

        if self.is_registered().await? {
            tracing::info!(name = %self.name, "WSL distribution exists, reusing it");
            return Ok(());
        }

        let install_dir = self.state_dir.join(&self.name);
        tokio::fs::create_dir_all(&install_dir).await?;

        let mut command = self.wsl(["--import"]);
        command
            .arg(&self.name)
            .arg(&install_dir)
            .arg(&params.boot_disk)
            .arg("--vhd");
        run_tool(command, "wsl.exe --import", None, &self.lines).await
    }

    async fn start(&self) -> WorkshopResult<()> {
        let mut boot = self.boot.lock().await;
        if boot.is_some() {
            return Err(WorkshopError::Backend(format!(
                "WSL distribution {} is already booting",
                self.name
            )));
        }

        let mut command = self.wsl(["-d", self.name.as_str()]);
        let projects_dir = self.projects_dir.lock().clone();
        if let Some(projects) = projects_dir {
            // `/p` translates the Windows path for the Linux side.
            command
                .env(PROJECTS_ENV, projects)
                .env("WSLENV", format!("{}/p", PROJECTS_ENV));
        }
        let (child, logs) = spawn_streaming(command, "wsl.exe -d", false, &self.lines)?;
        tracing::debug!(name = %self.name, pid = ?child.id(), "WSL boot process started");
        *boot = Some(BootProcess { child, logs });
        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> WorkshopResult<()> {
        let Some(mut boot) = self.boot.lock().await.take() else {
            return self.terminate().await;
        };

        match tokio::time::timeout(timeout, boot.child.wait()).await {
            Ok(_) => {
                boot.logs.shutdown().await;
                Ok(())
            }
            Err(_) => {
                tracing::warn!(name = %self.name, ?timeout, "WSL boot process still running, terminating");
                let result = self.terminate().await;
                Self::reap(boot).await;
                result
            }
        }
    }

    async fn kill(&self) -> WorkshopResult<()> {
        let boot = self.boot.lock().await.take();
        let result = self.terminate().await;
        if let Some(mut boot) = boot {
            let _ = boot.child.start_kill();
            Self::reap(boot).await;
        }
        result
    }

    async fn delete(&self) -> WorkshopResult<()> {
        if !self.is_registered().await? {
            tracing::debug!(name = %self.name, "No distribution to unregister");
            return Ok(());
        }
        run_tool(
            self.wsl(["--unregister", self.name.as_str()]),
            "wsl.exe --unregister",
            None,
            &self.lines,
        )
        .await
    }
}

fn create_wsl_backend(options: BackendOptions) -> WorkshopResult<Arc<dyn VmBackend>> {
    Ok(Arc::new(WslBackend::new(options)))
}

inventory::submit! {
    BackendRegistration {
        kind: BackendKind::Wsl,
        factory: create_wsl_backend,
    }
}
