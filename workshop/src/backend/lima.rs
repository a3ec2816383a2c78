//! Lima backend: boots the workshop image through `limactl`.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use workshop_shared::constants::machine;
use workshop_shared::errors::{WorkshopError, WorkshopResult};

use super::process::{LogStreamHandler, run_tool};
use super::registry::BackendRegistration;
use super::{BackendKind, BackendOptions, MachineParams, VmBackend};

const LOG_CHANNEL_CAPACITY: usize = 256;
const SERIAL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Console logs Lima writes per instance, depending on the VM type.
const SERIAL_LOGS: [&str; 3] = ["serial.log", "serialv.log", "serialp.log"];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LimaTemplate {
    arch: String,
    images: Vec<LimaImage>,
    cpus: usize,
    memory: String,
    provision: Vec<serde_yaml::Value>,
    containerd: Containerd,
    ssh: Ssh,
    mounts: Vec<LimaMount>,
    port_forwards: Vec<LimaPortForward>,
    host_resolver: HostResolver,
    firmware: Firmware,
}

#[derive(Debug, Serialize)]
struct LimaImage {
    location: PathBuf,
    arch: String,
}

#[derive(Debug, Serialize)]
struct Containerd {
    system: bool,
    user: bool,
}

#[derive(Debug, Serialize)]
struct Ssh {
    #[serde(rename = "loadDotSSHPubKeys")]
    load_dot_ssh_pub_keys: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LimaMount {
    location: PathBuf,
    mount_point: String,
    writable: bool,
    sshfs: Sshfs,
}

#[derive(Debug, Serialize)]
struct Sshfs {
    cache: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LimaPortForward {
    guest_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    host_port: Option<u16>,
    #[serde(rename = "hostIP")]
    host_ip: String,
}

#[derive(Debug, Serialize)]
struct HostResolver {
    hosts: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct Firmware {
    #[serde(rename = "legacyBIOS")]
    legacy_bios: bool,
}

impl LimaTemplate {
    fn from_params(params: &MachineParams) -> Self {
        let mut hosts = BTreeMap::new();
        hosts.insert("registry.workshop".to_string(), "127.0.0.1".to_string());

        Self {
            arch: params.arch.clone(),
            images: vec![LimaImage {
                location: params.boot_disk.clone(),
                arch: params.arch.clone(),
            }],
            cpus: params.cpus,
            memory: format!("{}MiB", params.memory_bytes / (1024 * 1024)),
            provision: Vec::new(),
            containerd: Containerd {
                system: true,
                user: false,
            },
            ssh: Ssh {
                load_dot_ssh_pub_keys: false,
            },
            mounts: params
                .mounts
                .iter()
                .map(|mount| LimaMount {
                    location: mount.host_path.clone(),
                    mount_point: mount.guest_path.clone(),
                    writable: mount.writable,
                    sshfs: Sshfs { cache: false },
                })
                .collect(),
            port_forwards: params
                .port_forwards
                .iter()
                .map(|forward| LimaPortForward {
                    guest_port: forward.guest_port,
                    host_port: forward.host_port,
                    host_ip: forward.host_ip.clone(),
                })
                .collect(),
            host_resolver: HostResolver { hosts },
            firmware: Firmware { legacy_bios: true },
        }
    }

    fn to_yaml(&self) -> WorkshopResult<String> {
        serde_yaml::to_string(self)
            .map_err(|e| WorkshopError::Internal(format!("failed to render lima template: {}", e)))
    }
}

/// Drives one Lima instance.
pub struct LimaBackend {
    name: String,
    limactl: PathBuf,
    lima_home: PathBuf,
    lines: broadcast::Sender<String>,
    console_tail: Mutex<Option<JoinHandle<()>>>,
}

impl LimaBackend {
    pub fn new(options: BackendOptions) -> Self {
        let limactl = options
            .tools_dir
            .map(|dir| dir.join("limactl"))
            .unwrap_or_else(|| PathBuf::from("limactl"));
        let (lines, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);

        Self {
            name: options.name,
            limactl,
            lima_home: options.state_dir,
            lines,
            console_tail: Mutex::new(None),
        }
    }

    fn instance_dir(&self) -> PathBuf {
        self.lima_home.join(&self.name)
    }

    fn instance_exists(&self) -> bool {
        self.instance_dir().join("lima.yaml").exists()
    }

    fn limactl<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.limactl);
        command
            .args(args)
            .env("LIMA_HOME", &self.lima_home)
            .env("LIMA_CIDATA_NAME", machine::CIDATA_NAME)
            .env("LIMA_CIDATA_USER", machine::CIDATA_USER);
        command
    }

    /// Forward the guest console to the log stream, from its current end.
    async fn follow_console(&self) {
        let instance_dir = self.instance_dir();
        let offset = match find_console(&instance_dir) {
            Some(path) => tokio::fs::metadata(&path)
                .await
                .map(|meta| meta.len())
                .unwrap_or(0),
            None => 0,
        };
        let task = tokio::spawn(tail_console(instance_dir, offset, self.lines.clone()));
        if let Some(previous) = self.console_tail.lock().replace(task) {
            previous.abort();
        }
    }

    fn unfollow_console(&self) {
        if let Some(task) = self.console_tail.lock().take() {
            task.abort();
        }
    }
}

fn find_console(instance_dir: &Path) -> Option<PathBuf> {
    SERIAL_LOGS
        .iter()
        .map(|name| instance_dir.join(name))
        .find(|path| path.exists())
}

async fn tail_console(instance_dir: PathBuf, mut offset: u64, lines: broadcast::Sender<String>) {
    let mut interval = tokio::time::interval(SERIAL_POLL_INTERVAL);
    let mut partial = String::new();

    loop {
        interval.tick().await;
        let Some(path) = find_console(&instance_dir) else {
            continue;
        };
        let Ok(mut file) = tokio::fs::File::open(&path).await else {
            continue;
        };
        let Ok(len) = file.metadata().await.map(|meta| meta.len()) else {
            continue;
        };
        if len < offset {
            // Recreated by a fresh boot.
            offset = 0;
            partial.clear();
        }
        if len == offset {
            continue;
        }
        if file.seek(SeekFrom::Start(offset)).await.is_err() {
            continue;
        }
        let mut buf = Vec::with_capacity((len - offset) as usize);
        match file.read_to_end(&mut buf).await {
            Ok(read) => offset += read as u64,
            Err(e) => {
                tracing::debug!(path = %path.display(), "Failed to read guest console: {}", e);
                continue;
            }
        }

        partial.push_str(&String::from_utf8_lossy(&buf));
        while let Some(idx) = partial.find('\n') {
            let raw: String = partial.drain(..=idx).collect();
            let line = LogStreamHandler::strip_ansi_codes(raw.trim_end());
            if line.is_empty() {
                continue;
            }
            tracing::debug!(target: "vm:console", "{}", line);
            let _ = lines.send(line);
        }
    }
}

#[async_trait]
impl VmBackend for LimaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lima
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn log_lines(&self) -> broadcast::Receiver<String> {
        self.lines.subscribe()
    }

    async fn create(&self, params: &MachineParams) -> WorkshopResult<()> {
        if self.instance_exists() {
            tracing::info!(name = %self.name, "Lima instance exists, reusing it");
            return Ok(());
        }

        let template = LimaTemplate::from_params(params).to_yaml()?;
        tracing::debug!(name = %self.name, "Creating lima instance");
        let name_arg = format!("--name={}", self.name);
        run_tool(
            self.limactl(["create", "--tty=false", name_arg.as_str(), "-"]),
            "limactl create",
            Some(template),
            &self.lines,
        )
        .await
    }

    async fn start(&self) -> WorkshopResult<()> {
        self.follow_console().await;
        let result = run_tool(
            self.limactl(["start", "--tty=false", self.name.as_str()]),
            "limactl start",
            None,
            &self.lines,
        )
        .await;
        if result.is_err() {
            self.unfollow_console();
        }
        result
    }

    async fn stop(&self, timeout: Duration) -> WorkshopResult<()> {
        let graceful = run_tool(
            self.limactl(["stop", self.name.as_str()]),
            "limactl stop",
            None,
            &self.lines,
        );
        let result = match tokio::time::timeout(timeout, graceful).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(name = %self.name, ?timeout, "limactl stop timed out, forcing");
                self.kill().await
            }
        };
        if result.is_ok() {
            self.unfollow_console();
        }
        result
    }

    async fn kill(&self) -> WorkshopResult<()> {
        let result = run_tool(
            self.limactl(["stop", "-f", self.name.as_str()]),
            "limactl stop -f",
            None,
            &self.lines,
        )
        .await;
        self.unfollow_console();
        result
    }

    async fn delete(&self) -> WorkshopResult<()> {
        self.unfollow_console();
        if !self.instance_exists() {
            tracing::debug!(name = %self.name, "No lima instance to delete");
            return Ok(());
        }
        run_tool(
            self.limactl(["delete", "-f", self.name.as_str()]),
            "limactl delete",
            None,
            &self.lines,
        )
        .await
    }
}

impl Drop for LimaBackend {
    fn drop(&mut self) {
        self.unfollow_console();
    }
}

fn create_lima_backend(options: BackendOptions) -> WorkshopResult<Arc<dyn VmBackend>> {
    Ok(Arc::new(LimaBackend::new(options)))
}

inventory::submit! {
    BackendRegistration {
        kind: BackendKind::Lima,
        factory: create_lima_backend,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Mount, PortForward};

    fn params() -> MachineParams {
        MachineParams {
            name: "workshop-vm".into(),
            arch: "aarch64".into(),
            cpus: 6,
            memory_bytes: 12 * 1024 * 1024 * 1024,
            boot_disk: PathBuf::from("/tmp/disks/boot.qcow2"),
            mounts: vec![Mount {
                host_path: PathBuf::from("/Users/dev/projects"),
                guest_path: "/noop/projects".into(),
                writable: false,
            }],
            port_forwards: vec![
                PortForward {
                    guest_port: 1234,
                    host_ip: "0.0.0.0".into(),
                    host_port: None,
                },
                PortForward {
                    guest_port: 443,
                    host_ip: "127.0.0.1".into(),
                    host_port: Some(44452),
                },
            ],
            state_dir: PathBuf::from("/tmp/lima"),
        }
    }

    #[test]
    fn test_template_field_names() {
        let yaml = LimaTemplate::from_params(&params()).to_yaml().unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(value["arch"], "aarch64");
        assert_eq!(value["memory"], "12288MiB");
        assert_eq!(value["images"][0]["location"], "/tmp/disks/boot.qcow2");
        assert_eq!(value["ssh"]["loadDotSSHPubKeys"], false);
        assert_eq!(value["containerd"]["system"], true);
        assert_eq!(value["mounts"][0]["mountPoint"], "/noop/projects");
        assert_eq!(value["mounts"][0]["sshfs"]["cache"], false);
        assert_eq!(value["portForwards"][0]["hostIP"], "0.0.0.0");
        assert!(value["portForwards"][0].get("hostPort").is_none());
        assert_eq!(value["portForwards"][1]["hostPort"], 44452);
        assert_eq!(value["hostResolver"]["hosts"]["registry.workshop"], "127.0.0.1");
        assert_eq!(value["firmware"]["legacyBIOS"], true);
    }

    #[test]
    fn test_limactl_from_tools_dir() {
        let backend = LimaBackend::new(BackendOptions {
            name: "workshop-vm".into(),
            tools_dir: Some(PathBuf::from("/opt/lima/bin")),
            state_dir: PathBuf::from("/tmp/lima"),
        });
        assert_eq!(backend.limactl, PathBuf::from("/opt/lima/bin/limactl"));
        assert_eq!(backend.instance_dir(), PathBuf::from("/tmp/lima/workshop-vm"));
    }

    #[tokio::test]
    async fn test_delete_without_instance_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        // limactl does not exist here, so any invocation would fail.
        let backend = LimaBackend::new(BackendOptions {
            name: "workshop-vm".into(),
            tools_dir: Some(dir.path().join("missing-bin")),
            state_dir: dir.path().join("machines"),
        });
        backend.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_console_tail_forwards_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("serial.log");
        std::fs::write(&log, "old boot WORKSHOP_STATUS=RUNNING\n").unwrap();
        let start = std::fs::metadata(&log).unwrap().len();

        let (tx, mut rx) = broadcast::channel(16);
        let task = tokio::spawn(tail_console(dir.path().to_path_buf(), start, tx));

        let mut contents = std::fs::read_to_string(&log).unwrap();
        contents.push_str("\x1b[1mWORKSHOP_STATUS=RUNNING\x1b[0m\n");
        std::fs::write(&log, contents).unwrap();

        let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "WORKSHOP_STATUS=RUNNING");
        task.abort();
    }
}
