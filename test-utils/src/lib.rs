//! Fakes and fixtures for exercising the lifecycle controller without a VM.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use workshop::api::GuestApi;
use workshop::backend::{BackendFactory, BackendKind, BackendOptions, MachineParams, VmBackend};
use workshop::host::{HostPrerequisite, HostResources};
use workshop::lifecycle::{Collaborators, LifecycleController, Status};
use workshop::prompt::{MountScope, Prompter};
use workshop::relay::RelayConfig;
use workshop::runtime::{ControllerConfig, WorkshopLayout, guest_arch};
use workshop::settings::SettingsStore;
use workshop::{WorkshopError, WorkshopResult};

// ============================================================================
// BACKEND
// ============================================================================

/// A backend call, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create,
    Start,
    Stop(Duration),
    Kill,
    Delete,
}

/// Scripted behaviour shared by every backend a factory hands out.
#[derive(Debug, Clone)]
pub struct Script {
    pub create_error: Option<String>,
    pub start_error: Option<String>,
    pub stop_error: Option<String>,
    pub kill_error: Option<String>,
    pub delete_error: Option<String>,
    pub create_delay: Duration,
    pub start_delay: Duration,
    /// How long `stop` takes, regardless of the timeout it is given.
    pub stop_delay: Duration,
    /// Emit `WORKSHOP_STATUS=RUNNING` once `start` returns.
    pub boot_signal: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            create_error: None,
            start_error: None,
            stop_error: None,
            kill_error: None,
            delete_error: None,
            create_delay: Duration::ZERO,
            start_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
            boot_signal: true,
        }
    }
}

pub struct FakeBackend {
    name: String,
    lines: broadcast::Sender<String>,
    calls: Mutex<Vec<Call>>,
    script: Arc<Mutex<Script>>,
    params: Mutex<Option<MachineParams>>,
}

impl FakeBackend {
    fn new(name: String, script: Arc<Mutex<Script>>) -> Self {
        let (lines, _) = broadcast::channel(64);
        Self {
            name,
            lines,
            calls: Mutex::new(Vec::new()),
            script,
            params: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Parameters passed to the last `create`.
    pub fn params(&self) -> Option<MachineParams> {
        self.params.lock().clone()
    }

    /// Push a raw log line as if the guest printed it.
    pub fn emit(&self, line: impl Into<String>) {
        let _ = self.lines.send(line.into());
    }

    /// Report a guest status on the log stream.
    pub fn signal(&self, status: Status) {
        self.emit(format!("[guest] WORKSHOP_STATUS={}", status));
    }

    fn record(&self, call: Call) -> Script {
        self.calls.lock().push(call);
        self.script.lock().clone()
    }
}

fn scripted(error: Option<String>) -> WorkshopResult<()> {
    match error {
        Some(message) => Err(WorkshopError::Backend(message)),
        None => Ok(()),
    }
}

#[async_trait]
impl VmBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::for_host()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn log_lines(&self) -> broadcast::Receiver<String> {
        self.lines.subscribe()
    }

    async fn create(&self, params: &MachineParams) -> WorkshopResult<()> {
        let script = self.record(Call::Create);
        *self.params.lock() = Some(params.clone());
        tokio::time::sleep(script.create_delay).await;
        scripted(script.create_error)
    }

    async fn start(&self) -> WorkshopResult<()> {
        let script = self.record(Call::Start);
        tokio::time::sleep(script.start_delay).await;
        scripted(script.start_error)?;
        if script.boot_signal {
            self.signal(Status::Running);
        }
        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> WorkshopResult<()> {
        let script = self.record(Call::Stop(timeout));
        tokio::time::sleep(script.stop_delay).await;
        scripted(script.stop_error)
    }

    async fn kill(&self) -> WorkshopResult<()> {
        let script = self.record(Call::Kill);
        scripted(script.kill_error)
    }

    async fn delete(&self) -> WorkshopResult<()> {
        let script = self.record(Call::Delete);
        scripted(script.delete_error)
    }
}

/// Hands out [`FakeBackend`]s and remembers them.
#[derive(Default)]
pub struct FakeBackendFactory {
    script: Arc<Mutex<Script>>,
    created: Mutex<Vec<Arc<FakeBackend>>>,
}

impl FakeBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change behaviour for current and future backends.
    pub fn script(&self, update: impl FnOnce(&mut Script)) {
        update(&mut self.script.lock());
    }

    pub fn created(&self) -> Vec<Arc<FakeBackend>> {
        self.created.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<FakeBackend>> {
        self.created.lock().last().cloned()
    }

    /// Every call made on any backend, in creation then call order.
    pub fn all_calls(&self) -> Vec<Call> {
        self.created
            .lock()
            .iter()
            .flat_map(|backend| backend.calls())
            .collect()
    }
}

impl BackendFactory for FakeBackendFactory {
    fn create(
        &self,
        _kind: BackendKind,
        options: BackendOptions,
    ) -> WorkshopResult<Arc<dyn VmBackend>> {
        let backend = Arc::new(FakeBackend::new(options.name, Arc::clone(&self.script)));
        self.created.lock().push(Arc::clone(&backend));
        Ok(backend)
    }
}

// ============================================================================
// DIALOGS, SETTINGS, GUEST API, PREREQUISITES
// ============================================================================

/// Answers dialogs from queues. An empty directory queue leaves the prompt pending.
#[derive(Default)]
pub struct ScriptedPrompter {
    directories: Mutex<VecDeque<Option<PathBuf>>>,
    confirmations: Mutex<VecDeque<bool>>,
    prompts: Mutex<Vec<String>>,
    errors: Mutex<Vec<(String, String)>>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a directory answer; `None` cancels the dialog.
    pub fn answer_directory(&self, answer: Option<PathBuf>) {
        self.directories.lock().push_back(answer);
    }

    pub fn answer_confirm(&self, answer: bool) {
        self.confirmations.lock().push_back(answer);
    }

    /// Messages of every directory prompt shown so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().clone()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn select_directory(
        &self,
        message: &str,
        _default: Option<&Path>,
    ) -> WorkshopResult<Option<PathBuf>> {
        self.prompts.lock().push(message.to_string());
        let answer = self.directories.lock().pop_front();
        match answer {
            Some(answer) => Ok(answer),
            None => std::future::pending().await,
        }
    }

    async fn confirm(&self, _message: &str) -> WorkshopResult<bool> {
        Ok(self.confirmations.lock().pop_front().unwrap_or(true))
    }

    async fn show_error(&self, title: &str, message: &str) {
        self.errors.lock().push((title.to_string(), message.to_string()));
    }
}

#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    pub fn put(&self, key: &str, value: impl Into<String>) {
        self.values.lock().insert(key.to_string(), value.into());
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn get(&self, key: &str) -> WorkshopResult<Option<String>> {
        Ok(self.value(key))
    }

    async fn set(&self, key: &str, value: &str) -> WorkshopResult<()> {
        self.put(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> WorkshopResult<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Guest API that records stop requests.
#[derive(Default)]
pub struct FakeGuestApi {
    stop_requests: AtomicUsize,
    error: Mutex<Option<String>>,
    delay: Mutex<Duration>,
}

impl FakeGuestApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_requests(&self) -> usize {
        self.stop_requests.load(Ordering::SeqCst)
    }

    pub fn fail_with(&self, message: impl Into<String>) {
        *self.error.lock() = Some(message.into());
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }
}

#[async_trait]
impl GuestApi for FakeGuestApi {
    async fn request_stop(&self) -> WorkshopResult<()> {
        self.stop_requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        tokio::time::sleep(delay).await;
        let error = self.error.lock().clone();
        match error {
            Some(message) => Err(WorkshopError::Api(message)),
            None => Ok(()),
        }
    }
}

/// Prerequisite with a fixed answer.
pub struct StaticPrerequisite {
    present: Mutex<bool>,
    installable: bool,
    install_error: Option<String>,
    installs: AtomicUsize,
}

impl StaticPrerequisite {
    pub fn present() -> Self {
        Self::new(true, true, None)
    }

    pub fn new(present: bool, installable: bool, install_error: Option<String>) -> Self {
        Self {
            present: Mutex::new(present),
            installable,
            install_error,
            installs: AtomicUsize::new(0),
        }
    }

    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostPrerequisite for StaticPrerequisite {
    fn name(&self) -> &str {
        "Test prerequisite"
    }

    fn installable(&self) -> bool {
        self.installable
    }

    async fn check(&self) -> WorkshopResult<bool> {
        Ok(*self.present.lock())
    }

    async fn install(&self) -> WorkshopResult<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.install_error {
            return Err(WorkshopError::PrerequisiteMissing(message.clone()));
        }
        *self.present.lock() = true;
        Ok(())
    }
}

// ============================================================================
// NETWORK
// ============================================================================

/// TCP server that echoes every byte back. Stands in for the guest service.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A loopback address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

// ============================================================================
// CONTROLLER FIXTURE
// ============================================================================

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub struct TestContextBuilder {
    prerequisite: StaticPrerequisite,
    store_projects_dir: bool,
    relay_upstream: Option<SocketAddr>,
    config: ControllerConfig,
}

impl TestContextBuilder {
    pub fn prerequisite(mut self, prerequisite: StaticPrerequisite) -> Self {
        self.prerequisite = prerequisite;
        self
    }

    /// Leave the projects directory unset so `start` has to prompt.
    pub fn without_projects_dir(mut self) -> Self {
        self.store_projects_dir = false;
        self
    }

    pub fn relay_upstream(mut self, upstream: SocketAddr) -> Self {
        self.relay_upstream = Some(upstream);
        self
    }

    pub fn stop_timeouts(mut self, stop: Duration, short: Duration, reset: Duration) -> Self {
        self.config.stop_timeout = stop;
        self.config.short_stop_timeout = short;
        self.config.reset_stop_timeout = reset;
        self
    }

    pub async fn build(self) -> TestContext {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let home = temp_dir.path().join("home");
        let resources = temp_dir.path().join("resources");
        let user_home = temp_dir.path().join("user");
        let projects_dir = user_home.join("projects");
        std::fs::create_dir_all(&resources).unwrap();
        std::fs::create_dir_all(&projects_dir).unwrap();

        let extension = match self.config.backend {
            BackendKind::Lima => "qcow2",
            BackendKind::Wsl => "vhdx",
        };
        std::fs::write(
            resources.join(format!("noop-workshop-vm.{}.{}", guest_arch(), extension)),
            b"base image",
        )
        .unwrap();

        let upstream = match self.relay_upstream {
            Some(addr) => addr,
            None => spawn_echo_server().await,
        };
        let mut config = self.config;
        config.relay = RelayConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            upstream,
            drain_grace: Duration::from_millis(200),
        };

        let backends = Arc::new(FakeBackendFactory::new());
        let settings = Arc::new(MemorySettings::new());
        let prompter = Arc::new(ScriptedPrompter::new());
        let guest_api = Arc::new(FakeGuestApi::new());
        let prerequisite = Arc::new(self.prerequisite);

        let projects_dir = std::fs::canonicalize(&projects_dir).unwrap();
        if self.store_projects_dir {
            settings.put(PROJECTS_DIR_KEY, projects_dir.to_string_lossy().into_owned());
        }

        let layout = WorkshopLayout::new(home, resources);
        let controller = LifecycleController::new(
            config,
            layout,
            Collaborators {
                backends: backends.clone(),
                settings: settings.clone(),
                prompter: prompter.clone(),
                guest_api: guest_api.clone(),
                prerequisite: prerequisite.clone(),
                mount_scope: MountScope::new(&user_home),
                host: HostResources {
                    cpus: 8,
                    memory_bytes: 16 * 1024 * 1024 * 1024,
                },
            },
        );

        TestContext {
            controller,
            backends,
            settings,
            prompter,
            guest_api,
            prerequisite,
            projects_dir,
            user_home: std::fs::canonicalize(&user_home).unwrap(),
            _temp_dir: temp_dir,
        }
    }
}

pub use workshop_shared::constants::settings::PROJECTS_DIR as PROJECTS_DIR_KEY;

/// Controller wired to fakes inside a temporary home.
pub struct TestContext {
    pub controller: LifecycleController,
    pub backends: Arc<FakeBackendFactory>,
    pub settings: Arc<MemorySettings>,
    pub prompter: Arc<ScriptedPrompter>,
    pub guest_api: Arc<FakeGuestApi>,
    pub prerequisite: Arc<StaticPrerequisite>,
    /// Valid projects directory inside the mount scope.
    pub projects_dir: PathBuf,
    /// Root of the mount scope.
    pub user_home: PathBuf,
    _temp_dir: TempDir,
}

impl TestContext {
    pub fn builder() -> TestContextBuilder {
        TestContextBuilder {
            prerequisite: StaticPrerequisite::present(),
            store_projects_dir: true,
            relay_upstream: None,
            config: ControllerConfig {
                stop_timeout: Duration::from_millis(500),
                short_stop_timeout: Duration::from_millis(200),
                reset_stop_timeout: Duration::from_millis(100),
                ..ControllerConfig::default()
            },
        }
    }

    pub async fn new() -> Self {
        Self::builder().build().await
    }

    /// Wait for the controller to reach `status`.
    pub async fn wait_for_status(&self, status: Status) -> bool {
        let controller = self.controller.clone();
        wait_until(Duration::from_secs(2), move || controller.status() == status).await
    }

    /// Start, then wait for the guest to report RUNNING.
    pub async fn start_running(&self) {
        self.controller.start().await.expect("start failed");
        assert!(
            self.wait_for_status(Status::Running).await,
            "guest never reported RUNNING, status is {}",
            self.controller.status()
        );
    }
}

/// Drain a status subscription into a list without waiting.
pub fn drain_statuses(rx: &mut broadcast::Receiver<Status>) -> Vec<Status> {
    let mut seen = Vec::new();
    while let Ok(status) = rx.try_recv() {
        seen.push(status);
    }
    seen
}
