//! Workshop VM lifecycle controller.
//!
//! Orchestrates the backend, the traffic relay and the directory prompt
//! through `start`, `stop`, `restart` and `quit`. Every public command takes a
//! fresh [`CommandToken`]; a command that has been superseded stops at its next
//! step and returns quietly, and only the current command may publish status.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use workshop_shared::constants::{guest_paths, network, settings as setting_keys};
use workshop_shared::errors::{WorkshopError, WorkshopResult};

use crate::api::{ApiClient, ApiConfig, GuestApi};
use crate::backend::{
    BackendFactory, BackendOptions, GuestEvent, GuestEventSource, LogSignalSource, MachineParams,
    Mount, PortForward, RegisteredBackends, VmBackend,
};
use crate::host::{HostPrerequisite, HostResources, host_prerequisite};
use crate::lifecycle::generation::{CommandToken, GenerationCounter};
use crate::lifecycle::status::{Status, StatusBroadcaster};
use crate::prompt::{InvalidMountDir, MountScope, Prompter};
use crate::relay::TrafficRelay;
use crate::runtime::{BootDisk, ControllerConfig, WorkshopLayout, WorkshopOptions, guest_arch};
use crate::settings::{FileSettings, SettingsStore};

/// External collaborators the controller drives.
pub struct Collaborators {
    pub backends: Arc<dyn BackendFactory>,
    pub settings: Arc<dyn SettingsStore>,
    pub prompter: Arc<dyn Prompter>,
    pub guest_api: Arc<dyn GuestApi>,
    pub prerequisite: Arc<dyn HostPrerequisite>,
    /// Where the projects directory may be chosen from.
    pub mount_scope: MountScope,
    pub host: HostResources,
}

impl Collaborators {
    /// Production wiring for this host.
    pub fn for_host(
        options: &WorkshopOptions,
        layout: &WorkshopLayout,
        prompter: Arc<dyn Prompter>,
    ) -> WorkshopResult<Self> {
        let guest_api = ApiClient::new(ApiConfig {
            api_base: options.api_base.clone(),
            local_base: options.local_api_base.clone(),
            ..ApiConfig::default()
        })?;

        Ok(Self {
            backends: Arc::new(RegisteredBackends),
            settings: Arc::new(FileSettings::new(layout.settings_file())),
            prompter,
            guest_api: Arc::new(guest_api),
            prerequisite: host_prerequisite(),
            mount_scope: MountScope::user_home(),
            host: HostResources::discover(),
        })
    }
}

#[derive(Default)]
struct ControllerState {
    backend: Option<Arc<dyn VmBackend>>,
    relay: Option<TrafficRelay>,
    forwarder: Option<JoinHandle<()>>,
    boot_disk: Option<BootDisk>,
    /// The guest has reported RUNNING for the held backend.
    booted: bool,
    restart_armed: bool,
    restarting: bool,
    quitting: bool,
}

/// Resources taken out of the state by a stop.
struct Held {
    backend: Option<Arc<dyn VmBackend>>,
    relay: Option<TrafficRelay>,
    forwarder: Option<JoinHandle<()>>,
    boot_disk: Option<BootDisk>,
    booted: bool,
}

struct ControllerInner {
    config: ControllerConfig,
    layout: WorkshopLayout,
    collaborators: Collaborators,
    status: StatusBroadcaster,
    generations: GenerationCounter,
    state: Mutex<ControllerState>,
}

/// Handle to the process-wide controller. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<ControllerInner>,
}

impl LifecycleController {
    pub fn new(config: ControllerConfig, layout: WorkshopLayout, collaborators: Collaborators) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                config,
                layout,
                collaborators,
                status: StatusBroadcaster::new(),
                generations: GenerationCounter::new(),
                state: Mutex::new(ControllerState::default()),
            }),
        }
    }

    /// Controller wired to the real backends, settings file and guest API.
    pub fn from_options(options: &WorkshopOptions, prompter: Arc<dyn Prompter>) -> WorkshopResult<Self> {
        options.validate()?;
        let layout = options.layout();
        let collaborators = Collaborators::for_host(options, &layout, prompter)?;
        Ok(Self::new(options.controller_config(), layout, collaborators))
    }

    pub fn status(&self) -> Status {
        self.inner.status.current()
    }

    /// Receive every status change from now on. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<Status> {
        self.inner.status.subscribe()
    }

    /// Re-emit the current status for subscribers that joined late.
    pub fn resync(&self) -> Status {
        self.inner.status.resync()
    }

    /// Address the traffic relay is bound to, while it is up.
    pub fn relay_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.state.lock().relay.as_ref().map(|relay| relay.local_addr())
    }

    /// Open relay connection halves (0 when the relay is down).
    pub fn relay_connections(&self) -> usize {
        self.inner
            .state
            .lock()
            .relay
            .as_ref()
            .map(|relay| relay.connections())
            .unwrap_or(0)
    }

    pub fn is_restarting(&self) -> bool {
        self.inner.state.lock().restarting
    }

    pub fn is_quitting(&self) -> bool {
        self.inner.state.lock().quitting
    }

    pub fn layout(&self) -> &WorkshopLayout {
        &self.inner.layout
    }

    /// Create and boot the machine.
    ///
    /// Returns once the backend has started and the relay is bound; the
    /// guest's own RUNNING signal arrives later through the status stream.
    ///
    /// # Errors
    /// `AlreadyRunning` when a machine instance is held. Step failures are
    /// returned only while this is still the most recent command.
    pub async fn start(&self) -> WorkshopResult<()> {
        let token = {
            let state = self.inner.state.lock();
            if state.backend.is_some() {
                return Err(WorkshopError::AlreadyRunning);
            }
            if state.quitting {
                tracing::info!("Start ignored: quitting");
                return Ok(());
            }
            self.inner.generations.issue()
        };
        tracing::info!(generation = token.generation(), "Starting workshop VM");
        let result = self.inner.start_with(&token).await;
        finish(&token, result)
    }

    /// Stop the machine, giving the guest `timeout` to shut down gracefully.
    ///
    /// The relay is always drained and closed, and the backend handle, event
    /// forwarder and boot disk are released. The machine instance is kept.
    pub async fn stop(&self, timeout: Duration) -> WorkshopResult<()> {
        let token = self.inner.generations.issue();
        tracing::info!(generation = token.generation(), ?timeout, "Stopping workshop VM");
        let result = self.inner.stop_with(&token, timeout).await.map(|_| ());
        finish(&token, result)
    }

    /// Stop with the configured graceful timeout.
    pub async fn stop_default(&self) -> WorkshopResult<()> {
        self.stop(self.inner.config.stop_timeout).await
    }

    /// Allow the next [`LifecycleController::restart`] to proceed.
    pub fn arm_restart(&self) {
        let mut state = self.inner.state.lock();
        if state.quitting {
            tracing::debug!("Restart not armed: quitting");
            return;
        }
        state.restart_armed = true;
    }

    /// Stop and start again, keeping the machine instance.
    ///
    /// A no-op unless restart was armed and no restart or quit is in flight.
    /// With `reset`, the data directory is wiped and the stored projects
    /// directory forgotten before starting.
    pub async fn restart(&self, reset: bool) -> WorkshopResult<()> {
        let token = {
            let mut state = self.inner.state.lock();
            if !state.restart_armed || state.restarting || state.quitting {
                tracing::debug!(
                    armed = state.restart_armed,
                    restarting = state.restarting,
                    quitting = state.quitting,
                    "Restart ignored"
                );
                return Ok(());
            }
            state.restart_armed = false;
            state.restarting = true;
            self.inner.generations.issue()
        };
        tracing::info!(generation = token.generation(), reset, "Restarting workshop VM");

        let result = self.inner.restart_with(&token, reset).await;
        self.inner.state.lock().restarting = false;

        let result = match result {
            Err(e) if !e.is_superseded() => Err(self.inner.fail(&token, Status::RestartFailed, e).await),
            other => other,
        };
        finish(&token, result)
    }

    /// Delete the stopped machine instance, wipe the data directory and forget
    /// the projects directory, so the next start boots a fresh disk.
    ///
    /// # Errors
    /// `AlreadyRunning` while a machine instance is held.
    pub async fn reset(&self) -> WorkshopResult<()> {
        if self.inner.state.lock().backend.is_some() {
            return Err(WorkshopError::AlreadyRunning);
        }
        self.inner.reset_machine(None).await
    }

    /// Stop and delete the machine instance. Wins over any restart.
    pub async fn quit(&self) -> WorkshopResult<()> {
        let token = {
            let mut state = self.inner.state.lock();
            state.quitting = true;
            state.restart_armed = false;
            self.inner.generations.issue()
        };
        tracing::info!(generation = token.generation(), "Quitting workshop VM");
        let result = self.inner.quit_with(&token).await;
        finish(&token, result)
    }
}

/// Errors of commands that are no longer current are swallowed.
fn finish(token: &CommandToken, result: WorkshopResult<()>) -> WorkshopResult<()> {
    match result {
        Err(e) if e.is_superseded() || !token.is_current() => {
            tracing::debug!(generation = token.generation(), "Superseded command ended: {}", e);
            Ok(())
        }
        other => other,
    }
}

impl ControllerInner {
    /// Publish `status` if `token` is current. Returns whether it was.
    fn publish_if_current(&self, token: &CommandToken, status: Status) -> bool {
        // Checked under the state lock so a newer command's publish cannot interleave.
        let _state = self.state.lock();
        if !token.is_current() {
            tracing::debug!(generation = token.generation(), %status, "Dropping stale status");
            return false;
        }
        self.status.publish(status);
        true
    }

    /// Record a failed step and hand the error back.
    async fn fail(&self, token: &CommandToken, status: Status, error: WorkshopError) -> WorkshopError {
        if error.is_superseded() {
            return error;
        }
        if self.publish_if_current(token, status) {
            tracing::error!(%status, "Lifecycle step failed: {}", error);
            if let WorkshopError::PrerequisiteMissing(detail) = &error {
                self.collaborators
                    .prompter
                    .show_error("Workshop VM cannot start", detail)
                    .await;
            }
        } else {
            tracing::debug!(%status, "Stale step failed: {}", error);
        }
        error
    }

    fn restarting(&self) -> bool {
        self.state.lock().restarting
    }

    async fn start_with(self: &Arc<Self>, token: &CommandToken) -> WorkshopResult<()> {
        // (a) platform prerequisite
        self.ensure_prerequisite(token).await?;

        // (b)
        token.ensure_current()?;
        let restarting = self.restarting();
        self.publish_if_current(token, if restarting { Status::Restarting } else { Status::Creating });

        // (c) on-disk state and boot disk
        let boot_disk = match self.prepare_boot_disk(token).await {
            Ok(path) => path,
            Err(e) => return Err(self.fail(token, Status::CreateFailed, e).await),
        };

        // (d) projects directory
        let projects_dir = match self.resolve_projects_dir(token).await {
            Ok(dir) => dir,
            Err(e) => return Err(self.fail(token, Status::CreateFailed, e).await),
        };

        // (e) machine parameters
        token.ensure_current()?;
        let params = self.machine_params(boot_disk, projects_dir);
        tracing::info!(
            cpus = params.cpus,
            memory_bytes = params.memory_bytes,
            disk = %params.boot_disk.display(),
            "Machine parameters resolved"
        );

        // (f) backend, guest events, create
        let backend = match self.attach_backend(token) {
            Ok(backend) => backend,
            Err(e) => return Err(self.fail(token, Status::CreateFailed, e).await),
        };
        let created = backend.create(&params).await;
        if !token.is_current() {
            self.release_stale_backend(&backend).await;
            return Err(WorkshopError::Superseded);
        }
        if let Err(e) = created {
            self.abandon_backend(&backend).await;
            return Err(self.fail(token, Status::CreateFailed, e).await);
        }
        let restarting = self.restarting();
        self.publish_if_current(token, if restarting { Status::Restarting } else { Status::Created });

        // (g) boot and relay
        let restarting = self.restarting();
        self.publish_if_current(token, if restarting { Status::Restarting } else { Status::Starting });
        let started = backend.start().await;
        if !token.is_current() {
            self.release_stale_backend(&backend).await;
            return Err(WorkshopError::Superseded);
        }
        if let Err(e) = started {
            self.abandon_backend(&backend).await;
            return Err(self.fail(token, Status::StartFailed, e).await);
        }
        let relay = match TrafficRelay::bind(self.config.relay.clone()).await {
            Ok(relay) => relay,
            Err(e) => {
                self.abandon_backend(&backend).await;
                return Err(self.fail(token, Status::StartFailed, e).await);
            }
        };
        let stale_relay = {
            let mut state = self.state.lock();
            if token.is_current() {
                state.relay = Some(relay);
                None
            } else {
                Some(relay)
            }
        };
        if let Some(relay) = stale_relay {
            let _ = relay.shutdown().await;
            self.release_stale_backend(&backend).await;
            return Err(WorkshopError::Superseded);
        }

        // (h) RUNNING comes from the guest.
        tracing::info!(name = %self.config.machine_name, "Workshop VM started, waiting for guest");
        Ok(())
    }

    async fn ensure_prerequisite(&self, token: &CommandToken) -> WorkshopResult<()> {
        let prerequisite = &self.collaborators.prerequisite;
        let present = match token.run(prerequisite.check()).await? {
            Ok(present) => present,
            Err(e) => return Err(self.fail(token, Status::CreateFailed, e).await),
        };
        if present {
            return Ok(());
        }

        let name = prerequisite.name().to_string();
        if !prerequisite.installable() {
            let error = WorkshopError::PrerequisiteMissing(format!(
                "{} is not available on this host",
                name
            ));
            return Err(self.fail(token, Status::CreateFailed, error).await);
        }

        let question = format!("{} is required to run the workshop VM. Install it now?", name);
        let accepted = match token.run(self.collaborators.prompter.confirm(&question)).await? {
            Ok(accepted) => accepted,
            Err(e) => return Err(self.fail(token, Status::WslInstallFailed, e).await),
        };
        if !accepted {
            let error = WorkshopError::PrerequisiteMissing(format!("{} installation declined", name));
            return Err(self.fail(token, Status::WslInstallFailed, error).await);
        }

        token.ensure_current()?;
        self.publish_if_current(token, Status::WslInstalling);
        // Installation is never abandoned halfway.
        if let Err(e) = prerequisite.install().await {
            return Err(self.fail(token, Status::WslInstallFailed, e).await);
        }
        token.ensure_current()?;
        tracing::info!(prerequisite = %name, "Prerequisite installed");
        Ok(())
    }

    /// Returns the path of the fresh boot disk, now owned by the state.
    async fn prepare_boot_disk(&self, token: &CommandToken) -> WorkshopResult<PathBuf> {
        token.ensure_current()?;
        self.layout.prepare().await?;
        let base = self
            .layout
            .base_image(self.config.backend, guest_arch())
            .await?;
        let target = self.layout.boot_disk_path(&self.config.machine_name, &base);
        let disk = BootDisk::prepare(&base, target).await?;
        let path = disk.path().to_path_buf();

        let stale = {
            let mut state = self.state.lock();
            if token.is_current() {
                // Same target path every run; the previous handle just goes away.
                state.boot_disk = Some(disk);
                None
            } else if state.boot_disk.as_ref().map(|held| held.path()) == Some(path.as_path()) {
                // A newer start owns the same file.
                None
            } else {
                Some(disk)
            }
        };
        if !token.is_current() {
            if let Some(disk) = stale {
                let _ = disk.release().await;
            }
            return Err(WorkshopError::Superseded);
        }
        Ok(path)
    }

    /// Read, validate and if needed prompt for the projects directory.
    async fn resolve_projects_dir(&self, token: &CommandToken) -> WorkshopResult<PathBuf> {
        let settings = &self.collaborators.settings;
        let scope = &self.collaborators.mount_scope;

        let stored = token.run(settings.get(setting_keys::PROJECTS_DIR)).await??;
        let mut candidate = stored.clone().map(PathBuf::from);
        let mut problem: Option<InvalidMountDir> = None;

        loop {
            if let Some(path) = candidate.take() {
                match scope.validate(&path) {
                    Ok(resolved) => {
                        token.ensure_current()?;
                        let value = resolved.to_string_lossy().into_owned();
                        if stored.as_deref() != Some(value.as_str()) {
                            token
                                .run(settings.set(setting_keys::PROJECTS_DIR, &value))
                                .await??;
                        }
                        tracing::info!(dir = %resolved.display(), "Projects directory resolved");
                        return Ok(resolved);
                    }
                    Err(reason) => {
                        tracing::warn!(dir = %path.display(), "Projects directory rejected: {}", reason);
                        problem = Some(reason);
                    }
                }
            }

            let message = match &problem {
                Some(reason) => format!("Choose your projects directory ({})", reason),
                None => "Choose the directory containing your projects".to_string(),
            };
            candidate = token
                .run(
                    self.collaborators
                        .prompter
                        .select_directory(&message, Some(scope.root())),
                )
                .await??;
            if candidate.is_none() {
                tracing::info!("Directory selection cancelled, asking again");
                problem = None;
            }
        }
    }

    fn machine_params(&self, boot_disk: PathBuf, projects_dir: PathBuf) -> MachineParams {
        let share = self.collaborators.host.guest_share();
        MachineParams {
            name: self.config.machine_name.clone(),
            arch: guest_arch().to_string(),
            cpus: share.cpus,
            memory_bytes: share.memory_bytes,
            boot_disk,
            mounts: vec![
                Mount {
                    host_path: projects_dir,
                    guest_path: guest_paths::PROJECTS.to_string(),
                    writable: false,
                },
                Mount {
                    host_path: self.layout.data_dir(),
                    guest_path: guest_paths::DATA.to_string(),
                    writable: true,
                },
            ],
            port_forwards: vec![
                PortForward {
                    guest_port: network::GUEST_INSPECTOR_PORT,
                    host_ip: "0.0.0.0".to_string(),
                    host_port: None,
                },
                PortForward {
                    guest_port: network::GUEST_SERVICE_PORT,
                    host_ip: "127.0.0.1".to_string(),
                    host_port: Some(self.config.relay.upstream.port()),
                },
            ],
            state_dir: self.layout.machines_dir(),
        }
    }

    /// Instantiate the backend and start forwarding its guest events.
    fn attach_backend(self: &Arc<Self>, token: &CommandToken) -> WorkshopResult<Arc<dyn VmBackend>> {
        let backend = self.fresh_backend()?;
        let events = LogSignalSource::new(backend.log_lines());

        let mut state = self.state.lock();
        token.ensure_current()?;
        if state.backend.is_some() {
            return Err(WorkshopError::AlreadyRunning);
        }
        state.backend = Some(Arc::clone(&backend));
        state.booted = false;
        let forwarder = spawn_forwarder(Arc::downgrade(self), token.clone(), events);
        if let Some(previous) = state.forwarder.replace(forwarder) {
            previous.abort();
        }
        Ok(backend)
    }

    /// Apply one guest-reported status.
    fn apply_guest_status(&self, token: &CommandToken, status: Status) {
        let mut state = self.state.lock();
        if !token.is_current() {
            tracing::debug!(%status, "Dropping guest status from stale command");
            return;
        }
        if status == Status::Running {
            if state.quitting {
                tracing::debug!("Dropping guest RUNNING while quitting");
                return;
            }
            state.booted = true;
        }
        tracing::info!(%status, "Guest reported status");
        self.status.publish(status);
    }

    /// A new adapter for the configured machine. Instances are addressed by name.
    fn fresh_backend(&self) -> WorkshopResult<Arc<dyn VmBackend>> {
        let kind = self.config.backend;
        self.collaborators.backends.create(
            kind,
            BackendOptions {
                name: self.config.machine_name.clone(),
                tools_dir: self.layout.tools_dir(kind),
                state_dir: self.layout.machines_dir(),
            },
        )
    }

    /// Bring down a machine whose create or start finished after its command
    /// was superseded. Left alone when a newer command holds a backend, since
    /// that command owns the instance now.
    async fn release_stale_backend(&self, backend: &Arc<dyn VmBackend>) {
        if self.state.lock().backend.is_some() {
            tracing::debug!("Superseded boot left to the command holding the machine");
            return;
        }
        tracing::info!(name = %backend.name(), "Stopping machine booted by a superseded command");
        if let Err(e) = self.force_stop(backend.as_ref()).await {
            tracing::warn!("Failed to stop superseded machine: {}", e);
        }
    }

    /// Drop the handle of a backend whose create or start failed, forcing the
    /// machine down, so that `start()` can be invoked again.
    async fn abandon_backend(&self, backend: &Arc<dyn VmBackend>) {
        let forwarder = {
            let mut state = self.state.lock();
            if !state
                .backend
                .as_ref()
                .is_some_and(|held| Arc::ptr_eq(held, backend))
            {
                return;
            }
            state.backend = None;
            state.booted = false;
            state.forwarder.take()
        };
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if let Err(e) = self.force_stop(backend.as_ref()).await {
            tracing::warn!("Failed to stop machine after failed boot: {}", e);
        }
    }

    /// Delete the instance and the persistent data so the next create starts
    /// from a fresh copy of the base image.
    async fn reset_machine(&self, held: Option<Arc<dyn VmBackend>>) -> WorkshopResult<()> {
        let backend = match held {
            Some(backend) => backend,
            None => self.fresh_backend()?,
        };
        backend.delete().await?;
        self.layout.wipe_data_dir().await?;
        self.collaborators
            .settings
            .delete(setting_keys::PROJECTS_DIR)
            .await?;
        tracing::info!(name = %self.config.machine_name, "Workshop VM reset");
        Ok(())
    }

    fn take_held(&self) -> Held {
        let mut state = self.state.lock();
        Held {
            backend: state.backend.take(),
            relay: state.relay.take(),
            forwarder: state.forwarder.take(),
            boot_disk: state.boot_disk.take(),
            booted: std::mem::take(&mut state.booted),
        }
    }

    /// Tear everything down. Returns the backend that was held, if any.
    async fn stop_with(
        &self,
        token: &CommandToken,
        timeout: Duration,
    ) -> WorkshopResult<Option<Arc<dyn VmBackend>>> {
        self.publish_if_current(token, Status::Stopping);
        let Held {
            backend,
            relay,
            forwarder,
            boot_disk,
            booted,
        } = self.take_held();

        let relay_down = async move {
            if let Some(relay) = relay
                && let Err(e) = relay.shutdown().await
            {
                tracing::warn!("Relay teardown reported errors: {}", e);
            }
        };
        let held_backend = backend.clone();
        let backend_down = async move {
            match held_backend {
                Some(backend) => self.shutdown_backend(backend.as_ref(), booted, timeout).await,
                None => Ok(()),
            }
        };
        let ((), backend_result) = tokio::join!(relay_down, backend_down);

        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if let Some(disk) = boot_disk {
            // A start that overtook this stop may have copied a fresh disk to the same path.
            let reused = self
                .state
                .lock()
                .boot_disk
                .as_ref()
                .is_some_and(|held| held.path() == disk.path());
            if !reused && let Err(e) = disk.release().await {
                tracing::warn!("Failed to release boot disk: {}", e);
            }
        }

        if let Err(e) = backend_result {
            // The machine may still be up; keep the handle for another stop or quit.
            if let Some(backend) = backend {
                let mut state = self.state.lock();
                if state.backend.is_none() {
                    state.backend = Some(backend);
                }
            }
            return Err(self.fail(token, Status::StopFailed, e).await);
        }

        self.publish_if_current(token, Status::Stopped);
        tracing::info!("Workshop VM stopped");
        Ok(backend)
    }

    async fn shutdown_backend(
        &self,
        backend: &dyn VmBackend,
        booted: bool,
        timeout: Duration,
    ) -> WorkshopResult<()> {
        if booted {
            let graceful = async {
                self.collaborators.guest_api.request_stop().await?;
                backend.stop(timeout).await
            };
            match tokio::time::timeout(timeout, graceful).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => tracing::warn!("Graceful stop failed, forcing: {}", e),
                Err(_) => tracing::warn!(?timeout, "Graceful stop timed out, forcing"),
            }
        }
        self.force_stop(backend).await
    }

    /// Short stop, then kill.
    async fn force_stop(&self, backend: &dyn VmBackend) -> WorkshopResult<()> {
        let short = self.config.short_stop_timeout;
        match tokio::time::timeout(short, backend.stop(short)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!("Short stop failed, killing: {}", e);
                backend.kill().await
            }
            Err(_) => {
                tracing::warn!(?short, "Short stop timed out, killing");
                backend.kill().await
            }
        }
    }

    async fn restart_with(self: &Arc<Self>, token: &CommandToken, reset: bool) -> WorkshopResult<()> {
        let timeout = if reset {
            self.config.reset_stop_timeout
        } else {
            self.config.stop_timeout
        };
        let held = self.stop_with(token, timeout).await?;

        if self.state.lock().quitting {
            tracing::info!("Restart abandoned: quitting");
            return Err(WorkshopError::Superseded);
        }
        token.ensure_current()?;

        if reset {
            self.reset_machine(held).await?;
            token.ensure_current()?;
        }

        self.start_with(token).await
    }

    async fn quit_with(&self, token: &CommandToken) -> WorkshopResult<()> {
        let stopped = self.stop_with(token, self.config.stop_timeout).await;
        let (held, stop_error) = match stopped {
            Ok(held) => (held, None),
            Err(e) => (self.state.lock().backend.take(), Some(e)),
        };

        // Deletion goes by name, so a fresh adapter works when none is held.
        let backend = match held {
            Some(backend) => backend,
            None => match self.fresh_backend() {
                Ok(backend) => backend,
                Err(e) => return Err(self.fail(token, Status::DeleteFailed, e).await),
            },
        };

        self.publish_if_current(token, Status::Deleting);
        if let Err(e) = backend.delete().await {
            return Err(self.fail(token, Status::DeleteFailed, e).await);
        }
        self.publish_if_current(token, Status::Deleted);
        tracing::info!(name = %self.config.machine_name, "Workshop VM deleted");

        match stop_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn spawn_forwarder(
    inner: Weak<ControllerInner>,
    token: CommandToken,
    mut events: LogSignalSource,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(GuestEvent::Status(status)) = events.next_event().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.apply_guest_status(&token, status);
        }
        tracing::trace!(generation = token.generation(), "Guest event forwarder finished");
    })
}
