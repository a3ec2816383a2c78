//! Configuration for the workshop launcher.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use dirs::home_dir;
use serde::{Deserialize, Serialize};
use workshop_shared::constants::{machine, network, timeouts};
use workshop_shared::errors::{WorkshopError, WorkshopResult};

use crate::backend::BackendKind;
use crate::relay::RelayConfig;
use crate::runtime::layout::dirs as const_dirs;

/// Environment variables read by [`WorkshopOptions::default`].
pub mod envs {
    /// Overrides the workshop home directory.
    pub const WORKSHOP_HOME: &str = "WORKSHOP_HOME";

    /// Directory holding the bundled base images and tools.
    pub const WORKSHOP_RESOURCES_DIR: &str = "WORKSHOP_RESOURCES_DIR";
}

/// Launcher configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkshopOptions {
    /// `~/.workshop` unless `WORKSHOP_HOME` is set.
    pub home_dir: PathBuf,
    /// Bundled resources; defaults to `<home>/resources`.
    pub resources_dir: PathBuf,
    pub machine_name: String,
    pub backend: BackendKind,
    pub relay_listen: SocketAddr,
    pub relay_upstream: SocketAddr,
    /// Remote API base. Only `/local` guest calls are made without one.
    #[serde(default)]
    pub api_base: Option<String>,
    pub local_api_base: String,
    pub stop_timeout_ms: u64,
    pub short_stop_timeout_ms: u64,
    pub reset_stop_timeout_ms: u64,
    pub relay_drain_ms: u64,
}

impl Default for WorkshopOptions {
    fn default() -> Self {
        let home_dir = std::env::var(envs::WORKSHOP_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
                path.push(const_dirs::WORKSHOP_DIR);
                path
            });
        let resources_dir = std::env::var(envs::WORKSHOP_RESOURCES_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir.join(const_dirs::RESOURCES_DIR));

        Self {
            home_dir,
            resources_dir,
            machine_name: machine::DEFAULT_NAME.to_string(),
            backend: BackendKind::for_host(),
            relay_listen: SocketAddr::from(([127, 0, 0, 1], network::RELAY_PORT)),
            relay_upstream: SocketAddr::from(([127, 0, 0, 1], network::GUEST_SERVICE_HOST_PORT)),
            api_base: None,
            local_api_base: network::LOCAL_API_BASE.to_string(),
            stop_timeout_ms: timeouts::STOP_MS,
            short_stop_timeout_ms: timeouts::SHORT_STOP_MS,
            reset_stop_timeout_ms: timeouts::RESET_STOP_MS,
            relay_drain_ms: timeouts::RELAY_DRAIN_MS,
        }
    }
}

impl WorkshopOptions {
    /// Reject values the controller cannot work with.
    pub fn validate(&self) -> WorkshopResult<()> {
        if self.machine_name.is_empty()
            || !self
                .machine_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(WorkshopError::Config(format!(
                "invalid machine name '{}': use letters, digits, '-' and '_'",
                self.machine_name
            )));
        }
        if self.short_stop_timeout_ms == 0 || self.stop_timeout_ms < self.short_stop_timeout_ms {
            return Err(WorkshopError::Config(format!(
                "stop timeout ({}ms) must be at least the short stop timeout ({}ms), which must be non-zero",
                self.stop_timeout_ms, self.short_stop_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            machine_name: self.machine_name.clone(),
            backend: self.backend,
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            short_stop_timeout: Duration::from_millis(self.short_stop_timeout_ms),
            reset_stop_timeout: Duration::from_millis(self.reset_stop_timeout_ms),
            relay: RelayConfig {
                listen: self.relay_listen,
                upstream: self.relay_upstream,
                drain_grace: Duration::from_millis(self.relay_drain_ms),
            },
        }
    }
}

/// Lifecycle timings and wiring used by the controller.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub machine_name: String,
    pub backend: BackendKind,
    /// Full graceful stop window.
    pub stop_timeout: Duration,
    /// Forced stop window when graceful lost or the guest never booted.
    pub short_stop_timeout: Duration,
    /// Stop window for a reset restart.
    pub reset_stop_timeout: Duration,
    pub relay: RelayConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        WorkshopOptions::default().controller_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let config = ControllerConfig::default();
        assert_eq!(config.stop_timeout, Duration::from_secs(30));
        assert_eq!(config.short_stop_timeout, Duration::from_secs(3));
        assert_eq!(config.reset_stop_timeout, Duration::from_secs(1));
        assert_eq!(config.relay.drain_grace, Duration::from_secs(1));
        assert_eq!(config.relay.listen.port(), 443);
        assert_eq!(config.relay.upstream.port(), 44452);
    }

    #[test]
    fn test_defaults_validate() {
        WorkshopOptions::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_machine_name() {
        let options = WorkshopOptions {
            machine_name: "../etc".into(),
            ..WorkshopOptions::default()
        };
        assert!(matches!(options.validate(), Err(WorkshopError::Config(_))));
    }

    #[test]
    fn test_stop_shorter_than_short_stop_rejected() {
        let options = WorkshopOptions {
            stop_timeout_ms: 100,
            short_stop_timeout_ms: 3000,
            ..WorkshopOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_options_serde_round_trip() {
        let options = WorkshopOptions::default();
        let json = serde_json::to_string(&options).unwrap();
        let back: WorkshopOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.machine_name, options.machine_name);
        assert_eq!(back.backend, options.backend);
    }
}
