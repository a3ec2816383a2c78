//! Shared constants
//!
//! These values must agree between the controller, the backends and the
//! guest image.

/// Machine instance naming
pub mod machine {
    /// Name of the single managed machine instance
    pub const DEFAULT_NAME: &str = "workshop-vm";

    /// Prefix of bundled base image file names
    pub const IMAGE_PREFIX: &str = "noop-workshop-vm";

    /// Cloud-init identity passed to the guest
    pub const CIDATA_NAME: &str = "noop";
    pub const CIDATA_USER: &str = "noop";
}

/// Network constants
pub mod network {
    /// Externally facing port the traffic relay listens on
    pub const RELAY_PORT: u16 = 443;

    /// Host loopback port the backend forwards the guest service to
    pub const GUEST_SERVICE_HOST_PORT: u16 = 44452;

    /// Guest port of the workshop HTTPS service
    pub const GUEST_SERVICE_PORT: u16 = 443;

    /// Guest port of the inspector, exposed on all host interfaces
    pub const GUEST_INSPECTOR_PORT: u16 = 1234;

    /// Base URL of the guest-local API (`/local/...` paths)
    pub const LOCAL_API_BASE: &str = "https://workshop.local.noop.app:44452";
}

/// Guest mount points (paths inside the guest)
pub mod guest_paths {
    /// Where the user's projects directory appears in the guest
    pub const PROJECTS: &str = "/noop/projects";

    /// Where the persistent data directory appears in the guest
    pub const DATA: &str = "/noop/data";
}

/// Guest lifecycle signalling over the backend log stream
pub mod signal {
    /// Marker preceding a status name in a guest log line, e.g. `WORKSHOP_STATUS=RUNNING`
    pub const STATUS_MARKER: &str = "WORKSHOP_STATUS";
}

/// Settings keys
pub mod settings {
    /// Host directory mounted at [`super::guest_paths::PROJECTS`]
    pub const PROJECTS_DIR: &str = "workshop.projectsDir";
}

/// Lifecycle timings, in milliseconds
pub mod timeouts {
    /// Full graceful stop window
    pub const STOP_MS: u64 = 30_000;

    /// Forced stop window used when the graceful path lost or the guest never booted
    pub const SHORT_STOP_MS: u64 = 3_000;

    /// Stop window used by a reset restart
    pub const RESET_STOP_MS: u64 = 1_000;

    /// Per-connection drain window during relay shutdown
    pub const RELAY_DRAIN_MS: u64 = 1_000;
}
