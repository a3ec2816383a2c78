//! Workshop VM launcher core.
//!
//! Boots a single local workshop VM through a platform backend (Lima on
//! macOS and Linux, WSL on Windows), forwards the guest's lifecycle signals
//! into a [`Status`] stream, and relays host TCP traffic into the guest.

pub mod api;
pub mod backend;
pub mod host;
pub mod lifecycle;
pub mod prompt;
pub mod relay;
pub mod runtime;
pub mod settings;
pub mod util;
pub mod watchers;

pub use backend::{BackendKind, VmBackend};
pub use lifecycle::{Collaborators, LifecycleController, Status};
pub use relay::{RelayConfig, TrafficRelay};
pub use runtime::{WorkshopLayout, WorkshopOptions};
pub use workshop_shared::constants;
pub use workshop_shared::{WorkshopError, WorkshopResult};
