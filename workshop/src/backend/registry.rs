//! Backend registry using the inventory pattern for compile-time registration.
//!
//! Backend implementations register themselves with `inventory::submit!`.

use std::sync::Arc;

use crate::backend::{BackendKind, BackendOptions, VmBackend};
use workshop_shared::errors::{WorkshopError, WorkshopResult};

/// Type alias for backend factory functions.
pub type BackendFactoryFn = fn(BackendOptions) -> WorkshopResult<Arc<dyn VmBackend>>;

/// Registration entry submitted by backend implementations via inventory.
pub struct BackendRegistration {
    pub kind: BackendKind,
    pub factory: BackendFactoryFn,
}

inventory::collect!(BackendRegistration);

/// Create a backend by looking up the registered factory for `kind`.
///
/// # Errors
/// `WorkshopError::Unsupported` when no backend of that kind was compiled in.
pub fn create_backend(
    kind: BackendKind,
    options: BackendOptions,
) -> WorkshopResult<Arc<dyn VmBackend>> {
    for registration in inventory::iter::<BackendRegistration> {
        if registration.kind == kind {
            tracing::debug!(backend = %kind, name = %options.name, "Creating backend instance");
            return (registration.factory)(options);
        }
    }

    Err(WorkshopError::Unsupported(format!(
        "Backend {} is not registered. Available backends: {:?}",
        kind,
        available_backends()
    )))
}

/// Check if a backend kind is registered.
pub fn is_registered(kind: BackendKind) -> bool {
    inventory::iter::<BackendRegistration>().any(|r| r.kind == kind)
}

/// Get a list of all registered backend kinds.
pub fn available_backends() -> Vec<BackendKind> {
    inventory::iter::<BackendRegistration>()
        .map(|r| r.kind)
        .collect()
}
