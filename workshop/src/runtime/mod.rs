//! Launcher configuration and on-disk layout.

pub mod layout;
pub mod options;

pub use layout::{BootDisk, WorkshopLayout, guest_arch};
pub use options::{ControllerConfig, WorkshopOptions};

impl WorkshopOptions {
    pub fn layout(&self) -> WorkshopLayout {
        WorkshopLayout::new(self.home_dir.clone(), self.resources_dir.clone())
    }
}
