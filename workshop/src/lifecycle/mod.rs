//! VM lifecycle: status model, command generations and the controller.

mod controller;
mod generation;
mod status;

pub use controller::{Collaborators, LifecycleController};
pub use generation::{CommandToken, GenerationCounter};
pub use status::{Status, StatusBroadcaster};
