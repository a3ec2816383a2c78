//! Workshop Shared - Code shared by the launcher library and its front-ends
//!
//! This crate contains the error type and the constants that must agree
//! between the controller, the backends and the command-line front-end.

pub mod constants;
pub mod errors;

pub use errors::{WorkshopError, WorkshopResult};
