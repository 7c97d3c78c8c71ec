//! Nebula daemon process management
//!
//! - [`ProcessController`] spawns the daemon, stops it and checks liveness
//! - [`Reconciler`] runs the liveness check on an interval
//! - [`LogBuffer`] keeps recent daemon output

pub mod controller;
pub mod log_buffer;
pub mod reconciler;

pub use controller::{daemon_version, ProcessController, Reconciled};
pub use log_buffer::LogBuffer;
pub use reconciler::Reconciler;
