//! Domain layer: core models, ports, and typed errors.

pub mod error;
pub mod models;
pub mod ports;

pub use error::{ReconcileError, SchedulerError};
