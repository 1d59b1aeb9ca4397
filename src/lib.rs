//! Flotilla - container-job scheduling core
//!
//! The two tightly coupled subsystems of a multi-tenant compute-fleet
//! control plane:
//! - A placement engine matching a tiered task queue against time-limited
//!   resource offers, with hard constraints, soft fitness, per-capacity-group
//!   SLAs, and cluster autoscaling.
//! - A reconciliation framework keeping three models per job (Reference,
//!   Running, Store) in agreement under concurrent change requests,
//!   asynchronous lifecycle events, and persistence failures.
//!
//! Everything else (stores, offer protocol, cluster management, health
//! monitoring) is an external collaborator behind a port trait; in-memory
//! adapters live under [`adapters`].

pub mod adapters;
pub mod daemon;
pub mod domain;
pub mod infrastructure;
pub mod reconciler;
pub mod scheduler;

pub use domain::{ReconcileError, SchedulerError};
pub use infrastructure::{Config, ConfigLoader};
