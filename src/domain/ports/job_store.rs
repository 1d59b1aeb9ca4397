//! Job store port.

use async_trait::async_trait;

use crate::domain::error::ReconcileError;
use crate::domain::models::{EntityHolder, Task};

/// Durable persistence driver for tasks and job trees.
///
/// Every call returns only after the write is durably acknowledged; the
/// reconciliation engine wraps calls in `store_update_timeout_ms`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn store_task(&self, task: &Task) -> Result<(), ReconcileError>;

    /// Replace a task record, e.g. on a state change.
    async fn replace_task(&self, old: &Task, new: &Task) -> Result<(), ReconcileError>;

    async fn remove_task(&self, task_id: &str) -> Result<(), ReconcileError>;

    /// Persist the root entity (job-level fields).
    async fn update_job(&self, holder: &EntityHolder) -> Result<(), ReconcileError>;
}
