//! In-memory job store.
//!
//! Backs tests and the single-node demo wiring. Supports scripted latency
//! and failure injection so store-timeout paths can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::error::ReconcileError;
use crate::domain::models::{EntityHolder, Task};
use crate::domain::ports::JobStore;

/// Job store keeping everything in process memory.
#[derive(Default)]
pub struct InMemoryJobStore {
    tasks: Mutex<HashMap<String, Task>>,
    jobs: Mutex<HashMap<String, EntityHolder>>,
    /// Artificial delay applied to every write, for timeout testing.
    write_delay_ms: AtomicU64,
    /// When set, every write fails with `StoreUnavailable`.
    fail_writes: std::sync::atomic::AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_write_delay(&self, delay: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks
            .lock()
            .expect("store lock poisoned")
            .get(task_id)
            .cloned()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().expect("store lock poisoned").len()
    }

    async fn gate(&self) -> Result<(), ReconcileError> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ReconcileError::StoreUnavailable(
                "injected store failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn store_task(&self, task: &Task) -> Result<(), ReconcileError> {
        self.gate().await?;
        self.tasks
            .lock()
            .expect("store lock poisoned")
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn replace_task(&self, _old: &Task, new: &Task) -> Result<(), ReconcileError> {
        self.gate().await?;
        self.tasks
            .lock()
            .expect("store lock poisoned")
            .insert(new.id.clone(), new.clone());
        Ok(())
    }

    async fn remove_task(&self, task_id: &str) -> Result<(), ReconcileError> {
        self.gate().await?;
        self.tasks.lock().expect("store lock poisoned").remove(task_id);
        Ok(())
    }

    async fn update_job(&self, holder: &EntityHolder) -> Result<(), ReconcileError> {
        self.gate().await?;
        self.jobs
            .lock()
            .expect("store lock poisoned")
            .insert(holder.id.clone(), holder.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ResourceSet;

    #[tokio::test]
    async fn test_store_and_replace() {
        let store = InMemoryJobStore::new();
        let task = Task::new("t-1", "job-1", ResourceSet::cpu_mem(1.0, 256));
        store.store_task(&task).await.unwrap();
        assert_eq!(store.task_count(), 1);

        let mut updated = task.clone();
        updated
            .transition_to(crate::domain::models::TaskState::Queued)
            .unwrap();
        store.replace_task(&task, &updated).await.unwrap();
        assert_eq!(
            store.task("t-1").unwrap().state,
            crate::domain::models::TaskState::Queued
        );

        store.remove_task("t-1").await.unwrap();
        assert_eq!(store.task_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = InMemoryJobStore::new();
        store.set_fail_writes(true);
        let task = Task::new("t-1", "job-1", ResourceSet::cpu_mem(1.0, 256));
        assert!(matches!(
            store.store_task(&task).await,
            Err(ReconcileError::StoreUnavailable(_))
        ));
    }
}
