//! Concrete change actions over a job's task tree.
//!
//! External actions originate from the job subsystem or the placement
//! engine; reconciler actions are synthesized by the engine from the
//! Running-vs-Reference and Running-vs-Store diffs. Store-targeting updates
//! are produced only after the store driver acknowledged the write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::error::ReconcileError;
use crate::domain::models::{EntityPayload, ModelKind, Task, TaskState};
use crate::domain::ports::{JobStore, OfferSource};

use super::actions::{
    ChangeAction, ChangeFailure, ChangeResult, EntityPath, ModelOp, ModelSet, ModelUpdateAction,
};

/// Root-holder tag marking a task that must be killed; the value is the
/// kill reason.
pub fn broken_tag(task_id: &str) -> String {
    format!("broken:{task_id}")
}

/// Root-holder tag carrying the retry state of a reconciler action.
pub fn retryer_tag(action_key: &str) -> String {
    format!("retryer:{action_key}")
}

/// Notifications to the surrounding system as the reconciler moves tasks
/// through their lives. The default implementation ignores everything.
pub trait TaskLifecycleListener: Send + Sync {
    /// An Accepted task should enter the placement queue.
    fn task_needs_placement(&self, _task: &Task) {}
    fn task_killed(&self, _task: &Task, _reason: &str) {}
    fn task_finished(&self, _task: &Task) {}
}

/// Listener that does nothing.
pub struct NoopLifecycleListener;

impl TaskLifecycleListener for NoopLifecycleListener {}

#[allow(clippy::cast_possible_truncation)]
async fn store_write<F>(write: F, timeout: Duration) -> Result<(), ReconcileError>
where
    F: std::future::Future<Output = Result<(), ReconcileError>>,
{
    match tokio::time::timeout(timeout, write).await {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::StoreTimeout {
            elapsed_ms: timeout.as_millis() as u64,
        }),
    }
}

/// External: add a task to the job (e.g. a new service task). The task is
/// persisted before it becomes visible in Reference.
pub struct AddTaskAction {
    pub task: Task,
    pub store: Arc<dyn JobStore>,
    pub store_timeout: Duration,
}

#[async_trait]
impl ChangeAction for AddTaskAction {
    fn summary(&self) -> String {
        format!("add task {}", self.task.id)
    }

    async fn execute(&self, models: ModelSet) -> ChangeResult {
        if let Err(reason) = self.task.validate() {
            return Err(ChangeFailure::new(ReconcileError::InvalidInput(reason)));
        }
        if models.reference.child(&self.task.id).is_some() {
            return Err(ChangeFailure::new(ReconcileError::InvalidInput(format!(
                "task {} already exists",
                self.task.id
            ))));
        }
        store_write(self.store.store_task(&self.task), self.store_timeout)
            .await
            .map_err(ChangeFailure::new)?;

        let root_id = models.reference.id.clone();
        let path = EntityPath::child(&root_id, &self.task.id);
        Ok(vec![
            ModelUpdateAction::new(
                ModelKind::Reference,
                path.clone(),
                ModelOp::Add {
                    payload: EntityPayload::Task(self.task.clone()),
                },
            ),
            ModelUpdateAction::new(
                ModelKind::Store,
                path,
                ModelOp::Add {
                    payload: EntityPayload::Task(self.task.clone()),
                },
            ),
        ])
    }
}

/// External, invoked by the launch path: record a placement on an agent.
///
/// The Reference and Running trees move to Launched and the new state is
/// persisted. On a store timeout the change fails and the compensating
/// update tags the task broken-for-kill so the reconciler kills it.
pub struct TaskLaunchedAction {
    pub task_id: String,
    pub agent_id: String,
    pub store: Arc<dyn JobStore>,
    pub store_timeout: Duration,
}

#[async_trait]
impl ChangeAction for TaskLaunchedAction {
    fn summary(&self) -> String {
        format!("launch task {} on {}", self.task_id, self.agent_id)
    }

    async fn execute(&self, models: ModelSet) -> ChangeResult {
        let root_id = models.reference.id.clone();
        let Some(current) = models
            .reference
            .child(&self.task_id)
            .and_then(|c| c.payload.as_task())
        else {
            return Err(ChangeFailure::new(ReconcileError::InvalidInput(format!(
                "task {} not in reference model",
                self.task_id
            ))));
        };

        let mut launched = current.clone();
        if launched.state == TaskState::Accepted {
            launched
                .transition_to(TaskState::Queued)
                .map_err(|e| ChangeFailure::new(ReconcileError::InvalidInput(e)))?;
        }
        launched
            .mark_launched(self.agent_id.clone())
            .map_err(|e| ChangeFailure::new(ReconcileError::InvalidInput(e)))?;

        let path = EntityPath::child(&root_id, &self.task_id);
        if let Err(error) =
            store_write(self.store.replace_task(current, &launched), self.store_timeout).await
        {
            // Roll the launch back by marking the task for kill; the diff
            // picks it up on the next trigger.
            debug!(task_id = %self.task_id, %error, "launch persistence failed");
            return Err(ChangeFailure::new(error).with_compensating(vec![
                ModelUpdateAction::new(
                    ModelKind::Reference,
                    EntityPath::root(&root_id),
                    ModelOp::Tag {
                        key: broken_tag(&self.task_id),
                        value: Some(serde_json::json!("store update timeout")),
                    },
                ),
                ModelUpdateAction::new(
                    ModelKind::Running,
                    path,
                    ModelOp::Add {
                        payload: EntityPayload::Task(launched),
                    },
                ),
            ]));
        }

        Ok(vec![
            ModelUpdateAction::new(
                ModelKind::Reference,
                path.clone(),
                ModelOp::Update {
                    payload: EntityPayload::Task(launched.clone()),
                },
            ),
            ModelUpdateAction::new(
                ModelKind::Running,
                path.clone(),
                ModelOp::Add {
                    payload: EntityPayload::Task(launched.clone()),
                },
            ),
            ModelUpdateAction::new(
                ModelKind::Store,
                path,
                ModelOp::Update {
                    payload: EntityPayload::Task(launched),
                },
            ),
        ])
    }
}

/// External: an agent reported a task state change (start initiated,
/// started, finished). Only the Running tree moves; persistence of terminal
/// states is the reconciler's job.
pub struct RecordTaskStateAction {
    pub task_id: String,
    pub state: TaskState,
}

#[async_trait]
impl ChangeAction for RecordTaskStateAction {
    fn summary(&self) -> String {
        format!("task {} -> {}", self.task_id, self.state.as_str())
    }

    async fn execute(&self, models: ModelSet) -> ChangeResult {
        let root_id = models.running.id.clone();
        let Some(current) = models
            .running
            .child(&self.task_id)
            .and_then(|c| c.payload.as_task())
        else {
            return Err(ChangeFailure::new(ReconcileError::InvalidInput(format!(
                "task {} not in running model",
                self.task_id
            ))));
        };
        let mut updated = current.clone();
        updated
            .transition_to(self.state)
            .map_err(|e| ChangeFailure::new(ReconcileError::InvalidInput(e)))?;

        Ok(vec![ModelUpdateAction::new(
            ModelKind::Running,
            EntityPath::child(&root_id, &self.task_id),
            ModelOp::Update {
                payload: EntityPayload::Task(updated),
            },
        )])
    }
}

/// Kill a task: dispatched externally (user kill) or synthesized by the
/// reconciler for broken tasks. A task that never reached an agent is
/// finished outright; a placed task moves to KillInitiated and the kill is
/// sent to the offer source.
pub struct KillTaskAction {
    pub task_id: String,
    pub reason: String,
    pub offer_source: Arc<dyn OfferSource>,
    pub listener: Arc<dyn TaskLifecycleListener>,
}

#[async_trait]
impl ChangeAction for KillTaskAction {
    fn summary(&self) -> String {
        format!("kill task {} ({})", self.task_id, self.reason)
    }

    async fn execute(&self, models: ModelSet) -> ChangeResult {
        let root_id = models.reference.id.clone();
        let clear_broken = ModelUpdateAction::new(
            ModelKind::Reference,
            EntityPath::root(&root_id),
            ModelOp::Tag {
                key: broken_tag(&self.task_id),
                value: None,
            },
        );
        let Some(reference) = models
            .reference
            .child(&self.task_id)
            .and_then(|c| c.payload.as_task())
            .cloned()
        else {
            // Task already gone: nothing to kill, just clear the marker.
            return Ok(vec![clear_broken]);
        };
        // Placement is judged by what is actually observed: a rolled-back
        // launch leaves Reference behind while Running shows the container.
        let observed = models
            .running
            .child(&self.task_id)
            .and_then(|c| c.payload.as_task())
            .cloned()
            .unwrap_or_else(|| reference.clone());
        if reference.is_terminal() && observed.is_terminal() {
            return Ok(vec![clear_broken]);
        }

        let path = EntityPath::child(&root_id, &self.task_id);
        let mut updates = vec![clear_broken];

        if observed.state.is_placed() {
            let agent_id = observed.agent_id.clone().unwrap_or_default();
            self.offer_source
                .kill_task(&self.task_id, &agent_id, &self.reason)
                .await;
            let mut killing = observed.clone();
            if killing.state != TaskState::KillInitiated {
                killing
                    .transition_to(TaskState::KillInitiated)
                    .map_err(|e| ChangeFailure::new(ReconcileError::InvalidInput(e)))?;
            }
            updates.push(ModelUpdateAction::new(
                ModelKind::Reference,
                path.clone(),
                ModelOp::Update {
                    payload: EntityPayload::Task(killing.clone()),
                },
            ));
            updates.push(ModelUpdateAction::new(
                ModelKind::Running,
                path,
                ModelOp::Update {
                    payload: EntityPayload::Task(killing),
                },
            ));
        } else {
            // Never launched: the kill completes immediately.
            let mut finished = observed.clone();
            finished
                .transition_to(TaskState::KillInitiated)
                .and_then(|()| finished.transition_to(TaskState::Finished))
                .map_err(|e| ChangeFailure::new(ReconcileError::InvalidInput(e)))?;
            updates.push(ModelUpdateAction::new(
                ModelKind::Reference,
                path.clone(),
                ModelOp::Update {
                    payload: EntityPayload::Task(finished.clone()),
                },
            ));
            updates.push(ModelUpdateAction::new(
                ModelKind::Running,
                path,
                ModelOp::Add {
                    payload: EntityPayload::Task(finished),
                },
            ));
        }
        self.listener.task_killed(&observed, &self.reason);
        Ok(updates)
    }
}

/// External: kill a whole job. The root disposition moves to
/// KillRequested and every non-terminal task is tagged for kill; the
/// reconciler then drains them one by one through [`KillTaskAction`].
pub struct KillJobAction {
    pub reason: String,
    pub store: Arc<dyn JobStore>,
    pub store_timeout: Duration,
}

#[async_trait]
impl ChangeAction for KillJobAction {
    fn summary(&self) -> String {
        format!("kill job ({})", self.reason)
    }

    async fn execute(&self, models: ModelSet) -> ChangeResult {
        let root_id = models.reference.id.clone();
        let Some(job) = models.reference.payload.as_job() else {
            return Err(ChangeFailure::new(ReconcileError::InvariantViolation(
                "root payload is not a job".to_string(),
            )));
        };
        let mut killed = job.clone();
        killed.disposition = crate::domain::models::JobDisposition::KillRequested;

        let mut updated_root = models.reference.clone();
        updated_root.payload = EntityPayload::Job(killed.clone());
        store_write(self.store.update_job(&updated_root), self.store_timeout)
            .await
            .map_err(ChangeFailure::new)?;

        let mut updates = vec![ModelUpdateAction::new(
            ModelKind::Reference,
            EntityPath::root(&root_id),
            ModelOp::Update {
                payload: EntityPayload::Job(killed),
            },
        )];
        for task in models.reference.tasks() {
            if task.is_terminal() {
                continue;
            }
            updates.push(ModelUpdateAction::new(
                ModelKind::Reference,
                EntityPath::root(&root_id),
                ModelOp::Tag {
                    key: broken_tag(&task.id),
                    value: Some(serde_json::json!(self.reason.clone())),
                },
            ));
        }
        Ok(updates)
    }
}

/// Reconciler: a Running task reached Finished but the Store copy lags;
/// persist the terminal state.
pub struct PersistFinishedAction {
    pub task_id: String,
    pub store: Arc<dyn JobStore>,
    pub store_timeout: Duration,
    pub listener: Arc<dyn TaskLifecycleListener>,
}

#[async_trait]
impl ChangeAction for PersistFinishedAction {
    fn summary(&self) -> String {
        format!("persist finish of task {}", self.task_id)
    }

    async fn execute(&self, models: ModelSet) -> ChangeResult {
        let root_id = models.running.id.clone();
        let Some(finished) = models
            .running
            .child(&self.task_id)
            .and_then(|c| c.payload.as_task())
            .cloned()
        else {
            return Err(ChangeFailure::new(ReconcileError::InvalidInput(format!(
                "task {} not in running model",
                self.task_id
            ))));
        };
        let previous = models
            .store
            .child(&self.task_id)
            .and_then(|c| c.payload.as_task())
            .cloned()
            .unwrap_or_else(|| finished.clone());

        store_write(
            self.store.replace_task(&previous, &finished),
            self.store_timeout,
        )
        .await
        .map_err(ChangeFailure::new)?;

        self.listener.task_finished(&finished);
        Ok(vec![ModelUpdateAction::new(
            ModelKind::Store,
            EntityPath::child(&root_id, &self.task_id),
            ModelOp::Update {
                payload: EntityPayload::Task(finished),
            },
        )])
    }
}

/// Reconciler: a Finished task is durably persisted; drop it from every
/// model and from the store. This is the end of the task's life.
pub struct RemoveFinishedAction {
    pub task_id: String,
    pub store: Arc<dyn JobStore>,
    pub store_timeout: Duration,
}

#[async_trait]
impl ChangeAction for RemoveFinishedAction {
    fn summary(&self) -> String {
        format!("remove finished task {}", self.task_id)
    }

    async fn execute(&self, models: ModelSet) -> ChangeResult {
        let root_id = models.store.id.clone();
        store_write(self.store.remove_task(&self.task_id), self.store_timeout)
            .await
            .map_err(ChangeFailure::new)?;

        let path = EntityPath::child(&root_id, &self.task_id);
        Ok(vec![
            ModelUpdateAction::new(ModelKind::Reference, path.clone(), ModelOp::Remove),
            ModelUpdateAction::new(ModelKind::Running, path.clone(), ModelOp::Remove),
            ModelUpdateAction::new(ModelKind::Store, path, ModelOp::Remove),
            ModelUpdateAction::new(
                ModelKind::Reference,
                EntityPath::root(&root_id),
                ModelOp::Tag {
                    key: retryer_tag(&format!("persist:{}", self.task_id)),
                    value: None,
                },
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{EntityHolder, JobRecord, ResourceSet};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// Store whose acks are controlled by the test.
    #[derive(Default)]
    struct ScriptedStore {
        fail_with: Mutex<Option<ReconcileError>>,
        hang: Mutex<Option<oneshot::Receiver<()>>>,
        writes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobStore for ScriptedStore {
        async fn store_task(&self, task: &Task) -> Result<(), ReconcileError> {
            self.write(format!("store:{}", task.id)).await
        }
        async fn replace_task(&self, _old: &Task, new: &Task) -> Result<(), ReconcileError> {
            self.write(format!("replace:{}", new.id)).await
        }
        async fn remove_task(&self, task_id: &str) -> Result<(), ReconcileError> {
            self.write(format!("remove:{task_id}")).await
        }
        async fn update_job(&self, holder: &EntityHolder) -> Result<(), ReconcileError> {
            self.write(format!("job:{}", holder.id)).await
        }
    }

    impl ScriptedStore {
        async fn write(&self, entry: String) -> Result<(), ReconcileError> {
            let hang = self.hang.lock().unwrap().take();
            if let Some(rx) = hang {
                let _ = rx.await;
            }
            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }
            self.writes.lock().unwrap().push(entry);
            Ok(())
        }
    }

    struct NullOffers;

    #[async_trait]
    impl OfferSource for NullOffers {
        async fn reject_lease(
            &self,
            _offer_id: &str,
            _reason: crate::domain::models::OfferRejectReason,
        ) {
        }
        async fn launch_tasks(
            &self,
            launches: Vec<crate::domain::ports::TaskLaunch>,
            _offers: Vec<crate::domain::models::Offer>,
        ) -> Vec<crate::domain::ports::LaunchResult> {
            launches
                .into_iter()
                .map(|l| crate::domain::ports::LaunchResult::accepted(l.task_id))
                .collect()
        }
        async fn kill_task(&self, _task_id: &str, _agent_id: &str, _reason: &str) {}
    }

    fn task(id: &str) -> Task {
        Task::new(id, "job-1", ResourceSet::cpu_mem(1.0, 512))
    }

    fn models_with_task() -> ModelSet {
        let reference =
            EntityHolder::root(JobRecord::new("job-1")).with_child(EntityHolder::leaf(task("t-1")));
        ModelSet::bootstrap(reference)
    }

    #[tokio::test]
    async fn test_add_task_persists_then_updates_reference_and_store() {
        let store = Arc::new(ScriptedStore::default());
        let action = AddTaskAction {
            task: task("t-2"),
            store: store.clone(),
            store_timeout: Duration::from_millis(100),
        };

        let updates = action.execute(models_with_task()).await.unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].target, ModelKind::Reference);
        assert_eq!(updates[1].target, ModelKind::Store);
        assert_eq!(store.writes.lock().unwrap().as_slice(), &["store:t-2"]);
    }

    #[tokio::test]
    async fn test_add_duplicate_task_rejected() {
        let store = Arc::new(ScriptedStore::default());
        let action = AddTaskAction {
            task: task("t-1"),
            store,
            store_timeout: Duration::from_millis(100),
        };
        let failure = action.execute(models_with_task()).await.unwrap_err();
        assert!(matches!(failure.error, ReconcileError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_launch_produces_three_model_group() {
        let store = Arc::new(ScriptedStore::default());
        let action = TaskLaunchedAction {
            task_id: "t-1".to_string(),
            agent_id: "a1".to_string(),
            store,
            store_timeout: Duration::from_millis(100),
        };

        let updates = action.execute(models_with_task()).await.unwrap();
        let targets: Vec<ModelKind> = updates.iter().map(|u| u.target).collect();
        assert_eq!(
            targets,
            vec![ModelKind::Reference, ModelKind::Running, ModelKind::Store]
        );
        for update in &updates {
            if let ModelOp::Add { payload } | ModelOp::Update { payload } = &update.op {
                let t = payload.as_task().unwrap();
                assert_eq!(t.state, TaskState::Launched);
                assert_eq!(t.agent_id.as_deref(), Some("a1"));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_store_timeout_compensates_with_broken_tag() {
        let (_hang_tx, hang_rx) = oneshot::channel();
        let store = Arc::new(ScriptedStore {
            hang: Mutex::new(Some(hang_rx)),
            ..ScriptedStore::default()
        });
        let action = TaskLaunchedAction {
            task_id: "t-1".to_string(),
            agent_id: "a1".to_string(),
            store,
            store_timeout: Duration::from_millis(5000),
        };

        let failure = action.execute(models_with_task()).await.unwrap_err();
        assert_eq!(failure.error, ReconcileError::StoreTimeout { elapsed_ms: 5000 });
        assert!(failure.compensating.iter().any(|u| matches!(
            &u.op,
            ModelOp::Tag { key, value: Some(v) }
                if key == "broken:t-1" && v == "store update timeout"
        )));
    }

    #[tokio::test]
    async fn test_kill_of_unplaced_task_finishes_it() {
        let action = KillTaskAction {
            task_id: "t-1".to_string(),
            reason: "user kill".to_string(),
            offer_source: Arc::new(NullOffers),
            listener: Arc::new(NoopLifecycleListener),
        };

        let updates = action.execute(models_with_task()).await.unwrap();
        let finished = updates.iter().any(|u| {
            matches!(&u.op, ModelOp::Update { payload } | ModelOp::Add { payload }
                if payload.as_task().is_some_and(|t| t.state == TaskState::Finished))
        });
        assert!(finished);
    }

    #[tokio::test]
    async fn test_kill_of_placed_task_initiates_kill() {
        let mut models = models_with_task();
        let mut placed = task("t-1");
        placed.transition_to(TaskState::Queued).unwrap();
        placed.mark_launched("a1").unwrap();
        models
            .reference
            .upsert_child(EntityHolder::leaf(placed.clone()));
        models.running.upsert_child(EntityHolder::leaf(placed));

        let action = KillTaskAction {
            task_id: "t-1".to_string(),
            reason: "store update timeout".to_string(),
            offer_source: Arc::new(NullOffers),
            listener: Arc::new(NoopLifecycleListener),
        };
        let updates = action.execute(models).await.unwrap();
        let kill_initiated = updates.iter().any(|u| {
            matches!(&u.op, ModelOp::Update { payload }
                if payload.as_task().is_some_and(|t| t.state == TaskState::KillInitiated))
        });
        assert!(kill_initiated);
    }

    #[tokio::test]
    async fn test_kill_job_tags_every_live_task() {
        let store = Arc::new(ScriptedStore::default());
        let mut models = models_with_task();
        models
            .reference
            .upsert_child(EntityHolder::leaf(task("t-2")));
        let mut done = task("t-3");
        done.transition_to(TaskState::Queued).unwrap();
        done.transition_to(TaskState::Finished).unwrap();
        models.reference.upsert_child(EntityHolder::leaf(done));

        let action = KillJobAction {
            reason: "user kill".to_string(),
            store: store.clone(),
            store_timeout: Duration::from_millis(100),
        };
        let updates = action.execute(models).await.unwrap();

        // Root disposition update plus one broken tag per live task.
        let tags: Vec<&str> = updates
            .iter()
            .filter_map(|u| match &u.op {
                ModelOp::Tag { key, value: Some(_) } => Some(key.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tags, vec!["broken:t-1", "broken:t-2"]);
        assert_eq!(store.writes.lock().unwrap().as_slice(), &["job:job-1"]);
    }

    #[tokio::test]
    async fn test_persist_finished_targets_store_only() {
        let mut models = models_with_task();
        let mut done = task("t-1");
        done.transition_to(TaskState::Queued).unwrap();
        done.transition_to(TaskState::Finished).unwrap();
        models.running.upsert_child(EntityHolder::leaf(done));

        let store = Arc::new(ScriptedStore::default());
        let action = PersistFinishedAction {
            task_id: "t-1".to_string(),
            store: store.clone(),
            store_timeout: Duration::from_millis(100),
            listener: Arc::new(NoopLifecycleListener),
        };

        let updates = action.execute(models).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].target, ModelKind::Store);
        assert_eq!(store.writes.lock().unwrap().as_slice(), &["replace:t-1"]);
    }

    #[tokio::test]
    async fn test_remove_finished_clears_all_models() {
        let store = Arc::new(ScriptedStore::default());
        let action = RemoveFinishedAction {
            task_id: "t-1".to_string(),
            store: store.clone(),
            store_timeout: Duration::from_millis(100),
        };

        let updates = action.execute(models_with_task()).await.unwrap();
        let removals = updates
            .iter()
            .filter(|u| matches!(u.op, ModelOp::Remove))
            .count();
        assert_eq!(removals, 3);
        assert_eq!(store.writes.lock().unwrap().as_slice(), &["remove:t-1"]);
    }
}
