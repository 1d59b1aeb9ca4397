//! Per-root-entity reconciliation engine.
//!
//! Each engine owns three entity trees (Reference, Running, Store), a queue
//! of external change actions, and the reconciler actions synthesized from
//! model diffs. Exactly one action runs at a time; its asynchronous
//! completion feeds model updates back through the next trigger, keeping a
//! per-engine total order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::domain::error::ReconcileError;
use crate::domain::models::{
    EntityHolder, ModelKind, ReconcileEvent, ReconcileEventKind, Retryer, TaskState,
};
use crate::domain::ports::{Clock, JobStore, OfferSource};

use super::actions::{ChangeAction, ChangeResult, EntityPath, ModelOp, ModelSet, ModelUpdateAction};
use super::job_actions::{
    retryer_tag, KillTaskAction, PersistFinishedAction, RemoveFinishedAction,
    TaskLifecycleListener,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What one trigger observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerResult {
    pub has_model_updates: bool,
    pub running_change_actions: bool,
}

struct QueuedChange {
    action: Arc<dyn ChangeAction>,
    ack: Option<oneshot::Sender<Result<(), ReconcileError>>>,
    /// Present for reconciler-synthesized actions; keys their retry state.
    reconciler_key: Option<String>,
}

struct RunningChange {
    summary: String,
    rx: oneshot::Receiver<ChangeResult>,
    ack: Option<oneshot::Sender<Result<(), ReconcileError>>>,
    reconciler_key: Option<String>,
}

struct EngineInner {
    models: ModelSet,
    external: VecDeque<QueuedChange>,
    running: Option<RunningChange>,
    events_tx: Option<broadcast::Sender<ReconcileEvent>>,
    shut_down: bool,
}

/// Reconciliation engine for one root entity (job).
///
/// `change_reference_model` and `events` are callable from any thread; the
/// three models are mutated only from `trigger_events`, which the framework
/// loop calls serially.
pub struct ReconciliationEngine {
    root_id: String,
    inner: Mutex<EngineInner>,
    store: Arc<dyn JobStore>,
    offer_source: Arc<dyn OfferSource>,
    listener: Arc<dyn TaskLifecycleListener>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("root_id", &self.root_id)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

impl ReconciliationEngine {
    pub fn new(
        bootstrap: EntityHolder,
        store: Arc<dyn JobStore>,
        offer_source: Arc<dyn OfferSource>,
        listener: Arc<dyn TaskLifecycleListener>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            root_id: bootstrap.id.clone(),
            inner: Mutex::new(EngineInner {
                models: ModelSet::bootstrap(bootstrap),
                external: VecDeque::new(),
                running: None,
                events_tx: Some(events_tx),
                shut_down: false,
            }),
            store,
            offer_source,
            listener,
            clock,
            store_timeout,
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Ids of every child entity across the three models.
    pub fn child_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("engine lock poisoned");
        let mut ids: Vec<String> = inner
            .models
            .reference
            .children
            .iter()
            .chain(inner.models.running.children.iter())
            .chain(inner.models.store.children.iter())
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// A point-in-time copy of the three models.
    pub fn models(&self) -> ModelSet {
        self.inner.lock().expect("engine lock poisoned").models.clone()
    }

    /// Enqueue an external change request. The returned future completes
    /// when the action's updates have been applied (or it failed).
    pub fn change_reference_model(
        &self,
        action: Arc<dyn ChangeAction>,
    ) -> oneshot::Receiver<Result<(), ReconcileError>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("engine lock poisoned");
        if inner.shut_down {
            let _ = ack_tx.send(Err(ReconcileError::ShutdownInProgress));
            return ack_rx;
        }
        inner.external.push_back(QueuedChange {
            action,
            ack: Some(ack_tx),
            reconciler_key: None,
        });
        ack_rx
    }

    /// Subscribe to this engine's event stream. The stream closes when the
    /// engine shuts down; subscribing afterwards yields an ended stream.
    pub fn events(&self) -> broadcast::Receiver<ReconcileEvent> {
        let inner = self.inner.lock().expect("engine lock poisoned");
        match &inner.events_tx {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// One reconciliation step, called by the framework loop: apply the
    /// completed action's updates, then start the next action (external
    /// queue first, reconciler diff otherwise).
    pub fn trigger_events(&self) -> TriggerResult {
        let mut inner = self.inner.lock().expect("engine lock poisoned");
        let mut has_model_updates = false;

        // 1. Collect the in-flight action if it completed.
        let outcome = match &mut inner.running {
            Some(running) => match running.rx.try_recv() {
                Ok(result) => Some(Some(result)),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(None),
            },
            None => None,
        };
        if let Some(outcome) = outcome {
            let running = inner.running.take().expect("running action present");
            match outcome {
                Some(result) => {
                    has_model_updates = self.complete_action(&mut inner, running, result);
                }
                None => {
                    warn!(root_id = %self.root_id, summary = %running.summary, "action executor dropped");
                    self.fail_action(
                        &mut inner,
                        running,
                        ReconcileError::ActionCancelled("executor dropped".to_string()),
                        Vec::new(),
                    );
                }
            }
        }

        // 2. Start the next action if none is running.
        if inner.running.is_none() && !inner.shut_down {
            let next = inner
                .external
                .pop_front()
                .or_else(|| self.compute_reconciler_action(&inner.models));
            if let Some(queued) = next {
                let summary = queued.action.summary();
                self.emit(
                    &inner,
                    ReconcileEventKind::ChangeStarted,
                    ModelKind::None,
                    summary.clone(),
                    None,
                );
                let snapshot = inner.models.clone();
                let (tx, rx) = oneshot::channel();
                let action = queued.action;
                tokio::spawn(async move {
                    let _ = tx.send(action.execute(snapshot).await);
                });
                inner.running = Some(RunningChange {
                    summary,
                    rx,
                    ack: queued.ack,
                    reconciler_key: queued.reconciler_key,
                });
            }
        }

        TriggerResult {
            has_model_updates,
            running_change_actions: inner.running.is_some() || !inner.external.is_empty(),
        }
    }

    /// Drain in-flight and queued actions with a cancellation error, then
    /// complete the event stream.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("engine lock poisoned");
        inner.shut_down = true;
        let queued: Vec<QueuedChange> = inner.external.drain(..).collect();
        for change in queued {
            if let Some(ack) = change.ack {
                let _ = ack.send(Err(ReconcileError::ActionCancelled(
                    "engine shut down".to_string(),
                )));
            }
        }
        if let Some(running) = inner.running.take() {
            self.emit(
                &inner,
                ReconcileEventKind::ChangeFailed,
                ModelKind::None,
                running.summary.clone(),
                Some("engine shut down".to_string()),
            );
            if let Some(ack) = running.ack {
                let _ = ack.send(Err(ReconcileError::ActionCancelled(
                    "engine shut down".to_string(),
                )));
            }
        }
        // Dropping the sender ends every subscriber's stream.
        inner.events_tx = None;
        debug!(root_id = %self.root_id, "engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().expect("engine lock poisoned").shut_down
    }

    /// Apply a finished action's outcome. Returns whether models changed.
    fn complete_action(
        &self,
        inner: &mut EngineInner,
        running: RunningChange,
        result: ChangeResult,
    ) -> bool {
        match result {
            Ok(updates) => match inner.models.apply_group(&updates) {
                Ok(()) => {
                    for update in &updates {
                        self.emit(
                            inner,
                            ReconcileEventKind::ModelUpdate,
                            update.target,
                            update.summary(),
                            None,
                        );
                    }
                    self.emit(
                        inner,
                        ReconcileEventKind::ChangeCompleted,
                        ModelKind::None,
                        running.summary.clone(),
                        None,
                    );
                    if let Some(key) = &running.reconciler_key {
                        self.clear_retryer(inner, key);
                    }
                    if let Some(ack) = running.ack {
                        let _ = ack.send(Ok(()));
                    }
                    !updates.is_empty()
                }
                Err(error) => {
                    self.fail_action(inner, running, error, Vec::new());
                    false
                }
            },
            Err(failure) => {
                let compensating = failure.compensating;
                let applied = self.fail_action(inner, running, failure.error, compensating);
                applied
            }
        }
    }

    /// Record a failed action: apply compensating updates, emit the failure
    /// event, bump the retryer for reconciler actions, ack the caller.
    /// Returns whether compensating updates changed the models.
    fn fail_action(
        &self,
        inner: &mut EngineInner,
        running: RunningChange,
        error: ReconcileError,
        compensating: Vec<ModelUpdateAction>,
    ) -> bool {
        let mut applied = false;
        if !compensating.is_empty() {
            match inner.models.apply_group(&compensating) {
                Ok(()) => {
                    for update in &compensating {
                        self.emit(
                            inner,
                            ReconcileEventKind::ModelUpdate,
                            update.target,
                            update.summary(),
                            None,
                        );
                    }
                    applied = true;
                }
                Err(comp_err) => {
                    warn!(root_id = %self.root_id, %comp_err, "compensating updates failed");
                }
            }
        }
        self.emit(
            inner,
            ReconcileEventKind::ChangeFailed,
            ModelKind::None,
            running.summary.clone(),
            Some(error.to_string()),
        );
        if let Some(key) = &running.reconciler_key {
            self.bump_retryer(inner, key);
        }
        if let Some(ack) = running.ack {
            let _ = ack.send(Err(error));
        }
        applied
    }

    /// Synthesize the next reconciler action from the model diffs, in
    /// priority order: broken tasks to kill, finished tasks to persist,
    /// persisted tasks to remove, accepted tasks to hand to placement.
    /// Candidates still inside their retry delay are skipped.
    fn compute_reconciler_action(&self, models: &ModelSet) -> Option<QueuedChange> {
        let now = self.clock.now();

        // Broken tasks (e.g. a launch whose store write timed out).
        for (key, value) in &models.reference.tags {
            if let Some(task_id) = key.strip_prefix("broken:") {
                let action_key = format!("kill:{task_id}");
                if !self.retry_due(models, &action_key, now) {
                    continue;
                }
                let reason = value.as_str().unwrap_or("broken task").to_string();
                return Some(QueuedChange {
                    action: Arc::new(KillTaskAction {
                        task_id: task_id.to_string(),
                        reason,
                        offer_source: self.offer_source.clone(),
                        listener: self.listener.clone(),
                    }),
                    ack: None,
                    reconciler_key: Some(action_key),
                });
            }
        }

        // Running shows Finished but the store copy lags.
        for task in models.running.tasks() {
            if task.state != TaskState::Finished {
                continue;
            }
            let stored_finished = models
                .store
                .child(&task.id)
                .and_then(|c| c.payload.as_task())
                .is_some_and(|t| t.state == TaskState::Finished);
            if stored_finished {
                continue;
            }
            let action_key = format!("persist:{}", task.id);
            if !self.retry_due(models, &action_key, now) {
                continue;
            }
            return Some(QueuedChange {
                action: Arc::new(PersistFinishedAction {
                    task_id: task.id.clone(),
                    store: self.store.clone(),
                    store_timeout: self.store_timeout,
                    listener: self.listener.clone(),
                }),
                ack: None,
                reconciler_key: Some(action_key),
            });
        }

        // Store shows Finished: the task's life is over everywhere.
        for task in models.store.tasks() {
            if task.state != TaskState::Finished {
                continue;
            }
            let action_key = format!("remove:{}", task.id);
            if !self.retry_due(models, &action_key, now) {
                continue;
            }
            return Some(QueuedChange {
                action: Arc::new(RemoveFinishedAction {
                    task_id: task.id.clone(),
                    store: self.store.clone(),
                    store_timeout: self.store_timeout,
                }),
                ack: None,
                reconciler_key: Some(action_key),
            });
        }

        // Reference tasks that never reached placement.
        for task in models.reference.tasks() {
            if task.state == TaskState::Accepted && models.running.child(&task.id).is_none() {
                let action_key = format!("queue:{}", task.id);
                if !self.retry_due(models, &action_key, now) {
                    continue;
                }
                return Some(QueuedChange {
                    action: Arc::new(QueueTaskAction {
                        task_id: task.id.clone(),
                        listener: self.listener.clone(),
                    }),
                    ack: None,
                    reconciler_key: Some(action_key),
                });
            }
        }
        None
    }

    /// True when the retry delay for `action_key` has elapsed (or it never
    /// failed).
    fn retry_due(&self, models: &ModelSet, action_key: &str, now: DateTime<Utc>) -> bool {
        let Some(value) = models.reference.tag(&retryer_tag(action_key)) else {
            return true;
        };
        let Some(state) = RetryState::from_value(value) else {
            return true;
        };
        let delay = chrono::Duration::from_std(state.retryer.next_delay())
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        now - state.last_attempt_at() >= delay
    }

    fn bump_retryer(&self, inner: &mut EngineInner, action_key: &str) {
        let tag_key = retryer_tag(action_key);
        let state = inner
            .models
            .reference
            .tag(&tag_key)
            .and_then(RetryState::from_value)
            .map_or_else(RetryState::first_failure, RetryState::next);
        let update = ModelUpdateAction::new(
            ModelKind::Reference,
            EntityPath::root(&self.root_id),
            ModelOp::Tag {
                key: tag_key,
                value: Some(state.to_value(self.clock.now())),
            },
        );
        if let Err(err) = inner.models.apply_group(std::slice::from_ref(&update)) {
            warn!(root_id = %self.root_id, %err, "failed to record retry state");
        }
    }

    fn clear_retryer(&self, inner: &mut EngineInner, action_key: &str) {
        let tag_key = retryer_tag(action_key);
        if inner.models.reference.tag(&tag_key).is_none() {
            return;
        }
        let update = ModelUpdateAction::new(
            ModelKind::Reference,
            EntityPath::root(&self.root_id),
            ModelOp::Tag {
                key: tag_key,
                value: None,
            },
        );
        let _ = inner.models.apply_group(std::slice::from_ref(&update));
    }

    fn emit(
        &self,
        inner: &EngineInner,
        kind: ReconcileEventKind,
        model: ModelKind,
        summary: String,
        error: Option<String>,
    ) {
        let Some(tx) = &inner.events_tx else {
            return;
        };
        let event = ReconcileEvent {
            id: crate::domain::models::EventId::new(),
            timestamp: self.clock.now(),
            root_id: self.root_id.clone(),
            kind,
            model,
            summary,
            error,
        };
        // No subscribers is fine; the framework attaches lazily.
        let _ = tx.send(event);
    }
}

/// Retry bookkeeping stored under a root-holder tag.
struct RetryState {
    retryer: Retryer,
    last_attempt_ms: i64,
}

impl RetryState {
    fn first_failure() -> Self {
        Self {
            retryer: Retryer::exponential(
                Duration::from_millis(200),
                Duration::from_secs(30),
            ),
            last_attempt_ms: 0,
        }
    }

    fn next(self) -> Self {
        Self {
            retryer: self.retryer.record_attempt(),
            last_attempt_ms: self.last_attempt_ms,
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let retryer = serde_json::from_value(value.get("retryer")?.clone()).ok()?;
        let last_attempt_ms = value.get("last_attempt_ms")?.as_i64()?;
        Some(Self {
            retryer,
            last_attempt_ms,
        })
    }

    fn to_value(&self, now: DateTime<Utc>) -> Value {
        serde_json::json!({
            "retryer": self.retryer,
            "last_attempt_ms": now.timestamp_millis(),
        })
    }

    fn last_attempt_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.last_attempt_ms).unwrap_or_else(Utc::now)
    }
}

/// Reconciler action: hand an Accepted task to the placement queue and mark
/// it Queued in Reference.
struct QueueTaskAction {
    task_id: String,
    listener: Arc<dyn TaskLifecycleListener>,
}

#[async_trait::async_trait]
impl ChangeAction for QueueTaskAction {
    fn summary(&self) -> String {
        format!("queue task {}", self.task_id)
    }

    async fn execute(&self, models: ModelSet) -> ChangeResult {
        use super::actions::ChangeFailure;
        let root_id = models.reference.id.clone();
        let Some(task) = models
            .reference
            .child(&self.task_id)
            .and_then(|c| c.payload.as_task())
        else {
            return Err(ChangeFailure::new(ReconcileError::InvalidInput(format!(
                "task {} not in reference model",
                self.task_id
            ))));
        };
        let mut queued = task.clone();
        queued
            .transition_to(TaskState::Queued)
            .map_err(|e| ChangeFailure::new(ReconcileError::InvalidInput(e)))?;
        self.listener.task_needs_placement(&queued);
        Ok(vec![ModelUpdateAction::new(
            ModelKind::Reference,
            EntityPath::child(&root_id, &self.task_id),
            ModelOp::Update {
                payload: crate::domain::models::EntityPayload::Task(queued),
            },
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{JobRecord, ResourceSet, Task};
    use crate::domain::ports::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct InMemoryStore {
        tasks: StdMutex<std::collections::HashMap<String, Task>>,
        fail_writes: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl JobStore for InMemoryStore {
        async fn store_task(&self, task: &Task) -> Result<(), ReconcileError> {
            if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ReconcileError::StoreUnavailable("test failure".to_string()));
            }
            self.tasks
                .lock()
                .unwrap()
                .insert(task.id.clone(), task.clone());
            Ok(())
        }
        async fn replace_task(&self, _old: &Task, new: &Task) -> Result<(), ReconcileError> {
            self.store_task(new).await
        }
        async fn remove_task(&self, task_id: &str) -> Result<(), ReconcileError> {
            self.tasks.lock().unwrap().remove(task_id);
            Ok(())
        }
        async fn update_job(&self, _holder: &EntityHolder) -> Result<(), ReconcileError> {
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

    #[derive(Default)]
    struct RecordingListener {
        queued: StdMutex<Vec<String>>,
        killed: StdMutex<Vec<String>>,
    }

    impl TaskLifecycleListener for RecordingListener {
        fn task_needs_placement(&self, task: &Task) {
            self.queued.lock().unwrap().push(task.id.clone());
        }
        fn task_killed(&self, task: &Task, _reason: &str) {
            self.killed.lock().unwrap().push(task.id.clone());
        }
    }

    fn engine_with(
        bootstrap: EntityHolder,
        store: Arc<InMemoryStore>,
        listener: Arc<RecordingListener>,
    ) -> ReconciliationEngine {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        ReconciliationEngine::new(
            bootstrap,
            store,
            Arc::new(NullOffers),
            listener,
            Arc::new(clock),
            Duration::from_millis(200),
        )
    }

    fn bootstrap_with_task(task_id: &str) -> EntityHolder {
        EntityHolder::root(JobRecord::new("job-1")).with_child(EntityHolder::leaf(Task::new(
            task_id,
            "job-1",
            ResourceSet::cpu_mem(1.0, 512),
        )))
    }

    /// Drive triggers until the engine goes quiet.
    async fn settle(engine: &ReconciliationEngine) {
        for _ in 0..50 {
            let result = engine.trigger_events();
            if !result.running_change_actions && !result.has_model_updates {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_reconciler_queues_accepted_tasks() {
        let store = Arc::new(InMemoryStore::default());
        let listener = Arc::new(RecordingListener::default());
        let engine = engine_with(bootstrap_with_task("t-1"), store, listener.clone());

        settle(&engine).await;

        assert_eq!(listener.queued.lock().unwrap().as_slice(), &["t-1"]);
        let models = engine.models();
        let task = models
            .reference
            .child("t-1")
            .unwrap()
            .payload
            .as_task()
            .unwrap()
            .clone();
        assert_eq!(task.state, TaskState::Queued);
    }

    #[tokio::test]
    async fn test_external_action_runs_before_reconciler() {
        let store = Arc::new(InMemoryStore::default());
        let listener = Arc::new(RecordingListener::default());
        let engine = engine_with(
            EntityHolder::root(JobRecord::new("job-1")),
            store.clone(),
            listener,
        );

        let ack = engine.change_reference_model(Arc::new(
            crate::reconciler::job_actions::AddTaskAction {
                task: Task::new("t-9", "job-1", ResourceSet::cpu_mem(1.0, 256)),
                store: store.clone(),
                store_timeout: Duration::from_millis(200),
            },
        ));

        settle(&engine).await;
        ack.await.unwrap().unwrap();
        assert!(store.tasks.lock().unwrap().contains_key("t-9"));
        assert!(engine.models().reference.child("t-9").is_some());
        assert!(engine.models().store.child("t-9").is_some());
    }

    #[tokio::test]
    async fn test_events_carry_per_engine_order() {
        let store = Arc::new(InMemoryStore::default());
        let listener = Arc::new(RecordingListener::default());
        let engine = engine_with(bootstrap_with_task("t-1"), store, listener);
        let mut events = engine.events();

        settle(&engine).await;
        engine.shutdown();

        let mut collected = Vec::new();
        while let Ok(event) = events.try_recv() {
            collected.push(event);
        }
        assert!(!collected.is_empty());
        // ChangeStarted precedes ChangeCompleted; timestamps never regress.
        assert_eq!(collected[0].kind, ReconcileEventKind::ChangeStarted);
        for pair in collected.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        assert!(collected
            .iter()
            .any(|e| e.kind == ReconcileEventKind::ChangeCompleted));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_actions() {
        let store = Arc::new(InMemoryStore::default());
        let listener = Arc::new(RecordingListener::default());
        let engine = engine_with(
            EntityHolder::root(JobRecord::new("job-1")),
            store.clone(),
            listener,
        );

        // Queued but never triggered.
        let ack = engine.change_reference_model(Arc::new(
            crate::reconciler::job_actions::AddTaskAction {
                task: Task::new("t-1", "job-1", ResourceSet::cpu_mem(1.0, 256)),
                store,
                store_timeout: Duration::from_millis(200),
            },
        ));
        engine.shutdown();

        assert!(matches!(
            ack.await.unwrap(),
            Err(ReconcileError::ActionCancelled(_))
        ));

        // Further changes fail immediately.
        let ack = engine.change_reference_model(Arc::new(QueueTaskAction {
            task_id: "t-1".to_string(),
            listener: Arc::new(crate::reconciler::job_actions::NoopLifecycleListener),
        }));
        assert_eq!(
            ack.await.unwrap(),
            Err(ReconcileError::ShutdownInProgress)
        );
    }

    #[tokio::test]
    async fn test_failed_reconciler_action_records_retry_state() {
        let store = Arc::new(InMemoryStore::default());
        store
            .fail_writes
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let listener = Arc::new(RecordingListener::default());

        // Running model contains a finished task that cannot persist.
        let bootstrap = EntityHolder::root(JobRecord::new("job-1"));
        let engine = engine_with(bootstrap, store, listener);
        {
            let mut inner = engine.inner.lock().unwrap();
            let mut done = Task::new("t-1", "job-1", ResourceSet::cpu_mem(1.0, 256));
            done.transition_to(TaskState::Queued).unwrap();
            done.transition_to(TaskState::Finished).unwrap();
            inner.models.running.upsert_child(EntityHolder::leaf(done));
        }

        settle(&engine).await;

        let models = engine.models();
        assert!(models.reference.tag(&retryer_tag("persist:t-1")).is_some());
    }
}
