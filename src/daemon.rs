//! Single-process assembly of the placement and reconciliation loops.
//!
//! Bridges the two cores: accepted assignments are recorded through the
//! owning reconciliation engine before the launch reaches the offer
//! source, and reconciler lifecycle decisions flow back into the placement
//! queue and resource accounting.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::models::{
    AgentHealth, AgentStatusUpdate, EntityHolder, JobRecord, Offer, Task,
};
use crate::domain::ports::{
    AgentStatusMonitor, Clock, ClusterManager, JobStore, LaunchResult, MetricsRegistry,
    OfferSource, TaskLaunch,
};
use crate::domain::ReconcileError;
use crate::infrastructure::Config;
use crate::reconciler::{
    KillTaskAction, ReconciliationFramework, TaskLaunchedAction, TaskLifecycleListener,
};
use crate::scheduler::{
    AutoscalerController, FitnessEvaluator, OfferPool, PlacementConfig, PlacementEngine,
    TieredTaskQueue,
};

/// Feeds reconciler lifecycle decisions back into the placement side.
struct CoordinatorListener {
    queue: Arc<TieredTaskQueue>,
    placement: OnceLock<Arc<PlacementEngine>>,
}

impl TaskLifecycleListener for CoordinatorListener {
    fn task_needs_placement(&self, task: &Task) {
        if let Err(err) = self.queue.enqueue(task.clone()) {
            warn!(task_id = %task.id, %err, "failed to enqueue task for placement");
        }
    }

    fn task_killed(&self, task: &Task, reason: &str) {
        info!(task_id = %task.id, reason, "task killed");
        self.queue.remove(&task.id, task.tier);
        if let Some(placement) = self.placement.get() {
            placement.release_task(task);
        }
    }

    fn task_finished(&self, task: &Task) {
        if let Some(placement) = self.placement.get() {
            placement.release_task(task);
        }
    }
}

/// Records accepted assignments in the owning reconciliation engine, then
/// forwards them to the offer source.
struct CoordinatorLauncher {
    framework: Arc<ReconciliationFramework>,
    offer_source: Arc<dyn OfferSource>,
    store: Arc<dyn JobStore>,
    store_timeout: Duration,
}

#[async_trait]
impl crate::scheduler::LaunchHandler for CoordinatorLauncher {
    async fn launch(&self, launches: Vec<TaskLaunch>, offers: Vec<Offer>) -> Vec<LaunchResult> {
        let mut results = Vec::with_capacity(launches.len());
        let mut accepted = Vec::new();

        for launch in launches {
            let Some(engine) = self.framework.find_engine_by_child_id(&launch.task_id) else {
                results.push(LaunchResult::rejected(
                    launch.task_id.clone(),
                    "task has no reconciliation engine",
                ));
                continue;
            };
            let ack = engine.change_reference_model(Arc::new(TaskLaunchedAction {
                task_id: launch.task_id.clone(),
                agent_id: launch.agent_id.clone(),
                store: self.store.clone(),
                store_timeout: self.store_timeout,
            }));
            match ack.await {
                Ok(Ok(())) => {
                    results.push(LaunchResult::accepted(launch.task_id.clone()));
                    accepted.push(launch);
                }
                Ok(Err(err)) => {
                    warn!(task_id = %launch.task_id, %err, "launch not recorded");
                    results.push(LaunchResult::rejected(launch.task_id.clone(), err.to_string()));
                }
                Err(_) => {
                    results.push(LaunchResult::rejected(
                        launch.task_id.clone(),
                        "engine dropped launch ack",
                    ));
                }
            }
        }

        if !accepted.is_empty() {
            let source_results = self.offer_source.launch_tasks(accepted, offers).await;
            for source_result in source_results {
                if !source_result.accepted {
                    // The reconciler already recorded the launch; flag the
                    // task so the next diff kills it.
                    warn!(task_id = %source_result.task_id, "offer source rejected recorded launch");
                    if let Some(engine) =
                        self.framework.find_engine_by_child_id(&source_result.task_id)
                    {
                        let _ = engine.change_reference_model(Arc::new(KillTaskAction {
                            task_id: source_result.task_id.clone(),
                            reason: "launch rejected by offer source".to_string(),
                            offer_source: self.offer_source.clone(),
                            listener: Arc::new(crate::reconciler::NoopLifecycleListener),
                        }));
                    }
                }
            }
        }
        results
    }
}

/// The assembled control plane: both loops plus their shared components.
pub struct Daemon {
    pub queue: Arc<TieredTaskQueue>,
    pub offer_pool: Arc<OfferPool>,
    pub placement: Arc<PlacementEngine>,
    pub framework: Arc<ReconciliationFramework>,
    pub autoscaler: Arc<AutoscalerController>,
    offer_source: Arc<dyn OfferSource>,
    store: Arc<dyn JobStore>,
    store_timeout: Duration,
    handles: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Wire every component from configuration and collaborator ports.
    /// Nothing runs until [`start`](Self::start).
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        config: &Config,
        store: Arc<dyn JobStore>,
        offer_source: Arc<dyn OfferSource>,
        cluster: Arc<dyn ClusterManager>,
        clock: Arc<dyn Clock>,
        registry: &dyn MetricsRegistry,
    ) -> Result<Self> {
        let store_timeout = Duration::from_millis(config.reconciler.store_update_timeout_ms);

        let queue = Arc::new(TieredTaskQueue::new());
        let offer_pool = Arc::new(OfferPool::new(
            offer_source.clone(),
            clock.clone(),
            config.scheduler.lease_offer_expiry_secs,
        ));
        let autoscaler = Arc::new(AutoscalerController::new(
            cluster.clone(),
            clock.clone(),
            config.autoscaler_config(),
        ));

        let listener = Arc::new(CoordinatorListener {
            queue: queue.clone(),
            placement: OnceLock::new(),
        });
        let framework = Arc::new(
            ReconciliationFramework::new(
                config.framework_config(),
                store.clone(),
                offer_source.clone(),
                listener.clone(),
                clock.clone(),
                store_timeout,
            )
            .context("invalid reconciliation framework configuration")?,
        );

        let launcher = Arc::new(CoordinatorLauncher {
            framework: framework.clone(),
            offer_source: offer_source.clone(),
            store: store.clone(),
            store_timeout,
        });
        let placement_config: PlacementConfig = config.placement_config();
        let evaluator = FitnessEvaluator::new(placement_config.fitness_good_enough);
        let placement = Arc::new(PlacementEngine::with_metrics(
            queue.clone(),
            offer_pool.clone(),
            evaluator,
            autoscaler.clone(),
            launcher,
            clock,
            placement_config,
            registry,
        ));
        listener
            .placement
            .set(placement.clone())
            .map_err(|_| anyhow::anyhow!("listener already wired"))?;

        Ok(Self {
            queue,
            offer_pool,
            placement,
            framework,
            autoscaler,
            offer_source,
            store,
            store_timeout,
            handles: Vec::new(),
        })
    }

    /// Start both loops and the collaborator event pumps.
    pub fn start(
        &mut self,
        monitor: &dyn AgentStatusMonitor,
        cluster: &dyn ClusterManager,
    ) {
        self.handles.push(self.framework.start());

        let placement = self.placement.clone();
        self.handles.push(tokio::spawn(async move {
            placement.run().await;
        }));

        // Agent health records enable/disable agents; an agent still
        // unhealthy past its disable window has its tasks relocated.
        let mut health_rx = monitor.subscribe();
        let pool = self.offer_pool.clone();
        let framework = self.framework.clone();
        let offer_source = self.offer_source.clone();
        self.handles.push(tokio::spawn(async move {
            while let Some(update) = health_rx.recv().await {
                apply_health_update(&pool, &framework, &offer_source, update);
            }
        }));

        // Instance-group lifecycle feeds the autoscaler; each group's tier
        // arrives on the event itself.
        let mut group_rx = cluster.subscribe();
        let autoscaler = self.autoscaler.clone();
        self.handles.push(tokio::spawn(async move {
            while let Some(event) = group_rx.recv().await {
                autoscaler.apply_group_event(event);
            }
        }));
    }

    /// Submit a job: a reconciliation engine is created and its reconciler
    /// feeds the tasks into placement.
    pub async fn submit_job(&self, job: JobRecord, tasks: Vec<Task>) -> Result<(), ReconcileError> {
        let mut holder = EntityHolder::root(job);
        for task in tasks {
            if task.validate().is_err() || task.job_id != holder.id {
                return Err(ReconcileError::InvalidInput(format!(
                    "task {} does not belong to job {}",
                    task.id, holder.id
                )));
            }
            holder = holder.with_child(EntityHolder::leaf(task));
        }
        self.framework.new_engine(holder).await.map(|_| ())
    }

    /// Kill a job: every non-terminal task is tagged for kill and drained
    /// by the job's reconciler.
    pub async fn kill_job(&self, job_id: &str, reason: &str) -> Result<(), ReconcileError> {
        let engine = self
            .framework
            .find_engine_by_root_id(job_id)
            .ok_or_else(|| ReconcileError::InvalidInput(format!("no engine for job {job_id}")))?;
        let ack = engine.change_reference_model(Arc::new(crate::reconciler::KillJobAction {
            reason: reason.to_string(),
            store: self.store.clone(),
            store_timeout: self.store_timeout,
        }));
        ack.await
            .map_err(|_| ReconcileError::ActionCancelled("engine dropped kill ack".to_string()))?
    }

    /// Request a task kill through its owning engine.
    pub async fn kill_task(&self, task_id: &str, reason: &str) -> Result<(), ReconcileError> {
        let engine = self
            .framework
            .find_engine_by_child_id(task_id)
            .ok_or_else(|| {
                ReconcileError::InvalidInput(format!("no engine owns task {task_id}"))
            })?;
        let ack = engine.change_reference_model(Arc::new(KillTaskAction {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
            offer_source: self.offer_source.clone(),
            listener: Arc::new(crate::reconciler::NoopLifecycleListener),
        }));
        ack.await
            .map_err(|_| ReconcileError::ActionCancelled("engine dropped kill ack".to_string()))?
    }

    /// Stop both loops; bounded by `timeout` for the reconciliation drain.
    pub async fn shutdown(&mut self, timeout: Duration) {
        self.placement.shutdown();
        self.framework.shutdown(timeout).await;
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!("daemon stopped");
    }
}

fn apply_health_update(
    pool: &OfferPool,
    framework: &ReconciliationFramework,
    offer_source: &Arc<dyn OfferSource>,
    update: AgentStatusUpdate,
) {
    match update.health {
        AgentHealth::Healthy => pool.enable(&update.agent_id),
        AgentHealth::Unhealthy => {
            let already_disabled = pool
                .agent(&update.agent_id)
                .is_some_and(|a| a.disabled_until_ms > 0);
            pool.disable(&update.agent_id, update.disable_ms.unwrap_or(60_000));
            if already_disabled {
                // Unhealthy past its window: relocate what is running there.
                if let Some(agent) = pool.agent(&update.agent_id) {
                    for task_id in &agent.running_tasks {
                        if let Some(engine) = framework.find_engine_by_child_id(task_id) {
                            let _ = engine.change_reference_model(Arc::new(KillTaskAction {
                                task_id: task_id.clone(),
                                reason: "agent unhealthy".to_string(),
                                offer_source: offer_source.clone(),
                                listener: Arc::new(crate::reconciler::NoopLifecycleListener),
                            }));
                        }
                    }
                }
            }
        }
    }
}
