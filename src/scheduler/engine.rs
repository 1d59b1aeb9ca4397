//! The placement engine: a periodic loop matching queued tasks against
//! resource offers.
//!
//! One iteration: pre-hook, snapshot, match, assign, autoscale decision,
//! failure callbacks, metrics. The loop never suspends mid-iteration; if an
//! iteration overruns its budget it abandons its tentative assignments
//! (partial iterations never launch tasks) and resumes next tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::domain::error::SchedulerError;
use crate::domain::models::{
    CapacityConsumption, CapacityGroupSla, Offer, ResourceSet, Task, Tier,
};
use crate::domain::ports::{
    Clock, LaunchResult, MetricsRegistry, NoopMetrics, TaskLaunch,
};

use super::autoscaler::{AutoscalerController, GroupObservation};
use super::constraint::{EvaluationContext, FitnessEvaluator};
use super::offer_pool::OfferPool;
use super::queue::TieredTaskQueue;

/// Launch collaborator supplied by the job subsystem. It records state via
/// the owning reconciliation engine and forwards accepted launches to the
/// offer source; it may reject individual assignments (e.g. a task
/// cancelled mid-iteration).
#[async_trait]
pub trait LaunchHandler: Send + Sync {
    async fn launch(&self, launches: Vec<TaskLaunch>, offers: Vec<Offer>) -> Vec<LaunchResult>;
}

/// Placement engine pacing and behavior knobs.
#[derive(Debug, Clone)]
pub struct PlacementConfig {
    /// Minimum delay between iterations; doubles as the iteration budget.
    pub scheduler_iteration_interval_ms: u64,
    /// Rate limit applied when no assignments were possible.
    pub max_delay_ms_between_iterations: u64,
    /// Maximum pending placement-failure callback registrations.
    pub task_failures_queue_capacity: usize,
    /// Fitness threshold enabling early exit from agent evaluation.
    pub fitness_good_enough: f64,
    /// Allow several tasks to consume one agent's offers in one iteration.
    pub multi_task_per_offer: bool,
    /// Exit the process (code 3) on an unrecoverable placement error.
    pub exit_on_scheduling_error_enabled: bool,
    /// Agent attribute naming the scalable instance group.
    pub autoscale_by_attribute_name: String,
    /// Agent attribute distinguishing active from drain-only agents.
    pub active_agent_attribute_name: String,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            scheduler_iteration_interval_ms: 500,
            max_delay_ms_between_iterations: 5000,
            task_failures_queue_capacity: 5,
            fitness_good_enough: 1.0,
            multi_task_per_offer: false,
            exit_on_scheduling_error_enabled: false,
            autoscale_by_attribute_name: "asg".to_string(),
            active_agent_attribute_name: "active".to_string(),
        }
    }
}

/// What one iteration produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IterationOutcome {
    pub assigned: usize,
    pub failed: usize,
    /// True when the iteration overran its budget and launched nothing.
    pub partial: bool,
}

type FailureCallback = (String, oneshot::Sender<Option<SchedulerError>>);

#[derive(Default)]
struct EngineState {
    /// Consumption of launched tasks per capacity group.
    usage_by_group: HashMap<String, ResourceSet>,
    /// Pending per-task placement-failure callbacks, drained every
    /// iteration.
    failure_callbacks: Vec<FailureCallback>,
    /// Active SLAs, mirrored for consumption reporting.
    slas: Vec<CapacityGroupSla>,
}

/// Continuous matcher between the tiered task queue and the offer pool.
pub struct PlacementEngine {
    queue: Arc<TieredTaskQueue>,
    offer_pool: Arc<OfferPool>,
    evaluator: FitnessEvaluator,
    autoscaler: Arc<AutoscalerController>,
    launcher: Arc<dyn LaunchHandler>,
    clock: Arc<dyn Clock>,
    config: PlacementConfig,
    state: Mutex<EngineState>,
    running: AtomicBool,
    metrics: EngineMetrics,
}

struct EngineMetrics {
    iterations: Arc<dyn crate::domain::ports::Counter>,
    assigned: Arc<dyn crate::domain::ports::Counter>,
    failures: Arc<dyn crate::domain::ports::Counter>,
    partial_iterations: Arc<dyn crate::domain::ports::Counter>,
    queue_depth: Arc<dyn crate::domain::ports::Gauge>,
    iteration_time: Arc<dyn crate::domain::ports::Timer>,
}

impl EngineMetrics {
    fn new(registry: &dyn MetricsRegistry) -> Self {
        Self {
            iterations: registry.counter("placement.iterations"),
            assigned: registry.counter("placement.tasks_assigned"),
            failures: registry.counter("placement.task_failures"),
            partial_iterations: registry.counter("placement.partial_iterations"),
            queue_depth: registry.gauge("placement.queue_depth"),
            iteration_time: registry.timer("placement.iteration_time"),
        }
    }
}

impl PlacementEngine {
    pub fn new(
        queue: Arc<TieredTaskQueue>,
        offer_pool: Arc<OfferPool>,
        evaluator: FitnessEvaluator,
        autoscaler: Arc<AutoscalerController>,
        launcher: Arc<dyn LaunchHandler>,
        clock: Arc<dyn Clock>,
        config: PlacementConfig,
    ) -> Self {
        Self::with_metrics(
            queue, offer_pool, evaluator, autoscaler, launcher, clock, config, &NoopMetrics,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_metrics(
        queue: Arc<TieredTaskQueue>,
        offer_pool: Arc<OfferPool>,
        evaluator: FitnessEvaluator,
        autoscaler: Arc<AutoscalerController>,
        launcher: Arc<dyn LaunchHandler>,
        clock: Arc<dyn Clock>,
        config: PlacementConfig,
        registry: &dyn MetricsRegistry,
    ) -> Self {
        let metrics = EngineMetrics::new(registry);
        Self {
            queue,
            offer_pool,
            evaluator,
            autoscaler,
            launcher,
            clock,
            config,
            state: Mutex::new(EngineState::default()),
            running: AtomicBool::new(false),
            metrics,
        }
    }

    /// Register a one-shot callback fired at the end of the next iteration
    /// with the task's placement failure, or `None` if it had none.
    pub fn register_failure_callback(
        &self,
        task_id: impl Into<String>,
        callback: oneshot::Sender<Option<SchedulerError>>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().expect("engine lock poisoned");
        if state.failure_callbacks.len() >= self.config.task_failures_queue_capacity {
            return Err(SchedulerError::CapacityExceeded(
                self.config.task_failures_queue_capacity,
            ));
        }
        state.failure_callbacks.push((task_id.into(), callback));
        Ok(())
    }

    /// Mirror the queue's SLAs for consumption reporting.
    pub fn set_slas(&self, slas: Vec<CapacityGroupSla>) -> Result<(), SchedulerError> {
        self.queue.set_slas(slas.clone())?;
        self.state.lock().expect("engine lock poisoned").slas = slas;
        Ok(())
    }

    /// Release a task's resources when its lifecycle ends (killed or
    /// finished). Frees group consumption and the agent's task slot.
    pub fn release_task(&self, task: &Task) {
        let mut state = self.state.lock().expect("engine lock poisoned");
        if let Some(usage) = state.usage_by_group.get_mut(&task.capacity_group) {
            if let Some(updated) = usage.checked_sub(&task.resources) {
                *usage = updated;
            }
        }
        drop(state);
        if let Some(agent_id) = &task.agent_id {
            self.offer_pool.mark_task_stopped(agent_id, &task.id);
        }
    }

    /// Per-capacity-group consumption report for the last known state.
    pub fn consumption_report(&self) -> Vec<CapacityConsumption> {
        let state = self.state.lock().expect("engine lock poisoned");
        state
            .slas
            .iter()
            .map(|sla| CapacityConsumption {
                group: sla.name.clone(),
                tier: sla.tier,
                guaranteed: sla.guaranteed.clone(),
                max: sla.max.clone(),
                used: state
                    .usage_by_group
                    .get(&sla.name)
                    .cloned()
                    .unwrap_or_else(ResourceSet::none),
            })
            .collect()
    }

    /// Run a single placement iteration.
    pub async fn run_iteration(&self) -> Result<IterationOutcome, SchedulerError> {
        let started = std::time::Instant::now();
        let budget = Duration::from_millis(self.config.scheduler_iteration_interval_ms.max(1));
        self.metrics.iterations.increment(1);

        // 1. Pre-hook: constraint preparation; offer eviction.
        self.evaluator.prepare();
        self.offer_pool.evict_stale().await;

        // 2. Snapshot: ordered task view and consistent agent view.
        let usage = {
            let state = self.state.lock().expect("engine lock poisoned");
            state.usage_by_group.clone()
        };
        let tasks = self.queue.drain_for_iteration(&usage);
        let agents = self.offer_pool.snapshot();
        #[allow(clippy::cast_precision_loss)]
        self.metrics.queue_depth.set(tasks.len() as f64);

        // 3. Match against a working copy of each agent's resources. Two
        // tasks in one iteration can never over-commit an offer.
        let mut remaining: Vec<ResourceSet> =
            agents.iter().map(|a| a.available.clone()).collect();
        let mut ctx = EvaluationContext::new(self.config.active_agent_attribute_name.clone());
        let mut launches: Vec<TaskLaunch> = Vec::new();
        let mut matched_tasks: HashMap<String, Task> = HashMap::new();
        let mut failures: HashMap<String, String> = HashMap::new();
        let mut partial = false;

        for task in &tasks {
            if started.elapsed() > budget {
                // Budget overrun: yield after the current task. A partial
                // iteration never launches tasks.
                warn!(
                    matched = launches.len(),
                    pending = tasks.len(),
                    "iteration budget overrun, deferring to next tick"
                );
                partial = true;
                break;
            }
            match self.evaluator.select(task, &agents, &remaining, &ctx) {
                Ok(candidate) => {
                    let agent = &agents[candidate.agent_index];
                    if self.config.multi_task_per_offer {
                        match remaining[candidate.agent_index].checked_sub(&task.resources) {
                            Some(left) => remaining[candidate.agent_index] = left,
                            None => {
                                failures.insert(task.id.clone(), "insufficient cpu".to_string());
                                continue;
                            }
                        }
                    } else {
                        // Keep-together: the agent's offers are used as a
                        // whole by this task.
                        remaining[candidate.agent_index] = ResourceSet::none();
                    }
                    ctx.record_assignment(agent);
                    launches.push(TaskLaunch {
                        task_id: task.id.clone(),
                        agent_id: agent.agent_id.clone(),
                        resources: task.resources.clone(),
                        offer_ids: agent.offer_ids.clone(),
                    });
                    matched_tasks.insert(task.id.clone(), task.clone());
                }
                Err(reason) => {
                    debug!(task_id = %task.id, reason, "task not placed");
                    failures.insert(task.id.clone(), reason);
                }
            }
        }

        // 4. Assign: hand accepted matches to the launch collaborator.
        let mut assigned = 0usize;
        if !partial && !launches.is_empty() {
            let agent_by_task: HashMap<String, String> = launches
                .iter()
                .map(|l| (l.task_id.clone(), l.agent_id.clone()))
                .collect();
            let offer_ids: Vec<String> = launches
                .iter()
                .flat_map(|l| l.offer_ids.iter().cloned())
                .collect();
            let consumed = self.offer_pool.consume_offers(&offer_ids);
            let results = self.launcher.launch(launches, consumed).await;
            for result in results {
                let Some(task) = matched_tasks.get(&result.task_id) else {
                    return Err(SchedulerError::Fatal(format!(
                        "launch result for unknown task {}",
                        result.task_id
                    )));
                };
                if result.accepted {
                    assigned += 1;
                    self.queue.remove(&task.id, task.tier);
                    if let Some(agent_id) = agent_by_task.get(&task.id) {
                        self.offer_pool.mark_task_running(agent_id, &task.id);
                    }
                    let mut state = self.state.lock().expect("engine lock poisoned");
                    let usage = state
                        .usage_by_group
                        .entry(task.capacity_group.clone())
                        .or_insert_with(ResourceSet::none);
                    *usage = usage.add(&task.resources);
                } else {
                    // Rejected assignments free their resources; the offers
                    // already left the pool and expire normally.
                    let reason = result
                        .reason
                        .unwrap_or_else(|| "launch rejected".to_string());
                    debug!(task_id = %result.task_id, reason, "assignment rejected");
                    failures.insert(result.task_id.clone(), reason);
                }
            }
        }

        // 5. Autoscale decision over the post-iteration view.
        if !partial {
            self.run_autoscale(&tasks, &failures).await;
        }

        // 6. Placement-failure callbacks: always drained, null result when
        // the task collected no failure this iteration.
        let callbacks: Vec<FailureCallback> = {
            let mut state = self.state.lock().expect("engine lock poisoned");
            std::mem::take(&mut state.failure_callbacks)
        };
        for (task_id, callback) in callbacks {
            let outcome = failures.get(&task_id).map(|reason| {
                SchedulerError::ConstraintViolation {
                    task_id: task_id.clone(),
                    reason: reason.clone(),
                }
            });
            let _ = callback.send(outcome);
        }

        // 7. Metrics.
        self.metrics.assigned.increment(assigned as u64);
        self.metrics.failures.increment(failures.len() as u64);
        if partial {
            self.metrics.partial_iterations.increment(1);
        }
        self.metrics.iteration_time.record(started.elapsed());

        Ok(IterationOutcome {
            assigned,
            failed: failures.len(),
            partial,
        })
    }

    /// Aggregate unmet demand per tier and let the controller apportion it
    /// across the instance groups serving that tier.
    async fn run_autoscale(&self, tasks: &[Task], failures: &HashMap<String, String>) {
        let idle = self
            .offer_pool
            .idle_agents_by(&self.config.autoscale_by_attribute_name);
        let sizes = self
            .offer_pool
            .group_sizes(&self.config.autoscale_by_attribute_name);

        // Unmet demand by tier.
        let mut shortfall_by_tier: HashMap<Tier, ResourceSet> = HashMap::new();
        for task in tasks {
            if failures.contains_key(&task.id) {
                let entry = shortfall_by_tier
                    .entry(task.tier)
                    .or_insert_with(ResourceSet::none);
                *entry = entry.add(&task.resources);
            }
        }

        let mut observations: HashMap<String, GroupObservation> = HashMap::new();
        for group in self.autoscaler.known_groups() {
            observations.insert(
                group.id.clone(),
                GroupObservation {
                    idle_instances: idle.get(&group.id).cloned().unwrap_or_default(),
                    current_size: sizes.get(&group.id).copied().unwrap_or(0),
                },
            );
        }

        let actions = self.autoscaler.evaluate(&shortfall_by_tier, &observations);
        if actions.is_empty() {
            return;
        }
        let survivors = self.autoscaler.execute(actions).await;
        for instance_id in survivors {
            self.offer_pool.enable(&instance_id);
        }
    }

    /// Run the periodic loop until [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            interval_ms = self.config.scheduler_iteration_interval_ms,
            "placement engine started"
        );
        while self.running.load(Ordering::SeqCst) {
            match self.run_iteration().await {
                Ok(outcome) => {
                    let sleep_ms = if outcome.assigned == 0 && !outcome.partial {
                        self.config.max_delay_ms_between_iterations
                    } else {
                        self.config.scheduler_iteration_interval_ms
                    };
                    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                }
                Err(err) if err.is_fatal() && self.config.exit_on_scheduling_error_enabled => {
                    error!(%err, "fatal scheduler error, dumping state and exiting");
                    self.dump_state().await;
                    std::process::exit(3);
                }
                Err(err) => {
                    error!(%err, "scheduler iteration failed");
                    tokio::time::sleep(Duration::from_millis(
                        self.config.max_delay_ms_between_iterations,
                    ))
                    .await;
                }
            }
        }
        info!("placement engine stopped");
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Best-effort state dump before a fatal exit, bounded by three times
    /// the iteration budget.
    async fn dump_state(&self) {
        let budget =
            Duration::from_millis(self.config.scheduler_iteration_interval_ms.max(1) * 3);
        let dump = async {
            let report = self.consumption_report();
            error!(
                queued_tasks = self.queue.len(),
                live_offers = self.offer_pool.offer_count(),
                capacity_groups = report.len(),
                now = %self.clock.now(),
                "scheduler state dump"
            );
            for entry in report {
                error!(
                    group = %entry.group,
                    tier = entry.tier.as_str(),
                    used_cpu = entry.used.cpu,
                    "capacity group consumption"
                );
            }
        };
        if tokio::time::timeout(budget, dump).await.is_err() {
            error!("state dump timed out");
        }
    }
}
