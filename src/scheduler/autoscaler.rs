//! Per-instance-group autoscaling decisions.
//!
//! The controller turns post-iteration observations (idle agents, unmet
//! task demand) into abstract [`ScaleAction`]s. Executing them is delegated
//! to the cluster manager collaborator; instances the manager declined to
//! terminate are reported back so the caller can re-enable them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::domain::models::{
    InstanceGroup, InstanceGroupEvent, ResourceSet, ScaleAction, Tier,
};
use crate::domain::ports::{Clock, ClusterManager};

/// Orders scale-down candidates; the first entries terminate first.
pub trait ScaleDownOrderEvaluator: Send + Sync {
    fn order(&self, group: &InstanceGroup, candidates: &mut Vec<String>);
}

/// Default order: lexicographic by instance id, which is stable across
/// iterations.
pub struct StableIdOrder;

impl ScaleDownOrderEvaluator for StableIdOrder {
    fn order(&self, _group: &InstanceGroup, candidates: &mut Vec<String>) {
        candidates.sort();
    }
}

/// Weighted veto on individual scale-down candidates. Scores are in
/// `[0, 1]`; the weighted average across evaluators must reach 0.5 for the
/// instance to remain a candidate.
pub trait ScaleDownConstraintEvaluator: Send + Sync {
    fn name(&self) -> &str;
    fn weight(&self) -> f64;
    fn evaluate(&self, group: &InstanceGroup, instance_id: &str) -> f64;
}

/// What the placement engine observed for one instance group after an
/// iteration.
#[derive(Debug, Clone, Default)]
pub struct GroupObservation {
    pub idle_instances: Vec<String>,
    /// Agents currently in the group.
    pub current_size: u32,
}

#[derive(Debug)]
struct GroupState {
    group: InstanceGroup,
    shortfall_since: Option<DateTime<Utc>>,
    idle_excess_since: Option<DateTime<Utc>>,
    last_action_at: Option<DateTime<Utc>>,
}

/// Pacing and sizing knobs for the controller.
#[derive(Debug, Clone)]
pub struct AutoscalerConfig {
    pub delay_autoscale_up_by_secs: u64,
    pub delay_autoscale_down_by_secs: u64,
    /// Discount idle capacity already present in the group before
    /// converting shortfall into an instance count.
    pub optimizing_shortfall_evaluator_enabled: bool,
    /// Typical per-instance slot size per tier, used to convert resource
    /// shortfall into an instance count.
    pub typical_slot_cpu: HashMap<Tier, f64>,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        let mut typical_slot_cpu = HashMap::new();
        typical_slot_cpu.insert(Tier::Critical, 4.0);
        typical_slot_cpu.insert(Tier::Flex, 4.0);
        Self {
            delay_autoscale_up_by_secs: 0,
            delay_autoscale_down_by_secs: 0,
            optimizing_shortfall_evaluator_enabled: false,
            typical_slot_cpu,
        }
    }
}

/// Scale-up/scale-down rule engine over the known instance groups.
pub struct AutoscalerController {
    cluster: Arc<dyn ClusterManager>,
    clock: Arc<dyn Clock>,
    config: AutoscalerConfig,
    /// Per-tier typical slot sizes, refreshed by the iteration pre-hook.
    tier_slots: Mutex<HashMap<Tier, f64>>,
    groups: Mutex<HashMap<String, GroupState>>,
    order: Arc<dyn ScaleDownOrderEvaluator>,
    constraints: Vec<Arc<dyn ScaleDownConstraintEvaluator>>,
}

impl AutoscalerController {
    pub fn new(
        cluster: Arc<dyn ClusterManager>,
        clock: Arc<dyn Clock>,
        config: AutoscalerConfig,
    ) -> Self {
        let tier_slots = Mutex::new(config.typical_slot_cpu.clone());
        Self {
            cluster,
            clock,
            config,
            tier_slots,
            groups: Mutex::new(HashMap::new()),
            order: Arc::new(StableIdOrder),
            constraints: Vec::new(),
        }
    }

    pub fn with_order(mut self, order: Arc<dyn ScaleDownOrderEvaluator>) -> Self {
        self.order = order;
        self
    }

    pub fn with_constraint(mut self, constraint: Arc<dyn ScaleDownConstraintEvaluator>) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Refresh the per-tier typical slot sizes (iteration pre-hook).
    pub fn refresh_tier_slots(&self, slots: HashMap<Tier, f64>) {
        *self.tier_slots.lock().expect("autoscaler lock poisoned") = slots;
    }

    /// Track instance-group lifecycle events from the cluster manager.
    /// Invalid groups are rejected and logged; nothing is mutated for them.
    pub fn apply_group_event(&self, event: InstanceGroupEvent) {
        match event {
            InstanceGroupEvent::Added(group) | InstanceGroupEvent::Updated(group) => {
                if let Err(reason) = group.validate() {
                    warn!(group_id = %group.id, reason, "rejecting invalid instance group");
                    return;
                }
                let mut groups = self.groups.lock().expect("autoscaler lock poisoned");
                let id = group.id.clone();
                match groups.entry(id) {
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        entry.get_mut().group = group;
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(GroupState {
                            group,
                            shortfall_since: None,
                            idle_excess_since: None,
                            last_action_at: None,
                        });
                    }
                }
            }
            InstanceGroupEvent::Removed { group_id } => {
                let mut groups = self.groups.lock().expect("autoscaler lock poisoned");
                groups.remove(&group_id);
            }
        }
    }

    /// Turn post-iteration observations into scale actions. Hysteresis:
    /// shortfall and idle excess must persist for their configured delays;
    /// `cool_down_secs` gates consecutive actions per group.
    ///
    /// Tier-level shortfall is apportioned, not broadcast: groups drain
    /// their tier's unmet demand in (priority, id) order, and capacity a
    /// scale-up provisions is subtracted before the next group of the same
    /// tier is considered. A group that cannot act (cool-down, hysteresis,
    /// already at max) leaves the demand for the next one.
    pub fn evaluate(
        &self,
        shortfall_by_tier: &HashMap<Tier, ResourceSet>,
        observations: &HashMap<String, GroupObservation>,
    ) -> Vec<ScaleAction> {
        let now = self.clock.now();
        let mut remaining_cpu: HashMap<Tier, f64> = shortfall_by_tier
            .iter()
            .map(|(tier, shortfall)| (*tier, shortfall.cpu.max(0.0)))
            .collect();
        let mut groups = self.groups.lock().expect("autoscaler lock poisoned");
        let mut actions = Vec::new();

        let mut ordered: Vec<&mut GroupState> = groups.values_mut().collect();
        ordered.sort_by(|a, b| {
            a.group
                .priority
                .cmp(&b.group.priority)
                .then_with(|| a.group.id.cmp(&b.group.id))
        });

        for state in ordered {
            let Some(observation) = observations.get(&state.group.id) else {
                state.shortfall_since = None;
                state.idle_excess_since = None;
                continue;
            };
            let tier = state.group.tier;
            let slot_cpu = {
                let slots = self.tier_slots.lock().expect("autoscaler lock poisoned");
                slots.get(&tier).copied().unwrap_or(4.0)
            };
            let demand_cpu = remaining_cpu.get(&tier).copied().unwrap_or(0.0);

            if let Some((action, covered_cpu)) =
                Self::evaluate_up(&self.config, state, observation, demand_cpu, slot_cpu, now)
            {
                if let Some(left) = remaining_cpu.get_mut(&tier) {
                    *left = (*left - covered_cpu).max(0.0);
                }
                state.last_action_at = Some(now);
                actions.push(action);
                continue;
            }
            if let Some(action) = self.evaluate_down(state, observation, now) {
                state.last_action_at = Some(now);
                actions.push(action);
            }
        }
        actions
    }

    fn cooled_down(state: &GroupState, now: DateTime<Utc>) -> bool {
        match state.last_action_at {
            None => true,
            Some(last) => {
                now - last
                    >= Duration::seconds(
                        i64::try_from(state.group.cool_down_secs).unwrap_or(i64::MAX / 1000),
                    )
            }
        }
    }

    /// Returns the action plus the cpu capacity the new instances provide,
    /// which the caller subtracts from the tier's remaining demand.
    fn evaluate_up(
        config: &AutoscalerConfig,
        state: &mut GroupState,
        observation: &GroupObservation,
        demand_cpu: f64,
        slot_cpu: f64,
        now: DateTime<Utc>,
    ) -> Option<(ScaleAction, f64)> {
        if demand_cpu <= 0.0 {
            state.shortfall_since = None;
            return None;
        }
        let since = *state.shortfall_since.get_or_insert(now);
        let delay = Duration::seconds(i64::try_from(config.delay_autoscale_up_by_secs).unwrap_or(0));
        if now - since < delay || !Self::cooled_down(state, now) {
            return None;
        }

        let mut shortfall_cpu = demand_cpu;
        if config.optimizing_shortfall_evaluator_enabled {
            // Idle instances can absorb part of the demand before new
            // capacity is provisioned.
            #[allow(clippy::cast_precision_loss)]
            let idle_cpu = observation.idle_instances.len() as f64 * slot_cpu;
            shortfall_cpu = (shortfall_cpu - idle_cpu).max(0.0);
            if shortfall_cpu == 0.0 {
                state.shortfall_since = None;
                return None;
            }
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let needed = ((shortfall_cpu / slot_cpu).ceil()
            * state.group.shortfall_adjusting_factor)
            .ceil() as u32;
        let target = needed
            .max(observation.current_size)
            .min(state.group.max);
        if target <= observation.current_size {
            return None;
        }
        state.shortfall_since = None;
        info!(group_id = %state.group.id, target, "scale up");
        let covered_cpu = f64::from(target - observation.current_size) * slot_cpu;
        Some((
            ScaleAction::ScaleUp {
                group_id: state.group.id.clone(),
                count: target,
            },
            covered_cpu,
        ))
    }

    fn evaluate_down(
        &self,
        state: &mut GroupState,
        observation: &GroupObservation,
        now: DateTime<Utc>,
    ) -> Option<ScaleAction> {
        let idle_count = u32::try_from(observation.idle_instances.len()).unwrap_or(u32::MAX);
        if idle_count <= state.group.max_idle_to_keep {
            state.idle_excess_since = None;
            return None;
        }
        let since = *state.idle_excess_since.get_or_insert(now);
        let delay =
            Duration::seconds(i64::try_from(self.config.delay_autoscale_down_by_secs).unwrap_or(0));
        if now - since < delay || !Self::cooled_down(state, now) {
            return None;
        }

        let floor = state.group.scale_down_floor();
        let excess = idle_count - state.group.max_idle_to_keep;
        let headroom = observation.current_size.saturating_sub(floor);
        let count = excess.min(headroom) as usize;
        if count == 0 {
            return None;
        }

        let mut candidates = observation.idle_instances.clone();
        self.order.order(&state.group, &mut candidates);
        candidates.retain(|id| self.permits_termination(&state.group, id));
        candidates.truncate(count);
        if candidates.is_empty() {
            return None;
        }

        state.idle_excess_since = None;
        info!(group_id = %state.group.id, count = candidates.len(), "scale down");
        Some(ScaleAction::ScaleDown {
            group_id: state.group.id.clone(),
            instance_ids: candidates,
        })
    }

    /// Weighted average of the scale-down constraint evaluators; below 0.5
    /// means the instance must not be terminated.
    fn permits_termination(&self, group: &InstanceGroup, instance_id: &str) -> bool {
        if self.constraints.is_empty() {
            return true;
        }
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for evaluator in &self.constraints {
            let weight = evaluator.weight().max(0.0);
            if weight == 0.0 {
                continue;
            }
            weighted += evaluator.evaluate(group, instance_id).clamp(0.0, 1.0) * weight;
            total_weight += weight;
        }
        if total_weight == 0.0 {
            return true;
        }
        weighted / total_weight >= 0.5
    }

    /// Execute actions through the cluster manager. Returns the instance
    /// ids that were NOT terminated so the caller can re-enable them in the
    /// offer pool.
    pub async fn execute(&self, actions: Vec<ScaleAction>) -> Vec<String> {
        let mut survivors = Vec::new();
        for action in actions {
            match action {
                ScaleAction::ScaleUp { group_id, count } => {
                    if let Err(err) = self.cluster.scale_up(&group_id, count).await {
                        warn!(group_id, %err, "scale up failed");
                    }
                }
                ScaleAction::ScaleDown {
                    group_id,
                    instance_ids,
                } => match self.cluster.scale_down(&group_id, instance_ids).await {
                    Ok(outcome) => survivors.extend(outcome.not_terminated),
                    Err(err) => warn!(group_id, %err, "scale down failed"),
                },
            }
        }
        survivors
    }

    pub fn known_groups(&self) -> Vec<InstanceGroup> {
        let groups = self.groups.lock().expect("autoscaler lock poisoned");
        let mut list: Vec<_> = groups.values().map(|s| s.group.clone()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}
