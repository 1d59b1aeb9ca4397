//! Tiered task queue with capacity-group fair share.
//!
//! Tasks wait here between submission and placement. Each placement
//! iteration takes a deterministic snapshot ordered by tier, then by a
//! capacity-group fair-share round-robin, then FIFO within a group. Tasks
//! stay queued until the engine launches or removes them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use tracing::debug;

use crate::domain::error::SchedulerError;
use crate::domain::models::{CapacityGroupSla, ResourceSet, Task, Tier};

/// FIFO buckets per capacity group inside one tier.
#[derive(Debug, Default)]
struct TierQueue {
    slas: HashMap<String, CapacityGroupSla>,
    groups: BTreeMap<String, VecDeque<Task>>,
}

impl TierQueue {
    fn len(&self) -> usize {
        self.groups.values().map(VecDeque::len).sum()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    tiers: BTreeMap<Tier, TierQueue>,
    shut_down: bool,
}

/// Ordered multi-tier holding area for tasks awaiting placement.
#[derive(Debug, Default)]
pub struct TieredTaskQueue {
    inner: Mutex<QueueState>,
}

impl TieredTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a task into its tier's bucket. Fails once the queue is shut
    /// down, and on duplicate task ids (task ids are globally unique).
    pub fn enqueue(&self, task: Task) -> Result<(), SchedulerError> {
        task.validate().map_err(SchedulerError::InvalidInput)?;

        let mut state = self.inner.lock().expect("queue lock poisoned");
        if state.shut_down {
            return Err(SchedulerError::ShutdownInProgress);
        }
        let duplicate = state
            .tiers
            .values()
            .flat_map(|t| t.groups.values())
            .flatten()
            .any(|t| t.id == task.id);
        if duplicate {
            return Err(SchedulerError::InvalidInput(format!(
                "task {} is already queued",
                task.id
            )));
        }

        let tier = state.tiers.entry(task.tier).or_default();
        tier.groups
            .entry(task.capacity_group.clone())
            .or_default()
            .push_back(task);
        Ok(())
    }

    /// Idempotent removal; returns whether a task was present.
    pub fn remove(&self, task_id: &str, tier: Tier) -> bool {
        let mut state = self.inner.lock().expect("queue lock poisoned");
        let Some(tier_queue) = state.tiers.get_mut(&tier) else {
            return false;
        };
        for queue in tier_queue.groups.values_mut() {
            if let Some(pos) = queue.iter().position(|t| t.id == task_id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Atomically replace the per-tier SLAs; the next iteration uses them.
    pub fn set_slas(&self, slas: Vec<CapacityGroupSla>) -> Result<(), SchedulerError> {
        for sla in &slas {
            sla.validate().map_err(SchedulerError::InvalidInput)?;
        }
        let mut state = self.inner.lock().expect("queue lock poisoned");
        for tier_queue in state.tiers.values_mut() {
            tier_queue.slas.clear();
        }
        for sla in slas {
            let tier = state.tiers.entry(sla.tier).or_default();
            tier.slas.insert(sla.name.clone(), sla);
        }
        debug!("capacity group SLAs replaced");
        Ok(())
    }

    /// Snapshot for one placement iteration, ordered by (tier ascending,
    /// capacity-group fair share, FIFO within group).
    ///
    /// `usage` is the current per-group consumption of already-placed tasks;
    /// the snapshot adds the resources of every task it emits so that the
    /// guaranteed / max-with-buffer gates reflect in-iteration picks too.
    ///
    /// Fair share per tier: round-robin in group-name order among groups
    /// still below `guaranteed`; once no group qualifies, round-robin among
    /// groups below `max * (1 + buffer)`; groups above that are skipped.
    /// Groups without an SLA drain last with unbounded share.
    pub fn drain_for_iteration(&self, usage: &HashMap<String, ResourceSet>) -> Vec<Task> {
        let state = self.inner.lock().expect("queue lock poisoned");
        let mut ordered = Vec::new();

        for tier_queue in state.tiers.values() {
            let mut consumption: HashMap<&str, ResourceSet> = tier_queue
                .groups
                .keys()
                .map(|g| {
                    (
                        g.as_str(),
                        usage.get(g).cloned().unwrap_or_else(ResourceSet::none),
                    )
                })
                .collect();
            let mut pending: BTreeMap<&str, VecDeque<&Task>> = tier_queue
                .groups
                .iter()
                .map(|(g, q)| (g.as_str(), q.iter().collect()))
                .collect();

            // Guaranteed phase.
            Self::round_robin(&mut pending, &mut consumption, &mut ordered, |group, used| {
                tier_queue
                    .slas
                    .get(group)
                    .is_some_and(|sla| sla.below_guaranteed(used))
            });
            // Opportunistic phase up to max-with-buffer.
            Self::round_robin(&mut pending, &mut consumption, &mut ordered, |group, used| {
                tier_queue
                    .slas
                    .get(group)
                    .is_some_and(|sla| sla.below_max_with_buffer(used))
            });
            // Groups without an SLA drain last, unbounded.
            Self::round_robin(&mut pending, &mut consumption, &mut ordered, |group, _| {
                !tier_queue.slas.contains_key(group)
            });
        }
        ordered
    }

    fn round_robin<'a>(
        pending: &mut BTreeMap<&'a str, VecDeque<&Task>>,
        consumption: &mut HashMap<&'a str, ResourceSet>,
        ordered: &mut Vec<Task>,
        eligible: impl Fn(&str, &ResourceSet) -> bool,
    ) {
        loop {
            let mut progressed = false;
            for (group, queue) in pending.iter_mut() {
                let group = *group;
                if queue.is_empty() {
                    continue;
                }
                let used = consumption
                    .get(group)
                    .cloned()
                    .unwrap_or_else(ResourceSet::none);
                if !eligible(group, &used) {
                    continue;
                }
                let task = queue.pop_front().expect("non-empty queue");
                consumption.insert(group, used.add(&task.resources));
                ordered.push(task.clone());
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    /// Total queued tasks across tiers.
    pub fn len(&self) -> usize {
        let state = self.inner.lock().expect("queue lock poisoned");
        state.tiers.values().map(TierQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting tasks. Queued tasks remain drainable so an in-flight
    /// iteration can finish.
    pub fn shutdown(&self) {
        self.inner.lock().expect("queue lock poisoned").shut_down = true;
    }
}
