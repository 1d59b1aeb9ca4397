//! Hard constraints and soft fitness scoring.
//!
//! The placement engine is polymorphic over two capability sets: hard
//! constraints admit or reject an agent outright; soft constraints score
//! admissible agents in `[0, 1]`, higher is better. A fleet-global pair is
//! always applied first, then the task's named constraints resolved from
//! the registry.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::domain::models::{AgentSnapshot, Task};

/// Outcome of a hard-constraint check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintDecision {
    pub ok: bool,
    pub reason: String,
}

impl ConstraintDecision {
    pub fn admit() -> Self {
        Self {
            ok: true,
            reason: String::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
        }
    }
}

/// Shared per-iteration state visible to constraints.
#[derive(Debug, Default, Clone)]
pub struct EvaluationContext {
    /// Tasks assigned to each agent so far in this iteration.
    pub assigned_counts: HashMap<String, usize>,
    /// Tasks assigned to each zone so far in this iteration.
    pub assigned_zone_counts: HashMap<String, usize>,
    /// Agent attribute that distinguishes active from drain-only agents.
    pub active_agent_attribute: String,
}

impl EvaluationContext {
    pub fn new(active_agent_attribute: impl Into<String>) -> Self {
        Self {
            active_agent_attribute: active_agent_attribute.into(),
            ..Self::default()
        }
    }

    pub fn record_assignment(&mut self, agent: &AgentSnapshot) {
        *self
            .assigned_counts
            .entry(agent.agent_id.clone())
            .or_insert(0) += 1;
        if let Some(zone) = agent.attribute("zone") {
            *self
                .assigned_zone_counts
                .entry(zone.to_string())
                .or_insert(0) += 1;
        }
    }
}

/// Binary admit/reject check.
pub trait HardConstraint: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per iteration before any evaluation; default no-op.
    fn prepare(&self) {}

    fn evaluate(
        &self,
        task: &Task,
        agent: &AgentSnapshot,
        ctx: &EvaluationContext,
    ) -> ConstraintDecision;
}

/// Fitness preference; must return a value in `[0, 1]`.
pub trait SoftConstraint: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, task: &Task, agent: &AgentSnapshot, ctx: &EvaluationContext) -> f64;
}

/// Fleet-global hard constraint: drain-only agents are excluded, and agents
/// whose `gpus` consumable pool is drained are reserved for GPU workloads
/// (a task with `gpus == 0` is never considered for them).
pub struct FleetAgentConstraint;

impl HardConstraint for FleetAgentConstraint {
    fn name(&self) -> &str {
        "fleet-agent"
    }

    fn evaluate(
        &self,
        task: &Task,
        agent: &AgentSnapshot,
        ctx: &EvaluationContext,
    ) -> ConstraintDecision {
        if !ctx.active_agent_attribute.is_empty() {
            if let Some(value) = agent.attribute(&ctx.active_agent_attribute) {
                if value != "true" {
                    return ConstraintDecision::reject("agent not active");
                }
            }
        }
        if task.resources.gpus == 0 {
            if let Some(pool) = agent.available.consumables.get("gpus") {
                if *pool == 0 {
                    return ConstraintDecision::reject("gpu agent reserved");
                }
            }
        }
        ConstraintDecision::admit()
    }
}

/// Fleet-global soft constraint: bin-pack by remaining CPU so partially
/// filled agents fill up before empty ones.
pub struct CpuBinPackingFitness;

impl SoftConstraint for CpuBinPackingFitness {
    fn name(&self) -> &str {
        "cpu-bin-packing"
    }

    fn score(&self, _task: &Task, agent: &AgentSnapshot, _ctx: &EvaluationContext) -> f64 {
        1.0 / (1.0 + agent.available.cpu.max(0.0))
    }
}

/// Soft constraint spreading a job's tasks across zones: a zone nobody was
/// assigned to this iteration scores 1, otherwise the score decays with the
/// zone's assignment count.
pub struct ZoneSpreadFitness;

impl SoftConstraint for ZoneSpreadFitness {
    fn name(&self) -> &str {
        "zone-spread"
    }

    fn score(&self, _task: &Task, agent: &AgentSnapshot, ctx: &EvaluationContext) -> f64 {
        let Some(zone) = agent.attribute("zone") else {
            return 0.5;
        };
        let count = ctx.assigned_zone_counts.get(zone).copied().unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let count = count as f64;
        1.0 / (1.0 + count)
    }
}

/// A scored admissible candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub agent_index: usize,
    pub fitness: f64,
}

/// Composes global and per-task constraints for the placement engine.
pub struct FitnessEvaluator {
    global_hard: Arc<dyn HardConstraint>,
    global_soft: Arc<dyn SoftConstraint>,
    hard_registry: HashMap<String, Arc<dyn HardConstraint>>,
    soft_registry: HashMap<String, Arc<dyn SoftConstraint>>,
    /// Candidates scoring at or above this value short-circuit evaluation
    /// of further agents.
    fitness_good_enough: f64,
}

impl FitnessEvaluator {
    pub fn new(fitness_good_enough: f64) -> Self {
        Self {
            global_hard: Arc::new(FleetAgentConstraint),
            global_soft: Arc::new(CpuBinPackingFitness),
            hard_registry: HashMap::new(),
            soft_registry: HashMap::new(),
            fitness_good_enough: fitness_good_enough.clamp(0.0, 1.0),
        }
    }

    pub fn with_global_hard(mut self, constraint: Arc<dyn HardConstraint>) -> Self {
        self.global_hard = constraint;
        self
    }

    pub fn with_global_soft(mut self, constraint: Arc<dyn SoftConstraint>) -> Self {
        self.global_soft = constraint;
        self
    }

    pub fn register_hard(&mut self, constraint: Arc<dyn HardConstraint>) {
        self.hard_registry
            .insert(constraint.name().to_string(), constraint);
    }

    pub fn register_soft(&mut self, constraint: Arc<dyn SoftConstraint>) {
        self.soft_registry
            .insert(constraint.name().to_string(), constraint);
    }

    /// Iteration pre-hook: let the global hard constraint refresh whatever
    /// state it caches.
    pub fn prepare(&self) {
        self.global_hard.prepare();
        for constraint in self.hard_registry.values() {
            constraint.prepare();
        }
    }

    /// Run all hard constraints; the first rejection wins.
    pub fn admits(
        &self,
        task: &Task,
        agent: &AgentSnapshot,
        ctx: &EvaluationContext,
    ) -> ConstraintDecision {
        let decision = self.global_hard.evaluate(task, agent, ctx);
        if !decision.ok {
            return decision;
        }
        for name in &task.hard_constraints {
            let Some(constraint) = self.hard_registry.get(name) else {
                return ConstraintDecision::reject(format!("unknown hard constraint {name}"));
            };
            let decision = constraint.evaluate(task, agent, ctx);
            if !decision.ok {
                return decision;
            }
        }
        ConstraintDecision::admit()
    }

    /// Weighted-sum fitness over the global soft constraint (weight 1) and
    /// the task's named soft constraints, normalized to `[0, 1]`.
    pub fn fitness(&self, task: &Task, agent: &AgentSnapshot, ctx: &EvaluationContext) -> f64 {
        let mut weighted = self.global_soft.score(task, agent, ctx).clamp(0.0, 1.0);
        let mut total_weight = 1.0;
        for (name, weight) in &task.soft_constraints {
            let Some(constraint) = self.soft_registry.get(name) else {
                continue;
            };
            if *weight <= 0.0 {
                continue;
            }
            weighted += constraint.score(task, agent, ctx).clamp(0.0, 1.0) * weight;
            total_weight += weight;
        }
        weighted / total_weight
    }

    /// Pick the best admissible agent among `agents` whose `remaining`
    /// resources satisfy the task. Returns the winning candidate, or the
    /// reason evaluation failed everywhere.
    ///
    /// Ties on fitness break by (1) fewer tasks assigned this iteration,
    /// (2) larger remaining CPU, (3) stable hash of (agent id, task id).
    pub fn select(
        &self,
        task: &Task,
        agents: &[AgentSnapshot],
        remaining: &[crate::domain::models::ResourceSet],
        ctx: &EvaluationContext,
    ) -> Result<Candidate, String> {
        let mut last_reason = if agents.is_empty() {
            "no agents available".to_string()
        } else {
            "insufficient cpu".to_string()
        };
        let mut best: Option<Candidate> = None;

        for (index, agent) in agents.iter().enumerate() {
            let decision = self.admits(task, agent, ctx);
            if !decision.ok {
                last_reason = decision.reason;
                continue;
            }
            if !task.resources.fits_within(&remaining[index]) {
                last_reason = Self::shortage_reason(task, &remaining[index]);
                continue;
            }
            let fitness = self.fitness(task, agent, ctx);
            let candidate = Candidate {
                agent_index: index,
                fitness,
            };
            let replace = match &best {
                None => true,
                Some(current) => {
                    self.prefers(task, agents, remaining, ctx, &candidate, current)
                }
            };
            if replace {
                best = Some(candidate);
            }
            if let Some(current) = &best {
                if current.fitness >= self.fitness_good_enough {
                    break;
                }
            }
        }

        best.ok_or(last_reason)
    }

    /// True when `a` beats `b` under the fitness-then-tie-break order.
    fn prefers(
        &self,
        task: &Task,
        agents: &[AgentSnapshot],
        remaining: &[crate::domain::models::ResourceSet],
        ctx: &EvaluationContext,
        a: &Candidate,
        b: &Candidate,
    ) -> bool {
        if (a.fitness - b.fitness).abs() > f64::EPSILON {
            return a.fitness > b.fitness;
        }
        let agent_a = &agents[a.agent_index];
        let agent_b = &agents[b.agent_index];
        let assigned_a = ctx.assigned_counts.get(&agent_a.agent_id).copied().unwrap_or(0);
        let assigned_b = ctx.assigned_counts.get(&agent_b.agent_id).copied().unwrap_or(0);
        if assigned_a != assigned_b {
            return assigned_a < assigned_b;
        }
        let cpu_a = remaining[a.agent_index].cpu;
        let cpu_b = remaining[b.agent_index].cpu;
        if (cpu_a - cpu_b).abs() > f64::EPSILON {
            return cpu_a > cpu_b;
        }
        stable_hash(&agent_a.agent_id, &task.id) < stable_hash(&agent_b.agent_id, &task.id)
    }

    fn shortage_reason(
        task: &Task,
        remaining: &crate::domain::models::ResourceSet,
    ) -> String {
        if task.resources.cpu > remaining.cpu {
            "insufficient cpu".to_string()
        } else if task.resources.memory_mb > remaining.memory_mb {
            "insufficient memory".to_string()
        } else if task.resources.disk_mb > remaining.disk_mb {
            "insufficient disk".to_string()
        } else if task.resources.gpus > remaining.gpus {
            "insufficient gpus".to_string()
        } else {
            "insufficient resources".to_string()
        }
    }
}

/// Deterministic hash for the final placement tie-break.
fn stable_hash(agent_id: &str, task_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    agent_id.hash(&mut hasher);
    task_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ResourceSet;
    use std::collections::BTreeMap;

    fn snapshot(id: &str, cpu: f64) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: id.to_string(),
            hostname: format!("host-{id}"),
            attributes: BTreeMap::new(),
            available: ResourceSet::cpu_mem(cpu, 8192),
            offer_ids: vec![format!("offer-{id}")],
            running_task_count: 0,
        }
    }

    fn task(cpu: f64) -> Task {
        Task::new("t-1", "job-1", ResourceSet::cpu_mem(cpu, 1024))
    }

    #[test]
    fn test_fleet_constraint_rejects_inactive_agent() {
        let ctx = EvaluationContext::new("active");
        let mut agent = snapshot("a1", 4.0);
        agent
            .attributes
            .insert("active".to_string(), "false".to_string());

        let decision = FleetAgentConstraint.evaluate(&task(1.0), &agent, &ctx);
        assert!(!decision.ok);
        assert_eq!(decision.reason, "agent not active");
    }

    #[test]
    fn test_fleet_constraint_reserves_drained_gpu_agents() {
        let ctx = EvaluationContext::new("");
        let mut agent = snapshot("a1", 4.0);
        agent.available.consumables.insert("gpus".to_string(), 0);

        let decision = FleetAgentConstraint.evaluate(&task(1.0), &agent, &ctx);
        assert!(!decision.ok);
        assert_eq!(decision.reason, "gpu agent reserved");

        // A GPU task is still admissible subject to the resource check.
        let mut gpu_task = task(1.0);
        gpu_task.resources.gpus = 1;
        assert!(FleetAgentConstraint.evaluate(&gpu_task, &agent, &ctx).ok);
    }

    #[test]
    fn test_select_prefers_bin_packing() {
        let evaluator = FitnessEvaluator::new(1.0);
        let agents = vec![snapshot("big", 16.0), snapshot("small", 4.0)];
        let remaining: Vec<_> = agents.iter().map(|a| a.available.clone()).collect();
        let ctx = EvaluationContext::new("");

        let winner = evaluator
            .select(&task(2.0), &agents, &remaining, &ctx)
            .unwrap();
        assert_eq!(agents[winner.agent_index].agent_id, "small");
    }

    #[test]
    fn test_select_reports_insufficient_cpu() {
        let evaluator = FitnessEvaluator::new(1.0);
        let agents = vec![snapshot("a1", 1.0)];
        let remaining: Vec<_> = agents.iter().map(|a| a.available.clone()).collect();
        let ctx = EvaluationContext::new("");

        let err = evaluator
            .select(&task(3.0), &agents, &remaining, &ctx)
            .unwrap_err();
        assert_eq!(err, "insufficient cpu");
    }

    #[test]
    fn test_unknown_hard_constraint_rejects() {
        let evaluator = FitnessEvaluator::new(1.0);
        let agents = vec![snapshot("a1", 4.0)];
        let remaining: Vec<_> = agents.iter().map(|a| a.available.clone()).collect();
        let ctx = EvaluationContext::new("");
        let task = task(1.0).with_hard_constraint("does-not-exist");

        let err = evaluator.select(&task, &agents, &remaining, &ctx).unwrap_err();
        assert!(err.contains("unknown hard constraint"));
    }

    #[test]
    fn test_tie_break_fewer_assignments_first() {
        let evaluator = FitnessEvaluator::new(1.0);
        let agents = vec![snapshot("a1", 4.0), snapshot("a2", 4.0)];
        let remaining: Vec<_> = agents.iter().map(|a| a.available.clone()).collect();
        let mut ctx = EvaluationContext::new("");
        ctx.assigned_counts.insert("a1".to_string(), 2);

        let winner = evaluator
            .select(&task(1.0), &agents, &remaining, &ctx)
            .unwrap();
        assert_eq!(agents[winner.agent_index].agent_id, "a2");
    }

    #[test]
    fn test_good_enough_short_circuits() {
        // Threshold 0: the first admissible agent wins outright.
        let evaluator = FitnessEvaluator::new(0.0);
        let agents = vec![snapshot("a1", 16.0), snapshot("a2", 1.0)];
        let remaining: Vec<_> = agents.iter().map(|a| a.available.clone()).collect();
        let ctx = EvaluationContext::new("");

        let winner = evaluator
            .select(&task(1.0), &agents, &remaining, &ctx)
            .unwrap();
        assert_eq!(agents[winner.agent_index].agent_id, "a1");
    }

    #[test]
    fn test_zone_spread_decays_with_assignments() {
        let mut ctx = EvaluationContext::new("");
        let mut agent = snapshot("a1", 4.0);
        agent
            .attributes
            .insert("zone".to_string(), "us-east-1a".to_string());

        let fresh = ZoneSpreadFitness.score(&task(1.0), &agent, &ctx);
        ctx.assigned_zone_counts.insert("us-east-1a".to_string(), 2);
        let crowded = ZoneSpreadFitness.score(&task(1.0), &agent, &ctx);
        assert!(fresh > crowded);
    }

    #[test]
    fn test_fitness_weighted_sum_normalized() {
        let mut evaluator = FitnessEvaluator::new(1.0);
        evaluator.register_soft(Arc::new(ZoneSpreadFitness));
        let agents = vec![snapshot("a1", 4.0)];
        let ctx = EvaluationContext::new("");
        let task = task(1.0).with_soft_constraint("zone-spread", 3.0);

        let score = evaluator.fitness(&task, &agents[0], &ctx);
        assert!((0.0..=1.0).contains(&score));
    }
}
