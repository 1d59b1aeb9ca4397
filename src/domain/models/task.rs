//! Task domain model.
//!
//! A task is a single container workload belonging to a job. It is created
//! by the job subsystem at submission, mutated only by the reconciliation
//! engine that owns its job, and dropped once Finished and acknowledged by
//! the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::resources::ResourceSet;

/// Priority band governing scheduling order and autoscaling aggressiveness.
///
/// `Critical` drains before `Flex` in every placement iteration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Critical = 0,
    Flex = 1,
}

impl Default for Tier {
    fn default() -> Self {
        Self::Flex
    }
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Flex => "flex",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "flex" => Some(Self::Flex),
            _ => None,
        }
    }

    /// All tiers in scheduling order.
    pub fn ordered() -> [Tier; 2] {
        [Self::Critical, Self::Flex]
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted by the job subsystem, not yet queued for placement.
    Accepted,
    /// Waiting in the tiered queue for a matching offer.
    Queued,
    /// Matched to an offer; launch handed to the offer source.
    Launched,
    /// The agent acknowledged the launch and is starting the container.
    StartInitiated,
    /// The container is running.
    Started,
    /// A kill was requested and is in flight.
    KillInitiated,
    /// Terminal. The task will be removed once the store acknowledges it.
    Finished,
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Accepted
    }
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Queued => "queued",
            Self::Launched => "launched",
            Self::StartInitiated => "start_initiated",
            Self::Started => "started",
            Self::KillInitiated => "kill_initiated",
            Self::Finished => "finished",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "accepted" => Some(Self::Accepted),
            "queued" => Some(Self::Queued),
            "launched" => Some(Self::Launched),
            "start_initiated" => Some(Self::StartInitiated),
            "started" => Some(Self::Started),
            "kill_initiated" => Some(Self::KillInitiated),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }

    /// Valid transitions from this state.
    ///
    /// A kill can be initiated from any non-terminal state, and every
    /// non-terminal state may collapse straight to Finished when the agent
    /// reports a lost container.
    pub fn valid_transitions(&self) -> &'static [TaskState] {
        match self {
            Self::Accepted => &[Self::Queued, Self::KillInitiated, Self::Finished],
            Self::Queued => &[Self::Launched, Self::KillInitiated, Self::Finished],
            Self::Launched => &[Self::StartInitiated, Self::KillInitiated, Self::Finished],
            Self::StartInitiated => &[Self::Started, Self::KillInitiated, Self::Finished],
            Self::Started => &[Self::KillInitiated, Self::Finished],
            Self::KillInitiated => &[Self::Finished],
            Self::Finished => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// States in which the task occupies (or is about to occupy) agent
    /// resources.
    pub fn is_placed(&self) -> bool {
        matches!(
            self,
            Self::Launched | Self::StartInitiated | Self::Started | Self::KillInitiated
        )
    }
}

/// A single container workload awaiting or undergoing execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique identifier.
    pub id: String,
    /// The owning job (reconciliation root entity).
    pub job_id: String,
    /// Requested resources.
    pub resources: ResourceSet,
    pub tier: Tier,
    /// SLA bucket this task's consumption counts against.
    pub capacity_group: String,
    /// Named hard constraints resolved from the constraint registry.
    pub hard_constraints: Vec<String>,
    /// Named soft constraints with non-negative weights.
    pub soft_constraints: Vec<(String, f64)>,
    pub state: TaskState,
    /// Agent the task is placed on, present from Launched onward.
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, job_id: impl Into<String>, resources: ResourceSet) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            job_id: job_id.into(),
            resources,
            tier: Tier::default(),
            capacity_group: "default".to_string(),
            hard_constraints: Vec::new(),
            soft_constraints: Vec::new(),
            state: TaskState::default(),
            agent_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_capacity_group(mut self, group: impl Into<String>) -> Self {
        self.capacity_group = group.into();
        self
    }

    pub fn with_hard_constraint(mut self, name: impl Into<String>) -> Self {
        self.hard_constraints.push(name.into());
        self
    }

    pub fn with_soft_constraint(mut self, name: impl Into<String>, weight: f64) -> Self {
        self.soft_constraints.push((name.into(), weight));
        self
    }

    /// Transition to `next`, enforcing the state machine.
    pub fn transition_to(&mut self, next: TaskState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "invalid task transition from {} to {}",
                self.state.as_str(),
                next.as_str()
            ));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record placement on an agent, moving the task to Launched.
    pub fn mark_launched(&mut self, agent_id: impl Into<String>) -> Result<(), String> {
        self.transition_to(TaskState::Launched)?;
        self.agent_id = Some(agent_id.into());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Validate submission-time fields; nothing is mutated on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("task id cannot be empty".to_string());
        }
        if self.job_id.is_empty() {
            return Err("task job id cannot be empty".to_string());
        }
        if self.resources.is_empty() {
            return Err("task must request at least one resource".to_string());
        }
        if self.soft_constraints.iter().any(|(_, w)| *w < 0.0) {
            return Err("soft constraint weights must be non-negative".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("t-1", "job-1", ResourceSet::cpu_mem(1.0, 512))
    }

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Critical < Tier::Flex);
        assert_eq!(Tier::ordered(), [Tier::Critical, Tier::Flex]);
    }

    #[test]
    fn test_full_lifecycle_transitions() {
        let mut t = task();
        t.transition_to(TaskState::Queued).unwrap();
        t.mark_launched("agent-1").unwrap();
        t.transition_to(TaskState::StartInitiated).unwrap();
        t.transition_to(TaskState::Started).unwrap();
        t.transition_to(TaskState::Finished).unwrap();
        assert!(t.is_terminal());
        assert_eq!(t.agent_id.as_deref(), Some("agent-1"));
    }

    #[test]
    fn test_kill_from_any_non_terminal_state() {
        for state in [
            TaskState::Accepted,
            TaskState::Queued,
            TaskState::Launched,
            TaskState::StartInitiated,
            TaskState::Started,
        ] {
            assert!(state.can_transition_to(TaskState::KillInitiated), "{state:?}");
        }
        assert!(!TaskState::Finished.can_transition_to(TaskState::KillInitiated));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut t = task();
        assert!(t.transition_to(TaskState::Started).is_err());
        assert!(t.transition_to(TaskState::Launched).is_err());

        t.transition_to(TaskState::Queued).unwrap();
        t.transition_to(TaskState::Finished).unwrap();
        assert!(t.transition_to(TaskState::Queued).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(task().validate().is_ok());

        let empty_id = Task::new("", "job-1", ResourceSet::cpu_mem(1.0, 512));
        assert!(empty_id.validate().is_err());

        let no_resources = Task::new("t-2", "job-1", ResourceSet::none());
        assert!(no_resources.validate().is_err());

        let negative_weight = task().with_soft_constraint("bin-packing", -0.5);
        assert!(negative_weight.validate().is_err());
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            TaskState::Accepted,
            TaskState::Queued,
            TaskState::Launched,
            TaskState::StartInitiated,
            TaskState::Started,
            TaskState::KillInitiated,
            TaskState::Finished,
        ] {
            assert_eq!(TaskState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::from_str("bogus"), None);
    }
}
