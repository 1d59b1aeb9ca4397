//! Instance groups and autoscaling rules.

use serde::{Deserialize, Serialize};

use super::task::Tier;

/// A scalable pool of identical agents (e.g. one cloud autoscaling group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub id: String,
    /// The priority band this group serves; unmet demand in that tier
    /// drives the group's scale-up.
    pub tier: Tier,
    pub min: u32,
    pub max: u32,
    pub min_idle_to_keep: u32,
    pub max_idle_to_keep: u32,
    pub cool_down_secs: u64,
    /// Lower value scales first when several groups have shortfall.
    pub priority: u32,
    /// Multiplier on the computed shortfall target; must be >= 1.
    pub shortfall_adjusting_factor: f64,
}

impl InstanceGroup {
    pub fn new(id: impl Into<String>, min: u32, max: u32) -> Self {
        Self {
            id: id.into(),
            tier: Tier::default(),
            min,
            max,
            min_idle_to_keep: 0,
            max_idle_to_keep: 0,
            cool_down_secs: 0,
            priority: 0,
            shortfall_adjusting_factor: 1.0,
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_idle_range(mut self, min_idle: u32, max_idle: u32) -> Self {
        self.min_idle_to_keep = min_idle;
        self.max_idle_to_keep = max_idle;
        self
    }

    pub fn with_cool_down(mut self, cool_down_secs: u64) -> Self {
        self.cool_down_secs = cool_down_secs;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_shortfall_adjusting_factor(mut self, factor: f64) -> Self {
        self.shortfall_adjusting_factor = factor;
        self
    }

    /// Enforce the structural invariants; rejected groups are never admitted
    /// into the autoscaler.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("instance group id cannot be empty".to_string());
        }
        if self.min > self.max {
            return Err(format!(
                "instance group {}: min ({}) must be <= max ({})",
                self.id, self.min, self.max
            ));
        }
        if self.min_idle_to_keep > self.max_idle_to_keep {
            return Err(format!(
                "instance group {}: minIdleToKeep ({}) must be <= maxIdleToKeep ({})",
                self.id, self.min_idle_to_keep, self.max_idle_to_keep
            ));
        }
        if self.shortfall_adjusting_factor < 1.0 {
            return Err(format!(
                "instance group {}: shortfallAdjustingFactor must be >= 1, got {}",
                self.id, self.shortfall_adjusting_factor
            ));
        }
        Ok(())
    }

    /// The size below which scale-down never goes.
    pub fn scale_down_floor(&self) -> u32 {
        self.min.max(self.min_idle_to_keep)
    }
}

/// Scaling decision produced by the autoscaler controller; executing it is
/// delegated to the cluster manager collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScaleAction {
    ScaleUp {
        group_id: String,
        /// Desired instance count (absolute target, not a delta).
        count: u32,
    },
    ScaleDown {
        group_id: String,
        instance_ids: Vec<String>,
    },
}

impl ScaleAction {
    pub fn group_id(&self) -> &str {
        match self {
            Self::ScaleUp { group_id, .. } | Self::ScaleDown { group_id, .. } => group_id,
        }
    }
}

/// Instance-group lifecycle notification from the cluster manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstanceGroupEvent {
    Added(InstanceGroup),
    Updated(InstanceGroup),
    Removed { group_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_invariants() {
        assert!(InstanceGroup::new("g", 1, 10).validate().is_ok());
        assert!(InstanceGroup::new("g", 10, 1).validate().is_err());
        assert!(InstanceGroup::new("g", 0, 5)
            .with_idle_range(3, 1)
            .validate()
            .is_err());
        assert!(InstanceGroup::new("g", 0, 5)
            .with_shortfall_adjusting_factor(0.5)
            .validate()
            .is_err());
        assert!(InstanceGroup::new("", 0, 5).validate().is_err());
    }

    #[test]
    fn test_tier_defaults_to_flex() {
        assert_eq!(InstanceGroup::new("g", 0, 5).tier, Tier::Flex);
        assert_eq!(
            InstanceGroup::new("g", 0, 5).with_tier(Tier::Critical).tier,
            Tier::Critical
        );
    }

    #[test]
    fn test_scale_down_floor() {
        let group = InstanceGroup::new("g", 2, 10).with_idle_range(4, 6);
        assert_eq!(group.scale_down_floor(), 4);

        let group = InstanceGroup::new("g", 5, 10).with_idle_range(1, 6);
        assert_eq!(group.scale_down_floor(), 5);
    }
}
