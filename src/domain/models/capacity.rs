//! Capacity group SLAs.

use serde::{Deserialize, Serialize};

use super::resources::ResourceSet;
use super::task::Tier;

/// Per-capacity-group service level: a guaranteed slice, a ceiling, and a
/// tolerance buffer on top of the ceiling.
///
/// The buffer applies to both admission and consumption comparison: a group
/// is throttled once its usage reaches `max * (1 + buffer)` in any bounded
/// dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityGroupSla {
    pub name: String,
    pub tier: Tier,
    pub guaranteed: ResourceSet,
    pub max: ResourceSet,
    /// Tolerance factor on top of `max`; must be >= 0.
    pub buffer: f64,
}

impl CapacityGroupSla {
    pub fn new(name: impl Into<String>, tier: Tier) -> Self {
        Self {
            name: name.into(),
            tier,
            guaranteed: ResourceSet::none(),
            max: ResourceSet::none(),
            buffer: 0.0,
        }
    }

    pub fn with_guaranteed(mut self, guaranteed: ResourceSet) -> Self {
        self.guaranteed = guaranteed;
        self
    }

    pub fn with_max(mut self, max: ResourceSet) -> Self {
        self.max = max;
        self
    }

    pub fn with_buffer(mut self, buffer: f64) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("capacity group name cannot be empty".to_string());
        }
        if self.buffer < 0.0 {
            return Err(format!(
                "capacity group {} buffer must be >= 0, got {}",
                self.name, self.buffer
            ));
        }
        Ok(())
    }

    /// `max` with the buffer applied; the level above which the group is
    /// skipped entirely.
    pub fn max_with_buffer(&self) -> ResourceSet {
        self.max.scaled(1.0 + self.buffer)
    }

    /// True while the group's usage is still below its guaranteed slice.
    pub fn below_guaranteed(&self, usage: &ResourceSet) -> bool {
        !usage.at_capacity(&self.guaranteed)
    }

    /// True while the group's usage is still below `max * (1 + buffer)`.
    pub fn below_max_with_buffer(&self, usage: &ResourceSet) -> bool {
        !usage.at_capacity(&self.max_with_buffer())
    }
}

/// Consumption reported for one capacity group after an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityConsumption {
    pub group: String,
    pub tier: Tier,
    pub guaranteed: ResourceSet,
    pub max: ResourceSet,
    pub used: ResourceSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sla() -> CapacityGroupSla {
        CapacityGroupSla::new("batch", Tier::Flex)
            .with_guaranteed(ResourceSet::cpu_mem(4.0, 0))
            .with_max(ResourceSet::cpu_mem(8.0, 0))
            .with_buffer(0.25)
    }

    #[test]
    fn test_below_guaranteed() {
        let sla = sla();
        assert!(sla.below_guaranteed(&ResourceSet::cpu_mem(3.0, 0)));
        assert!(!sla.below_guaranteed(&ResourceSet::cpu_mem(4.0, 0)));
    }

    #[test]
    fn test_buffer_applies_to_max() {
        let sla = sla();
        // 8 * 1.25 = 10 cpus
        assert!(sla.below_max_with_buffer(&ResourceSet::cpu_mem(9.9, 0)));
        assert!(!sla.below_max_with_buffer(&ResourceSet::cpu_mem(10.0, 0)));
    }

    #[test]
    fn test_validate_rejects_negative_buffer() {
        let bad = sla().with_buffer(-0.1);
        assert!(bad.validate().is_err());
        assert!(sla().validate().is_ok());
    }
}
