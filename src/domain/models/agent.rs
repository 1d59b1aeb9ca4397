//! Agent (worker node) domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::resources::ResourceSet;

/// Health as reported by the agent status monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Healthy,
    Unhealthy,
}

/// A status record emitted by the external agent status monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusUpdate {
    pub agent_id: String,
    pub health: AgentHealth,
    /// How long to keep the agent out of placement, for Unhealthy records.
    pub disable_ms: Option<u64>,
}

/// A worker node known to the offer pool.
///
/// An agent is created when its first offer arrives and removed once it is
/// marked inactive and all of its tasks have migrated away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub hostname: String,
    /// Free-form attributes; includes the instance-group and zone tags.
    pub attributes: BTreeMap<String, String>,
    /// Total resources the agent advertises.
    pub total_resources: ResourceSet,
    /// Ids of tasks currently placed on this agent.
    pub running_tasks: BTreeSet<String>,
    /// Epoch milliseconds until which the agent is disabled; 0 = enabled.
    pub disabled_until_ms: i64,
}

impl Agent {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            attributes: BTreeMap::new(),
            total_resources: ResourceSet::none(),
            running_tasks: BTreeSet::new(),
            disabled_until_ms: 0,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_total_resources(mut self, resources: ResourceSet) -> Self {
        self.total_resources = resources;
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_disabled_at(&self, now: DateTime<Utc>) -> bool {
        self.disabled_until_ms > now.timestamp_millis()
    }
}

/// Immutable per-iteration view of one agent, produced by the offer pool
/// snapshot and consumed by constraint evaluation and matching.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub hostname: String,
    pub attributes: BTreeMap<String, String>,
    /// Aggregated resources across the agent's live offers.
    pub available: ResourceSet,
    /// Ids of the offers backing `available`, consumed keep-together.
    pub offer_ids: Vec<String>,
    /// Number of tasks already running on the agent before this iteration.
    pub running_task_count: usize,
}

impl AgentSnapshot {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_agent_disable_window() {
        let mut agent = Agent::new("a1", "host-1");
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(!agent.is_disabled_at(now));

        agent.disabled_until_ms = now.timestamp_millis() + 60_000;
        assert!(agent.is_disabled_at(now));
        assert!(!agent.is_disabled_at(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_agent_attributes() {
        let agent = Agent::new("a1", "host-1")
            .with_attribute("zone", "us-east-1a")
            .with_attribute("asg", "flex-group");
        assert_eq!(agent.attribute("zone"), Some("us-east-1a"));
        assert_eq!(agent.attribute("missing"), None);
    }
}
