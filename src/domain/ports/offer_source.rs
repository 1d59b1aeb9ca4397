//! Offer source port.
//!
//! The external system that issues resource offers, accepts launches, and
//! takes rejected offers back. Wire format is the collaborator's concern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::models::{Offer, OfferRejectReason, ResourceSet};

/// Rescind notification naming a single offer or everything at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferRescind {
    Offer(String),
    All,
}

impl OfferRescind {
    /// Parse the wire sentinel: `"ALL"` rescinds every offer.
    pub fn from_wire(id: &str) -> Self {
        if id == "ALL" {
            Self::All
        } else {
            Self::Offer(id.to_string())
        }
    }
}

/// One task launch bound to the offers funding it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLaunch {
    pub task_id: String,
    pub agent_id: String,
    pub resources: ResourceSet,
    /// Offers consumed by this launch.
    pub offer_ids: Vec<String>,
}

/// Per-launch outcome from the offer source; a rejected launch frees its
/// resources while the offer still expires normally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchResult {
    pub task_id: String,
    pub accepted: bool,
    pub reason: Option<String>,
}

impl LaunchResult {
    pub fn accepted(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// External offer/launch collaborator.
#[async_trait]
pub trait OfferSource: Send + Sync {
    /// Hand an unused or expired offer back.
    async fn reject_lease(&self, offer_id: &str, reason: OfferRejectReason);

    /// Launch tasks against consumed offers. The source may reject
    /// individual launches (e.g. a task cancelled mid-iteration).
    async fn launch_tasks(&self, launches: Vec<TaskLaunch>, offers: Vec<Offer>)
        -> Vec<LaunchResult>;

    /// Ask the agent to kill a running task.
    async fn kill_task(&self, task_id: &str, agent_id: &str, reason: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescind_sentinel() {
        assert_eq!(OfferRescind::from_wire("ALL"), OfferRescind::All);
        assert_eq!(
            OfferRescind::from_wire("offer-7"),
            OfferRescind::Offer("offer-7".to_string())
        );
    }
}
