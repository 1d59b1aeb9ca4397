//! Cluster manager port.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::error::SchedulerError;
use crate::domain::models::InstanceGroupEvent;

/// Outcome of a scale-down request: which instances actually terminated
/// and which survived (to be re-enabled in the offer pool).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleDownOutcome {
    pub terminated: Vec<String>,
    pub not_terminated: Vec<String>,
}

/// External cluster management collaborator executing scale actions.
#[async_trait]
pub trait ClusterManager: Send + Sync {
    /// Grow the group to `count` instances.
    async fn scale_up(&self, group_id: &str, count: u32) -> Result<(), SchedulerError>;

    /// Terminate specific instances; the subset that was NOT terminated is
    /// returned so the caller can re-enable them.
    async fn scale_down(
        &self,
        group_id: &str,
        instance_ids: Vec<String>,
    ) -> Result<ScaleDownOutcome, SchedulerError>;

    /// Subscribe to instance-group add/update/remove notifications.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<InstanceGroupEvent>;
}
