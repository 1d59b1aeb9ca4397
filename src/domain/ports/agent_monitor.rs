//! Agent status monitor port.

use tokio::sync::mpsc;

use crate::domain::models::AgentStatusUpdate;

/// External health monitor for fleet agents.
///
/// The core consumes the stream and enables/disables agents in the offer
/// pool accordingly; how health is determined is the collaborator's concern.
pub trait AgentStatusMonitor: Send + Sync {
    /// Subscribe to per-instance health records.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentStatusUpdate>;
}
