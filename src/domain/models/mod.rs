//! Domain models for the scheduling and reconciliation core.

pub mod agent;
pub mod capacity;
pub mod event;
pub mod holder;
pub mod instance_group;
pub mod offer;
pub mod resources;
pub mod retry;
pub mod task;

pub use agent::{Agent, AgentHealth, AgentSnapshot, AgentStatusUpdate};
pub use capacity::{CapacityConsumption, CapacityGroupSla};
pub use event::{EventId, ReconcileEvent, ReconcileEventKind};
pub use holder::{EntityHolder, EntityPayload, JobDisposition, JobRecord, ModelKind};
pub use instance_group::{InstanceGroup, InstanceGroupEvent, ScaleAction};
pub use offer::{Offer, OfferRejectReason};
pub use resources::ResourceSet;
pub use retry::{RetryPolicy, Retryer};
pub use task::{Task, TaskState, Tier};
