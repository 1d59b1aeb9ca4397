//! Placement side of the core: tiered queue, offer pool, constraint
//! evaluation, the matching loop, and autoscaling.

pub mod autoscaler;
pub mod constraint;
pub mod engine;
pub mod offer_pool;
pub mod queue;

pub use autoscaler::{
    AutoscalerConfig, AutoscalerController, GroupObservation, ScaleDownConstraintEvaluator,
    ScaleDownOrderEvaluator, StableIdOrder,
};
pub use constraint::{
    ConstraintDecision, CpuBinPackingFitness, EvaluationContext, FitnessEvaluator,
    FleetAgentConstraint, HardConstraint, SoftConstraint, ZoneSpreadFitness,
};
pub use engine::{IterationOutcome, LaunchHandler, PlacementConfig, PlacementEngine};
pub use offer_pool::OfferPool;
pub use queue::TieredTaskQueue;
