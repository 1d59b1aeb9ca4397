//! Reconciliation side of the core: three-model engines, the framework
//! loop that owns them, and the typed model-update machinery.

pub mod actions;
pub mod engine;
pub mod framework;
pub mod job_actions;

pub use actions::{
    ChangeAction, ChangeFailure, ChangeResult, EntityPath, ModelOp, ModelSet, ModelUpdateAction,
};
pub use engine::{ReconciliationEngine, TriggerResult};
pub use framework::{FrameworkConfig, OrderCriterion, ReconciliationFramework};
pub use job_actions::{
    AddTaskAction, KillJobAction, KillTaskAction, NoopLifecycleListener, PersistFinishedAction,
    RecordTaskStateAction, RemoveFinishedAction, TaskLaunchedAction, TaskLifecycleListener,
};
