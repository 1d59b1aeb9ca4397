//! Domain error types.
//!
//! Typed errors for the two core loops, using thiserror. Everything
//! recoverable stays inside the loops and is surfaced via the event stream
//! or a per-call future; only a fatal scheduler error with the exit flag may
//! terminate the process.

use thiserror::Error;

/// Errors surfaced by the placement side (queue, offer pool, engine,
/// autoscaler).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Malformed task, offer or instance group; nothing was mutated.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operation attempted after shutdown; no state change.
    #[error("scheduler is shutting down")]
    ShutdownInProgress,

    /// Task could not be placed in this iteration.
    #[error("task {task_id} not placed: {reason}")]
    ConstraintViolation { task_id: String, reason: String },

    /// Too many concurrent placement-failure callback registrations.
    #[error("placement failure callback capacity ({0}) exceeded")]
    CapacityExceeded(usize),

    /// Aggregated unrecoverable scheduler failure.
    #[error("fatal scheduler error: {0}")]
    Fatal(String),
}

impl SchedulerError {
    /// True if the operation may succeed when retried later.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConstraintViolation { .. } | Self::CapacityExceeded(_)
        )
    }

    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Errors surfaced by the reconciliation side (engines and framework).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("reconciliation framework is shutting down")]
    ShutdownInProgress,

    /// The store driver reported failure before the timeout elapsed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store driver did not acknowledge the write in time.
    #[error("store update timeout after {elapsed_ms} ms")]
    StoreTimeout { elapsed_ms: u64 },

    /// The change action was cancelled by shutdown.
    #[error("change action cancelled: {0}")]
    ActionCancelled(String),

    /// An internal consistency rule was broken; the engine cannot continue.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ReconcileError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::StoreTimeout { .. })
    }

    pub const fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_error_display() {
        let err = SchedulerError::ConstraintViolation {
            task_id: "t-1".to_string(),
            reason: "insufficient cpu".to_string(),
        };
        assert_eq!(err.to_string(), "task t-1 not placed: insufficient cpu");

        let err = SchedulerError::CapacityExceeded(5);
        assert_eq!(
            err.to_string(),
            "placement failure callback capacity (5) exceeded"
        );
    }

    #[test]
    fn test_scheduler_error_classification() {
        assert!(SchedulerError::ConstraintViolation {
            task_id: "t".to_string(),
            reason: "r".to_string()
        }
        .is_transient());
        assert!(!SchedulerError::ShutdownInProgress.is_transient());
        assert!(SchedulerError::Fatal("boom".to_string()).is_fatal());
    }

    #[test]
    fn test_reconcile_error_display() {
        let err = ReconcileError::StoreTimeout { elapsed_ms: 5000 };
        assert_eq!(err.to_string(), "store update timeout after 5000 ms");
    }

    #[test]
    fn test_reconcile_error_classification() {
        assert!(ReconcileError::StoreTimeout { elapsed_ms: 5000 }.is_transient());
        assert!(ReconcileError::StoreUnavailable("down".to_string()).is_transient());
        assert!(ReconcileError::ShutdownInProgress.is_permanent());
        assert!(ReconcileError::InvariantViolation("dup id".to_string()).is_permanent());
    }
}
