//! Metrics registry port.
//!
//! Components acquire counter/gauge/timer handles at construction; there is
//! no process-wide singleton state in the core. Handles are the only fully
//! concurrent shared state in the system.

use std::sync::Arc;
use std::time::Duration;

/// Monotonically increasing counter handle.
pub trait Counter: Send + Sync {
    fn increment(&self, value: u64);
}

/// Last-observation gauge handle.
pub trait Gauge: Send + Sync {
    fn set(&self, value: f64);
}

/// Duration recorder handle.
pub trait Timer: Send + Sync {
    fn record(&self, duration: Duration);
}

/// Factory for metric handles.
pub trait MetricsRegistry: Send + Sync {
    fn counter(&self, name: &str) -> Arc<dyn Counter>;
    fn gauge(&self, name: &str) -> Arc<dyn Gauge>;
    fn timer(&self, name: &str) -> Arc<dyn Timer>;
}

/// A registry that drops every observation. Default for components whose
/// caller does not care about metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

struct NoopHandle;

impl Counter for NoopHandle {
    fn increment(&self, _value: u64) {}
}

impl Gauge for NoopHandle {
    fn set(&self, _value: f64) {}
}

impl Timer for NoopHandle {
    fn record(&self, _duration: Duration) {}
}

impl MetricsRegistry for NoopMetrics {
    fn counter(&self, _name: &str) -> Arc<dyn Counter> {
        Arc::new(NoopHandle)
    }

    fn gauge(&self, _name: &str) -> Arc<dyn Gauge> {
        Arc::new(NoopHandle)
    }

    fn timer(&self, _name: &str) -> Arc<dyn Timer> {
        Arc::new(NoopHandle)
    }
}
