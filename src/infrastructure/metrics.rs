//! Metrics adapters.
//!
//! [`FacadeMetrics`] forwards handle operations to the `metrics` facade
//! crate so any installed exporter picks them up. [`RecordingMetrics`]
//! keeps observations in memory for test assertions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::ports::{Counter, Gauge, MetricsRegistry, Timer};

/// Production registry backed by the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

struct FacadeCounter(String);

impl Counter for FacadeCounter {
    fn increment(&self, value: u64) {
        metrics::counter!(self.0.clone()).increment(value);
    }
}

struct FacadeGauge(String);

impl Gauge for FacadeGauge {
    fn set(&self, value: f64) {
        metrics::gauge!(self.0.clone()).set(value);
    }
}

struct FacadeTimer(String);

impl Timer for FacadeTimer {
    fn record(&self, duration: Duration) {
        metrics::histogram!(self.0.clone()).record(duration.as_secs_f64());
    }
}

impl MetricsRegistry for FacadeMetrics {
    fn counter(&self, name: &str) -> Arc<dyn Counter> {
        Arc::new(FacadeCounter(name.to_string()))
    }

    fn gauge(&self, name: &str) -> Arc<dyn Gauge> {
        Arc::new(FacadeGauge(name.to_string()))
    }

    fn timer(&self, name: &str) -> Arc<dyn Timer> {
        Arc::new(FacadeTimer(name.to_string()))
    }
}

#[derive(Debug, Default)]
struct Recorded {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    timings: HashMap<String, Vec<Duration>>,
}

/// Test registry remembering every observation.
#[derive(Debug, Default, Clone)]
pub struct RecordingMetrics {
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.recorded
            .lock()
            .expect("metrics lock poisoned")
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.recorded
            .lock()
            .expect("metrics lock poisoned")
            .gauges
            .get(name)
            .copied()
    }

    pub fn timing_count(&self, name: &str) -> usize {
        self.recorded
            .lock()
            .expect("metrics lock poisoned")
            .timings
            .get(name)
            .map_or(0, Vec::len)
    }
}

struct RecordingCounter {
    name: String,
    recorded: Arc<Mutex<Recorded>>,
}

impl Counter for RecordingCounter {
    fn increment(&self, value: u64) {
        let mut recorded = self.recorded.lock().expect("metrics lock poisoned");
        *recorded.counters.entry(self.name.clone()).or_insert(0) += value;
    }
}

struct RecordingGauge {
    name: String,
    recorded: Arc<Mutex<Recorded>>,
}

impl Gauge for RecordingGauge {
    fn set(&self, value: f64) {
        let mut recorded = self.recorded.lock().expect("metrics lock poisoned");
        recorded.gauges.insert(self.name.clone(), value);
    }
}

struct RecordingTimer {
    name: String,
    recorded: Arc<Mutex<Recorded>>,
}

impl Timer for RecordingTimer {
    fn record(&self, duration: Duration) {
        let mut recorded = self.recorded.lock().expect("metrics lock poisoned");
        recorded
            .timings
            .entry(self.name.clone())
            .or_default()
            .push(duration);
    }
}

impl MetricsRegistry for RecordingMetrics {
    fn counter(&self, name: &str) -> Arc<dyn Counter> {
        Arc::new(RecordingCounter {
            name: name.to_string(),
            recorded: self.recorded.clone(),
        })
    }

    fn gauge(&self, name: &str) -> Arc<dyn Gauge> {
        Arc::new(RecordingGauge {
            name: name.to_string(),
            recorded: self.recorded.clone(),
        })
    }

    fn timer(&self, name: &str) -> Arc<dyn Timer> {
        Arc::new(RecordingTimer {
            name: name.to_string(),
            recorded: self.recorded.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_metrics_accumulate() {
        let registry = RecordingMetrics::new();
        let counter = registry.counter("test.counter");
        counter.increment(2);
        counter.increment(3);
        assert_eq!(registry.counter_value("test.counter"), 5);

        registry.gauge("test.gauge").set(1.5);
        registry.gauge("test.gauge").set(2.5);
        assert_eq!(registry.gauge_value("test.gauge"), Some(2.5));

        registry.timer("test.timer").record(Duration::from_millis(5));
        assert_eq!(registry.timing_count("test.timer"), 1);
        assert_eq!(registry.counter_value("missing"), 0);
    }
}
