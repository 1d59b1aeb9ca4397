//! Common test utilities for integration tests
//!
//! Provides the shared daemon fixture wiring the placement and
//! reconciliation loops to in-memory collaborators.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use flotilla::adapters::{
    ChannelAgentMonitor, InMemoryClusterManager, InMemoryJobStore, InMemoryOfferSource,
};
use flotilla::daemon::Daemon;
use flotilla::domain::models::{Offer, ResourceSet, Task};
use flotilla::domain::ports::SystemClock;
use flotilla::infrastructure::{Config, RecordingMetrics};

pub struct Harness {
    pub daemon: Daemon,
    pub store: Arc<InMemoryJobStore>,
    pub offers: Arc<InMemoryOfferSource>,
    pub cluster: Arc<InMemoryClusterManager>,
    pub monitor: Arc<ChannelAgentMonitor>,
    pub metrics: RecordingMetrics,
}

/// Fast loop pacing so integration tests settle quickly.
pub fn quick_config() -> Config {
    let mut config = Config::default();
    config.reconciler.active_timeout_ms = 5;
    config.reconciler.idle_timeout_ms = 10;
    config.reconciler.store_update_timeout_ms = 500;
    config.scheduler.scheduler_iteration_interval_ms = 20;
    config.scheduler.max_delay_ms_between_iterations = 30;
    config.autoscaler.delay_autoscale_up_by_secs = 0;
    config.autoscaler.delay_autoscale_down_by_secs = 0;
    config
}

/// Build and start a daemon over in-memory collaborators.
pub fn start_daemon(config: Config) -> Harness {
    let store = InMemoryJobStore::new();
    let offers = InMemoryOfferSource::new();
    let cluster = InMemoryClusterManager::new();
    let monitor = ChannelAgentMonitor::new();
    let metrics = RecordingMetrics::new();

    let mut daemon = Daemon::build(
        &config,
        store.clone(),
        offers.clone(),
        cluster.clone(),
        Arc::new(SystemClock),
        &metrics,
    )
    .expect("daemon assembly failed");
    daemon.start(monitor.as_ref(), cluster.as_ref());

    Harness {
        daemon,
        store,
        offers,
        cluster,
        monitor,
        metrics,
    }
}

/// A task requesting cpu/memory in the default Flex tier.
pub fn task(id: &str, job: &str, cpu: f64, memory_mb: u64) -> Task {
    Task::new(id, job, ResourceSet::cpu_mem(cpu, memory_mb))
}

/// A ten-minute offer.
pub fn offer(id: &str, agent: &str, cpu: f64, memory_mb: u64) -> Offer {
    Offer::new(
        id,
        agent,
        ResourceSet::cpu_mem(cpu, memory_mb),
        chrono::Duration::seconds(600),
    )
}

/// Poll until `predicate` holds or the timeout elapses; panics on timeout.
pub async fn wait_for<F>(what: &str, timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
