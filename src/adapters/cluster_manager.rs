//! In-memory cluster manager.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::error::SchedulerError;
use crate::domain::models::InstanceGroupEvent;
use crate::domain::ports::{ClusterManager, ScaleDownOutcome};

#[derive(Debug, Default)]
struct ClusterState {
    scale_ups: Vec<(String, u32)>,
    scale_downs: Vec<(String, Vec<String>)>,
    /// Instances the manager refuses to terminate.
    protected: Vec<String>,
    subscribers: Vec<mpsc::UnboundedSender<InstanceGroupEvent>>,
}

/// Cluster manager recording scale actions and fanning out group events.
#[derive(Default)]
pub struct InMemoryClusterManager {
    state: Mutex<ClusterState>,
}

impl InMemoryClusterManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn protect_instances(&self, instance_ids: Vec<String>) {
        self.state.lock().expect("cluster lock poisoned").protected = instance_ids;
    }

    pub fn scale_ups(&self) -> Vec<(String, u32)> {
        self.state
            .lock()
            .expect("cluster lock poisoned")
            .scale_ups
            .clone()
    }

    pub fn scale_downs(&self) -> Vec<(String, Vec<String>)> {
        self.state
            .lock()
            .expect("cluster lock poisoned")
            .scale_downs
            .clone()
    }

    /// Publish an instance-group event to all subscribers.
    pub fn publish(&self, event: InstanceGroupEvent) {
        let mut state = self.state.lock().expect("cluster lock poisoned");
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl ClusterManager for InMemoryClusterManager {
    async fn scale_up(&self, group_id: &str, count: u32) -> Result<(), SchedulerError> {
        self.state
            .lock()
            .expect("cluster lock poisoned")
            .scale_ups
            .push((group_id.to_string(), count));
        Ok(())
    }

    async fn scale_down(
        &self,
        group_id: &str,
        instance_ids: Vec<String>,
    ) -> Result<ScaleDownOutcome, SchedulerError> {
        let mut state = self.state.lock().expect("cluster lock poisoned");
        let (not_terminated, terminated): (Vec<String>, Vec<String>) = instance_ids
            .iter()
            .cloned()
            .partition(|id| state.protected.contains(id));
        state
            .scale_downs
            .push((group_id.to_string(), instance_ids));
        Ok(ScaleDownOutcome {
            terminated,
            not_terminated,
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<InstanceGroupEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .expect("cluster lock poisoned")
            .subscribers
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::InstanceGroup;

    #[tokio::test]
    async fn test_scale_down_partitions_protected() {
        let cluster = InMemoryClusterManager::new();
        cluster.protect_instances(vec!["i-keep".to_string()]);

        let outcome = cluster
            .scale_down("g", vec!["i-keep".to_string(), "i-gone".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.not_terminated, vec!["i-keep".to_string()]);
        assert_eq!(outcome.terminated, vec!["i-gone".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let cluster = InMemoryClusterManager::new();
        let mut rx = cluster.subscribe();
        cluster.publish(InstanceGroupEvent::Added(InstanceGroup::new("g", 0, 5)));
        assert!(matches!(
            rx.recv().await,
            Some(InstanceGroupEvent::Added(group)) if group.id == "g"
        ));
    }
}
