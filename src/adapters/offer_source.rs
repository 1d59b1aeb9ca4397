//! In-memory offer source.
//!
//! Stands in for the real agent/offer protocol in tests and the demo
//! wiring: records rejections and launches, and lets the caller script
//! per-task launch rejections and kill observation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::domain::models::{Offer, OfferRejectReason};
use crate::domain::ports::{LaunchResult, OfferSource, TaskLaunch};

#[derive(Debug, Default)]
struct SourceState {
    rejected: Vec<(String, OfferRejectReason)>,
    launched: Vec<TaskLaunch>,
    kills: Vec<(String, String, String)>,
    reject_task_ids: Vec<String>,
}

/// Offer source recording every interaction.
#[derive(Default)]
pub struct InMemoryOfferSource {
    state: Mutex<SourceState>,
}

impl InMemoryOfferSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `launch_tasks` reject the given task ids.
    pub fn reject_launches_for(&self, task_ids: Vec<String>) {
        self.state.lock().expect("offer source lock poisoned").reject_task_ids = task_ids;
    }

    pub fn rejected_offers(&self) -> Vec<(String, OfferRejectReason)> {
        self.state
            .lock()
            .expect("offer source lock poisoned")
            .rejected
            .clone()
    }

    pub fn launched(&self) -> Vec<TaskLaunch> {
        self.state
            .lock()
            .expect("offer source lock poisoned")
            .launched
            .clone()
    }

    /// `(task_id, agent_id, reason)` triples observed via `kill_task`.
    pub fn kills(&self) -> Vec<(String, String, String)> {
        self.state
            .lock()
            .expect("offer source lock poisoned")
            .kills
            .clone()
    }
}

#[async_trait]
impl OfferSource for InMemoryOfferSource {
    async fn reject_lease(&self, offer_id: &str, reason: OfferRejectReason) {
        self.state
            .lock()
            .expect("offer source lock poisoned")
            .rejected
            .push((offer_id.to_string(), reason));
    }

    async fn launch_tasks(
        &self,
        launches: Vec<TaskLaunch>,
        _offers: Vec<Offer>,
    ) -> Vec<LaunchResult> {
        let mut state = self.state.lock().expect("offer source lock poisoned");
        launches
            .into_iter()
            .map(|launch| {
                if state.reject_task_ids.contains(&launch.task_id) {
                    LaunchResult::rejected(launch.task_id, "launch rejected by source")
                } else {
                    let result = LaunchResult::accepted(launch.task_id.clone());
                    state.launched.push(launch);
                    result
                }
            })
            .collect()
    }

    async fn kill_task(&self, task_id: &str, agent_id: &str, reason: &str) {
        self.state
            .lock()
            .expect("offer source lock poisoned")
            .kills
            .push((
                task_id.to_string(),
                agent_id.to_string(),
                reason.to_string(),
            ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ResourceSet;

    #[tokio::test]
    async fn test_scripted_launch_rejection() {
        let source = InMemoryOfferSource::new();
        source.reject_launches_for(vec!["t-2".to_string()]);

        let launches = vec![
            TaskLaunch {
                task_id: "t-1".to_string(),
                agent_id: "a1".to_string(),
                resources: ResourceSet::cpu_mem(1.0, 256),
                offer_ids: vec!["o1".to_string()],
            },
            TaskLaunch {
                task_id: "t-2".to_string(),
                agent_id: "a1".to_string(),
                resources: ResourceSet::cpu_mem(1.0, 256),
                offer_ids: vec!["o1".to_string()],
            },
        ];
        let results = source.launch_tasks(launches, Vec::new()).await;
        assert!(results[0].accepted);
        assert!(!results[1].accepted);
        assert_eq!(source.launched().len(), 1);
    }
}
