//! Offer pool: live resource offers per agent, with expiry and disablement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::domain::models::{
    Agent, AgentSnapshot, Offer, OfferRejectReason, ResourceSet,
};
use crate::domain::ports::{Clock, OfferRescind, OfferSource};

#[derive(Debug)]
struct AgentEntry {
    agent: Agent,
    offers: Vec<Offer>,
}

#[derive(Default)]
struct PoolState {
    agents: HashMap<String, AgentEntry>,
}

/// Tracks the currently valid offers of every known agent.
///
/// An agent is created when its first offer arrives and removed when marked
/// inactive with no tasks left on it. Disabled agents keep their offers
/// until expiry but are excluded from placement snapshots.
pub struct OfferPool {
    inner: Mutex<PoolState>,
    offer_source: Arc<dyn OfferSource>,
    clock: Arc<dyn Clock>,
    /// Offers older than this are rejected at iteration start regardless of
    /// their own expiry.
    max_offer_age: Duration,
}

impl OfferPool {
    pub fn new(
        offer_source: Arc<dyn OfferSource>,
        clock: Arc<dyn Clock>,
        lease_offer_expiry_secs: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(PoolState::default()),
            offer_source,
            clock,
            max_offer_age: Duration::seconds(
                i64::try_from(lease_offer_expiry_secs).unwrap_or(i64::MAX / 1000),
            ),
        }
    }

    /// Insert an offer, creating its agent on first sight. Offers for a
    /// disabled agent are held but stay unavailable to placement.
    pub fn add_offer(&self, offer: Offer) {
        let mut state = self.inner.lock().expect("offer pool lock poisoned");
        let entry = state
            .agents
            .entry(offer.agent_id.clone())
            .or_insert_with(|| {
                let hostname = offer
                    .attributes
                    .get("hostname")
                    .cloned()
                    .unwrap_or_else(|| offer.agent_id.clone());
                debug!(agent_id = %offer.agent_id, "first offer from agent");
                AgentEntry {
                    agent: Agent::new(offer.agent_id.clone(), hostname),
                    offers: Vec::new(),
                }
            });
        // The attribute snapshot travels with every offer; keep the agent's
        // view current.
        entry.agent.attributes = offer.attributes.clone();
        if entry.offers.iter().any(|o| o.id == offer.id) {
            warn!(offer_id = %offer.id, "duplicate offer ignored");
            return;
        }
        entry.offers.push(offer);
    }

    /// Remove an offer and hand it back to the offer source.
    pub async fn reject_offer(&self, offer_id: &str, reason: OfferRejectReason) -> bool {
        let removed = {
            let mut state = self.inner.lock().expect("offer pool lock poisoned");
            let mut removed = false;
            for entry in state.agents.values_mut() {
                let before = entry.offers.len();
                entry.offers.retain(|o| o.id != offer_id);
                if entry.offers.len() != before {
                    removed = true;
                    break;
                }
            }
            removed
        };
        if removed {
            self.offer_source.reject_lease(offer_id, reason).await;
        }
        removed
    }

    /// Bulk-reject every offer of one agent.
    pub async fn expire_all_for(&self, agent_id: &str) {
        let offer_ids: Vec<String> = {
            let mut state = self.inner.lock().expect("offer pool lock poisoned");
            match state.agents.get_mut(agent_id) {
                Some(entry) => entry.offers.drain(..).map(|o| o.id).collect(),
                None => Vec::new(),
            }
        };
        for id in offer_ids {
            self.offer_source
                .reject_lease(&id, OfferRejectReason::AgentRemoved)
                .await;
        }
    }

    /// Apply a rescind notification from the offer source.
    pub async fn handle_rescind(&self, rescind: OfferRescind) {
        match rescind {
            OfferRescind::Offer(id) => {
                self.reject_offer(&id, OfferRejectReason::Rescinded).await;
            }
            OfferRescind::All => {
                let agent_ids: Vec<String> = {
                    let state = self.inner.lock().expect("offer pool lock poisoned");
                    state.agents.keys().cloned().collect()
                };
                info!("rescinding all offers");
                for agent_id in agent_ids {
                    self.expire_all_for(&agent_id).await;
                }
            }
        }
    }

    /// Re-admit an agent to placement immediately.
    pub fn enable(&self, agent_id: &str) {
        let mut state = self.inner.lock().expect("offer pool lock poisoned");
        if let Some(entry) = state.agents.get_mut(agent_id) {
            entry.agent.disabled_until_ms = 0;
            info!(agent_id, "agent enabled");
        }
    }

    /// Keep the agent out of placement for `duration_ms`. Its offers remain
    /// held until their own expiry.
    pub fn disable(&self, agent_id: &str, duration_ms: u64) {
        let now = self.clock.now();
        let mut state = self.inner.lock().expect("offer pool lock poisoned");
        if let Some(entry) = state.agents.get_mut(agent_id) {
            entry.agent.disabled_until_ms =
                now.timestamp_millis() + i64::try_from(duration_ms).unwrap_or(i64::MAX);
            info!(agent_id, duration_ms, "agent disabled");
        }
    }

    /// Record a task placed on an agent.
    pub fn mark_task_running(&self, agent_id: &str, task_id: &str) {
        let mut state = self.inner.lock().expect("offer pool lock poisoned");
        if let Some(entry) = state.agents.get_mut(agent_id) {
            entry.agent.running_tasks.insert(task_id.to_string());
        }
    }

    /// Record a task leaving an agent. Returns true when the agent became
    /// drained (no tasks and no offers) and was dropped from the pool.
    pub fn mark_task_stopped(&self, agent_id: &str, task_id: &str) -> bool {
        let mut state = self.inner.lock().expect("offer pool lock poisoned");
        if let Some(entry) = state.agents.get_mut(agent_id) {
            entry.agent.running_tasks.remove(task_id);
            if entry.agent.running_tasks.is_empty()
                && entry.offers.is_empty()
                && entry.agent.is_disabled_at(self.clock.now())
            {
                state.agents.remove(agent_id);
                return true;
            }
        }
        false
    }

    /// Reject every offer past its expiry or older than the configured
    /// maximum age. Called at iteration start, before the snapshot.
    pub async fn evict_stale(&self) {
        let now = self.clock.now();
        let stale: Vec<String> = {
            let state = self.inner.lock().expect("offer pool lock poisoned");
            state
                .agents
                .values()
                .flat_map(|e| e.offers.iter())
                .filter(|o| o.is_expired_at(now) || o.is_older_than(self.max_offer_age, now))
                .map(|o| o.id.clone())
                .collect()
        };
        for id in stale {
            self.reject_offer(&id, OfferRejectReason::Expired).await;
        }
    }

    /// Consume the named offers out of the pool (used once a launch was
    /// accepted); they are not handed back to the source.
    pub fn consume_offers(&self, offer_ids: &[String]) -> Vec<Offer> {
        let mut state = self.inner.lock().expect("offer pool lock poisoned");
        let mut consumed = Vec::new();
        for entry in state.agents.values_mut() {
            let (taken, kept): (Vec<Offer>, Vec<Offer>) = entry
                .offers
                .drain(..)
                .partition(|o| offer_ids.contains(&o.id));
            consumed.extend(taken);
            entry.offers = kept;
        }
        consumed
    }

    /// Consistent per-agent view for one placement iteration. Disabled
    /// agents and expired offers are excluded; live offers per agent are
    /// aggregated keep-together.
    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        let now = self.clock.now();
        let state = self.inner.lock().expect("offer pool lock poisoned");
        let mut snapshots: Vec<AgentSnapshot> = state
            .agents
            .values()
            .filter(|e| !e.agent.is_disabled_at(now))
            .filter_map(|e| {
                let live: Vec<&Offer> = e
                    .offers
                    .iter()
                    .filter(|o| !o.is_expired_at(now))
                    .collect();
                if live.is_empty() {
                    return None;
                }
                let available = live
                    .iter()
                    .fold(ResourceSet::none(), |acc, o| acc.add(&o.resources));
                Some(AgentSnapshot {
                    agent_id: e.agent.id.clone(),
                    hostname: e.agent.hostname.clone(),
                    attributes: e.agent.attributes.clone(),
                    available,
                    offer_ids: live.iter().map(|o| o.id.clone()).collect(),
                    running_task_count: e.agent.running_tasks.len(),
                })
            })
            .collect();
        snapshots.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        snapshots
    }

    /// Ids of agents holding no offers and running no tasks, grouped by the
    /// given attribute (used for autoscaling idle counts).
    pub fn idle_agents_by(&self, attribute: &str) -> HashMap<String, Vec<String>> {
        let state = self.inner.lock().expect("offer pool lock poisoned");
        let now = self.clock.now();
        let mut idle: HashMap<String, Vec<String>> = HashMap::new();
        for entry in state.agents.values() {
            if entry.agent.running_tasks.is_empty() && !entry.agent.is_disabled_at(now) {
                if let Some(group) = entry.agent.attribute(attribute) {
                    idle.entry(group.to_string())
                        .or_default()
                        .push(entry.agent.id.clone());
                }
            }
        }
        for ids in idle.values_mut() {
            ids.sort();
        }
        idle
    }

    /// Number of known agents per value of the given attribute (used as
    /// the autoscaler's current-size view).
    pub fn group_sizes(&self, attribute: &str) -> HashMap<String, u32> {
        let state = self.inner.lock().expect("offer pool lock poisoned");
        let mut sizes: HashMap<String, u32> = HashMap::new();
        for entry in state.agents.values() {
            if let Some(group) = entry.agent.attribute(attribute) {
                *sizes.entry(group.to_string()).or_insert(0) += 1;
            }
        }
        sizes
    }

    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        let state = self.inner.lock().expect("offer pool lock poisoned");
        state.agents.get(agent_id).map(|e| e.agent.clone())
    }

    pub fn offer_count(&self) -> usize {
        let state = self.inner.lock().expect("offer pool lock poisoned");
        state.agents.values().map(|e| e.offers.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::clock::ManualClock;
    use crate::domain::ports::offer_source::{LaunchResult, TaskLaunch};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingOfferSource {
        rejected: StdMutex<Vec<(String, OfferRejectReason)>>,
    }

    #[async_trait]
    impl OfferSource for RecordingOfferSource {
        async fn reject_lease(&self, offer_id: &str, reason: OfferRejectReason) {
            self.rejected
                .lock()
                .unwrap()
                .push((offer_id.to_string(), reason));
        }

        async fn launch_tasks(
            &self,
            launches: Vec<TaskLaunch>,
            _offers: Vec<Offer>,
        ) -> Vec<LaunchResult> {
            launches
                .into_iter()
                .map(|l| LaunchResult::accepted(l.task_id))
                .collect()
        }

        async fn kill_task(&self, _task_id: &str, _agent_id: &str, _reason: &str) {}
    }

    fn fixture() -> (OfferPool, Arc<RecordingOfferSource>, ManualClock) {
        let source = Arc::new(RecordingOfferSource::default());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let pool = OfferPool::new(source.clone(), Arc::new(clock.clone()), 300);
        (pool, source, clock)
    }

    fn offer(id: &str, agent: &str, cpu: f64, ttl_secs: i64) -> Offer {
        let mut attributes = BTreeMap::new();
        attributes.insert("zone".to_string(), "us-east-1a".to_string());
        Offer::new(
            id,
            agent,
            ResourceSet::cpu_mem(cpu, 4096),
            Duration::seconds(ttl_secs),
        )
        .with_attributes(attributes)
    }

    #[tokio::test]
    async fn test_add_offer_creates_agent_and_snapshot_aggregates() {
        let (pool, _, _) = fixture();
        pool.add_offer(offer("o1", "a1", 2.0, 600));
        pool.add_offer(offer("o2", "a1", 2.0, 600));

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!((snapshot[0].available.cpu - 4.0).abs() < f64::EPSILON);
        assert_eq!(snapshot[0].offer_ids, vec!["o1", "o2"]);
    }

    #[tokio::test]
    async fn test_reject_offer_notifies_source() {
        let (pool, source, _) = fixture();
        pool.add_offer(offer("o1", "a1", 2.0, 600));
        assert!(pool.reject_offer("o1", OfferRejectReason::Unused).await);
        assert!(!pool.reject_offer("o1", OfferRejectReason::Unused).await);

        let rejected = source.rejected.lock().unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, "o1");
    }

    #[tokio::test]
    async fn test_disabled_agent_excluded_until_window_elapses() {
        let (pool, _, clock) = fixture();
        pool.add_offer(offer("o1", "a1", 2.0, 600));
        pool.disable("a1", 60_000);
        assert!(pool.snapshot().is_empty());

        clock.advance(Duration::seconds(61));
        assert_eq!(pool.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_enable_clears_disablement() {
        let (pool, _, _) = fixture();
        pool.add_offer(offer("o1", "a1", 2.0, 600));
        pool.disable("a1", 60_000);
        pool.enable("a1");
        assert_eq!(pool.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_evict_stale_rejects_expired_and_old() {
        let (pool, source, clock) = fixture();
        pool.add_offer(offer("short", "a1", 2.0, 30));
        pool.add_offer(offer("long", "a1", 2.0, 3600));

        // 301s: "short" expired; "long" exceeds max age (300s).
        clock.advance(Duration::seconds(301));
        pool.evict_stale().await;

        assert_eq!(pool.offer_count(), 0);
        let rejected = source.rejected.lock().unwrap();
        assert_eq!(rejected.len(), 2);
        assert!(rejected.iter().all(|(_, r)| *r == OfferRejectReason::Expired));
    }

    #[tokio::test]
    async fn test_rescind_all() {
        let (pool, source, _) = fixture();
        pool.add_offer(offer("o1", "a1", 2.0, 600));
        pool.add_offer(offer("o2", "a2", 2.0, 600));
        pool.handle_rescind(OfferRescind::All).await;

        assert_eq!(pool.offer_count(), 0);
        assert_eq!(source.rejected.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_consume_offers_removes_without_reject() {
        let (pool, source, _) = fixture();
        pool.add_offer(offer("o1", "a1", 2.0, 600));
        let consumed = pool.consume_offers(&["o1".to_string()]);
        assert_eq!(consumed.len(), 1);
        assert_eq!(pool.offer_count(), 0);
        assert!(source.rejected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_agents_by_attribute() {
        let (pool, _, _) = fixture();
        let mut attrs = BTreeMap::new();
        attrs.insert("asg".to_string(), "g1".to_string());
        pool.add_offer(
            Offer::new("o1", "a1", ResourceSet::cpu_mem(2.0, 1024), Duration::seconds(600))
                .with_attributes(attrs.clone()),
        );
        pool.add_offer(
            Offer::new("o2", "a2", ResourceSet::cpu_mem(2.0, 1024), Duration::seconds(600))
                .with_attributes(attrs),
        );
        pool.mark_task_running("a2", "t-1");

        let idle = pool.idle_agents_by("asg");
        assert_eq!(idle.get("g1"), Some(&vec!["a1".to_string()]));
    }
}
