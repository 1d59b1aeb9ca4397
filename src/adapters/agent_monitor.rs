//! Channel-backed agent status monitor.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::domain::models::AgentStatusUpdate;
use crate::domain::ports::AgentStatusMonitor;

/// Monitor whose health records are pushed by the test or demo harness.
#[derive(Default)]
pub struct ChannelAgentMonitor {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AgentStatusUpdate>>>,
}

impl ChannelAgentMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, update: AgentStatusUpdate) {
        let mut subscribers = self.subscribers.lock().expect("monitor lock poisoned");
        subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

impl AgentStatusMonitor for ChannelAgentMonitor {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentStatusUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("monitor lock poisoned")
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AgentHealth;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let monitor = ChannelAgentMonitor::new();
        let mut rx = monitor.subscribe();
        monitor.publish(AgentStatusUpdate {
            agent_id: "a1".to_string(),
            health: AgentHealth::Unhealthy,
            disable_ms: Some(60_000),
        });

        let update = rx.recv().await.unwrap();
        assert_eq!(update.agent_id, "a1");
        assert_eq!(update.health, AgentHealth::Unhealthy);
    }
}
