//! Resource offer (lease) domain model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::resources::ResourceSet;

/// A time-bounded advertisement of resources by a worker agent.
///
/// Offers are ephemeral: consumed whole when accepted, rejected back to the
/// offer source before expiry otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub agent_id: String,
    pub resources: ResourceSet,
    /// Attribute snapshot taken when the offer was issued.
    pub attributes: BTreeMap<String, String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Offer {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        resources: ResourceSet,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            resources,
            attributes: BTreeMap::new(),
            issued_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the offer has outlived `max_age` regardless of its own
    /// expiry, which the pool treats the same as expired.
    pub fn is_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now - self.issued_at > max_age
    }
}

/// Why an offer was handed back to the offer source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferRejectReason {
    Expired,
    AgentRemoved,
    Rescinded,
    Unused,
}

impl OfferRejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::AgentRemoved => "agent_removed",
            Self::Rescinded => "rescinded",
            Self::Unused => "unused",
        }
    }
}
