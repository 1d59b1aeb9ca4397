//! Entity holder trees for three-model reconciliation.
//!
//! Each reconciliation engine keeps three [`EntityHolder`] trees named
//! Reference (desired), Running (observed) and Store (last durably
//! persisted). A root holder is a job; its children are the job's tasks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::task::Task;

/// Which of an engine's three models a delta targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Reference,
    Running,
    Store,
    /// Events not tied to any model (change lifecycle notifications).
    None,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Running => "running",
            Self::Store => "store",
            Self::None => "none",
        }
    }
}

/// Desired disposition of a job, carried on the root entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobDisposition {
    Active,
    KillRequested,
    Finished,
}

/// Root entity payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub disposition: JobDisposition,
}

impl JobRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            disposition: JobDisposition::Active,
        }
    }
}

/// The opaque payload carried by a holder node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EntityPayload {
    Job(JobRecord),
    Task(Task),
}

impl EntityPayload {
    pub fn id(&self) -> &str {
        match self {
            Self::Job(job) => &job.id,
            Self::Task(task) => &task.id,
        }
    }

    pub fn as_task(&self) -> Option<&Task> {
        match self {
            Self::Task(task) => Some(task),
            Self::Job(_) => None,
        }
    }

    pub fn as_job(&self) -> Option<&JobRecord> {
        match self {
            Self::Job(job) => Some(job),
            Self::Task(_) => None,
        }
    }
}

/// A node in an entity tree: an identifier, an entity payload, ordered
/// children, and a side-channel tag map for attributes such as retry
/// counters that are not part of the entity itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityHolder {
    pub id: String,
    pub payload: EntityPayload,
    pub children: Vec<EntityHolder>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, serde_json::Value>,
}

impl EntityHolder {
    pub fn root(job: JobRecord) -> Self {
        Self {
            id: job.id.clone(),
            payload: EntityPayload::Job(job),
            children: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn leaf(task: Task) -> Self {
        Self {
            id: task.id.clone(),
            payload: EntityPayload::Task(task),
            children: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_child(mut self, child: EntityHolder) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.tags.insert(key.into(), value);
        self
    }

    /// Find a direct child by id.
    pub fn child(&self, id: &str) -> Option<&EntityHolder> {
        self.children.iter().find(|c| c.id == id)
    }

    pub fn child_mut(&mut self, id: &str) -> Option<&mut EntityHolder> {
        self.children.iter_mut().find(|c| c.id == id)
    }

    /// Insert or replace a direct child, keeping insertion order for new
    /// children. Replacement preserves the child's position.
    pub fn upsert_child(&mut self, child: EntityHolder) {
        if let Some(existing) = self.child_mut(&child.id) {
            *existing = child;
        } else {
            self.children.push(child);
        }
    }

    /// Remove a direct child by id; false when absent.
    pub fn remove_child(&mut self, id: &str) -> bool {
        let before = self.children.len();
        self.children.retain(|c| c.id != id);
        self.children.len() != before
    }

    pub fn tag(&self, key: &str) -> Option<&serde_json::Value> {
        self.tags.get(key)
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.tags.insert(key.into(), value);
    }

    pub fn remove_tag(&mut self, key: &str) -> bool {
        self.tags.remove(key).is_some()
    }

    /// All task payloads in this tree (children of the root).
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.children.iter().filter_map(|c| c.payload.as_task())
    }
}
