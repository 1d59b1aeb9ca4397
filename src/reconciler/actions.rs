//! Model update machinery: typed deltas and the pure apply function.
//!
//! Every mutation of an engine's three entity trees goes through a
//! [`ModelUpdateAction`]: a tagged record naming the target model, a path,
//! and an operation. Updates are idempotent, and a change action's updates
//! apply as one atomic group (partial failure reverts the whole group).

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::error::ReconcileError;
use crate::domain::models::{EntityHolder, EntityPayload, ModelKind};

/// Where in a tree an update lands: the root itself, or one direct child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityPath {
    pub root_id: String,
    pub child_id: Option<String>,
}

impl EntityPath {
    pub fn root(root_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            child_id: None,
        }
    }

    pub fn child(root_id: impl Into<String>, child_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            child_id: Some(child_id.into()),
        }
    }
}

impl std::fmt::Display for EntityPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.child_id {
            Some(child) => write!(f, "{}/{}", self.root_id, child),
            None => write!(f, "{}", self.root_id),
        }
    }
}

/// The operation half of an update. `Add` and `Update` are both upserts so
/// that re-applying an update cannot fail or change the result.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOp {
    Add { payload: EntityPayload },
    Update { payload: EntityPayload },
    Remove,
    /// Set (`Some`) or clear (`None`) a tag at the path.
    Tag { key: String, value: Option<Value> },
}

impl ModelOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Update { .. } => "update",
            Self::Remove => "remove",
            Self::Tag { .. } => "tag",
        }
    }
}

/// A single typed delta applied atomically to one of the three models.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelUpdateAction {
    pub target: ModelKind,
    pub path: EntityPath,
    pub op: ModelOp,
}

impl ModelUpdateAction {
    pub fn new(target: ModelKind, path: EntityPath, op: ModelOp) -> Self {
        Self { target, path, op }
    }

    pub fn summary(&self) -> String {
        format!("{} {} on {}", self.op.name(), self.path, self.target.as_str())
    }
}

/// The three trees of one reconciliation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSet {
    pub reference: EntityHolder,
    pub running: EntityHolder,
    pub store: EntityHolder,
}

impl ModelSet {
    /// Bootstrap an engine's models: the Reference tree is the caller's
    /// desired state; Running and Store start as the bare root (nothing
    /// observed, nothing persisted beyond the job record).
    pub fn bootstrap(reference: EntityHolder) -> Self {
        let bare = EntityHolder {
            id: reference.id.clone(),
            payload: reference.payload.clone(),
            children: Vec::new(),
            tags: std::collections::BTreeMap::new(),
        };
        Self {
            running: bare.clone(),
            store: bare,
            reference,
        }
    }

    pub fn get(&self, kind: ModelKind) -> Option<&EntityHolder> {
        match kind {
            ModelKind::Reference => Some(&self.reference),
            ModelKind::Running => Some(&self.running),
            ModelKind::Store => Some(&self.store),
            ModelKind::None => None,
        }
    }

    fn get_mut(&mut self, kind: ModelKind) -> Option<&mut EntityHolder> {
        match kind {
            ModelKind::Reference => Some(&mut self.reference),
            ModelKind::Running => Some(&mut self.running),
            ModelKind::Store => Some(&mut self.store),
            ModelKind::None => None,
        }
    }

    /// Apply a group of updates atomically: all of them land, or none do.
    pub fn apply_group(
        &mut self,
        updates: &[ModelUpdateAction],
    ) -> Result<(), ReconcileError> {
        let mut staged = self.clone();
        for update in updates {
            apply_update(&mut staged, update)?;
        }
        *self = staged;
        Ok(())
    }
}

/// Apply one update to the model set. Pure with respect to failure: the
/// caller stages on a clone, so a failed update mutates nothing visible.
fn apply_update(models: &mut ModelSet, update: &ModelUpdateAction) -> Result<(), ReconcileError> {
    let tree = models.get_mut(update.target).ok_or_else(|| {
        ReconcileError::InvalidInput("model update cannot target ModelKind::None".to_string())
    })?;
    if tree.id != update.path.root_id {
        return Err(ReconcileError::InvalidInput(format!(
            "update for root {} applied to engine {}",
            update.path.root_id, tree.id
        )));
    }

    match (&update.path.child_id, &update.op) {
        (None, ModelOp::Add { payload } | ModelOp::Update { payload }) => {
            tree.payload = payload.clone();
        }
        (None, ModelOp::Remove) => {
            return Err(ReconcileError::InvalidInput(
                "cannot remove the root holder".to_string(),
            ));
        }
        (None, ModelOp::Tag { key, value }) => match value {
            Some(v) => tree.set_tag(key.clone(), v.clone()),
            None => {
                tree.remove_tag(key);
            }
        },
        (Some(child_id), ModelOp::Add { payload } | ModelOp::Update { payload }) => {
            if payload.id() != child_id {
                return Err(ReconcileError::InvalidInput(format!(
                    "payload id {} does not match path {}",
                    payload.id(),
                    update.path
                )));
            }
            let mut child = EntityHolder {
                id: child_id.clone(),
                payload: payload.clone(),
                children: Vec::new(),
                tags: std::collections::BTreeMap::new(),
            };
            // Preserve tags across payload replacement.
            if let Some(existing) = tree.child(child_id) {
                child.tags = existing.tags.clone();
                child.children = existing.children.clone();
            }
            tree.upsert_child(child);
        }
        (Some(child_id), ModelOp::Remove) => {
            // Idempotent: removing an absent child is a no-op.
            tree.remove_child(child_id);
        }
        (Some(child_id), ModelOp::Tag { key, value }) => {
            let Some(child) = tree.child_mut(child_id) else {
                // Tagging an absent child is a no-op so that re-applied
                // groups stay idempotent after a removal.
                return Ok(());
            };
            match value {
                Some(v) => child.set_tag(key.clone(), v.clone()),
                None => {
                    child.remove_tag(key);
                }
            }
        }
    }
    Ok(())
}

/// Why a change action failed, plus the compensating updates that roll the
/// models back to a consistent state (e.g. un-doing a Reference update whose
/// Store write never acked).
#[derive(Debug)]
pub struct ChangeFailure {
    pub error: ReconcileError,
    pub compensating: Vec<ModelUpdateAction>,
}

impl ChangeFailure {
    pub fn new(error: ReconcileError) -> Self {
        Self {
            error,
            compensating: Vec::new(),
        }
    }

    pub fn with_compensating(mut self, updates: Vec<ModelUpdateAction>) -> Self {
        self.compensating = updates;
        self
    }
}

pub type ChangeResult = Result<Vec<ModelUpdateAction>, ChangeFailure>;

/// An externally requested (or reconciler-synthesized) mutation of an
/// engine's models. Execution is asynchronous; the produced updates apply
/// as one group on the engine's next trigger.
#[async_trait]
pub trait ChangeAction: Send + Sync {
    fn summary(&self) -> String;

    /// Run against a snapshot of the models taken when the action started.
    async fn execute(&self, models: ModelSet) -> ChangeResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{JobRecord, ResourceSet, Task};

    fn models() -> ModelSet {
        let reference = EntityHolder::root(JobRecord::new("job-1")).with_child(
            EntityHolder::leaf(Task::new("t-1", "job-1", ResourceSet::cpu_mem(1.0, 512))),
        );
        ModelSet::bootstrap(reference)
    }

    fn add_task(target: ModelKind, id: &str) -> ModelUpdateAction {
        ModelUpdateAction::new(
            target,
            EntityPath::child("job-1", id),
            ModelOp::Add {
                payload: EntityPayload::Task(Task::new(
                    id,
                    "job-1",
                    ResourceSet::cpu_mem(1.0, 512),
                )),
            },
        )
    }

    #[test]
    fn test_bootstrap_shapes() {
        let set = models();
        assert_eq!(set.reference.children.len(), 1);
        assert!(set.running.children.is_empty());
        assert!(set.store.children.is_empty());
    }

    #[test]
    fn test_apply_add_is_idempotent() {
        let mut set = models();
        let update = add_task(ModelKind::Running, "t-1");
        set.apply_group(std::slice::from_ref(&update)).unwrap();
        let once = set.clone();
        set.apply_group(std::slice::from_ref(&update)).unwrap();
        assert_eq!(set, once);
    }

    #[test]
    fn test_apply_remove_is_idempotent() {
        let mut set = models();
        let update = ModelUpdateAction::new(
            ModelKind::Reference,
            EntityPath::child("job-1", "t-1"),
            ModelOp::Remove,
        );
        set.apply_group(std::slice::from_ref(&update)).unwrap();
        assert!(set.reference.child("t-1").is_none());
        // Second application is a no-op, not an error.
        set.apply_group(std::slice::from_ref(&update)).unwrap();
    }

    #[test]
    fn test_group_application_is_atomic() {
        let mut set = models();
        let before = set.clone();
        let updates = vec![
            add_task(ModelKind::Running, "t-1"),
            // Payload id mismatch makes the second update fail.
            ModelUpdateAction::new(
                ModelKind::Running,
                EntityPath::child("job-1", "t-2"),
                ModelOp::Add {
                    payload: EntityPayload::Task(Task::new(
                        "wrong-id",
                        "job-1",
                        ResourceSet::cpu_mem(1.0, 512),
                    )),
                },
            ),
        ];
        assert!(set.apply_group(&updates).is_err());
        // Nothing from the group landed.
        assert_eq!(set, before);
    }

    #[test]
    fn test_tag_set_and_clear() {
        let mut set = models();
        let set_tag = ModelUpdateAction::new(
            ModelKind::Reference,
            EntityPath::root("job-1"),
            ModelOp::Tag {
                key: "broken:t-1".to_string(),
                value: Some(serde_json::json!("store update timeout")),
            },
        );
        set.apply_group(std::slice::from_ref(&set_tag)).unwrap();
        assert!(set.reference.tag("broken:t-1").is_some());

        let clear_tag = ModelUpdateAction::new(
            ModelKind::Reference,
            EntityPath::root("job-1"),
            ModelOp::Tag {
                key: "broken:t-1".to_string(),
                value: None,
            },
        );
        set.apply_group(std::slice::from_ref(&clear_tag)).unwrap();
        assert!(set.reference.tag("broken:t-1").is_none());
    }

    #[test]
    fn test_update_preserves_child_tags() {
        let mut set = models();
        set.reference
            .child_mut("t-1")
            .unwrap()
            .set_tag("note", serde_json::json!(1));

        let mut changed = Task::new("t-1", "job-1", ResourceSet::cpu_mem(1.0, 512));
        changed.transition_to(crate::domain::models::TaskState::Queued).unwrap();
        let update = ModelUpdateAction::new(
            ModelKind::Reference,
            EntityPath::child("job-1", "t-1"),
            ModelOp::Update {
                payload: EntityPayload::Task(changed),
            },
        );
        set.apply_group(std::slice::from_ref(&update)).unwrap();

        let child = set.reference.child("t-1").unwrap();
        assert!(child.tag("note").is_some());
        assert_eq!(
            child.payload.as_task().unwrap().state,
            crate::domain::models::TaskState::Queued
        );
    }

    #[test]
    fn test_wrong_root_rejected() {
        let mut set = models();
        let update = ModelUpdateAction::new(
            ModelKind::Reference,
            EntityPath::child("other-job", "t-9"),
            ModelOp::Remove,
        );
        assert!(matches!(
            set.apply_group(std::slice::from_ref(&update)),
            Err(ReconcileError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_root_remove_rejected() {
        let mut set = models();
        let update = ModelUpdateAction::new(
            ModelKind::Reference,
            EntityPath::root("job-1"),
            ModelOp::Remove,
        );
        assert!(set.apply_group(std::slice::from_ref(&update)).is_err());
    }
}
