//! Property tests for the model-update machinery and queue determinism.

use std::collections::HashMap;

use proptest::prelude::*;

use flotilla::domain::models::{
    EntityHolder, EntityPayload, JobRecord, ModelKind, ResourceSet, Task,
};
use flotilla::reconciler::{EntityPath, ModelOp, ModelSet, ModelUpdateAction};
use flotilla::scheduler::TieredTaskQueue;

const ROOT: &str = "job-1";

fn task(id: &str) -> Task {
    Task::new(id, ROOT, ResourceSet::cpu_mem(1.0, 256))
}

fn bootstrap() -> ModelSet {
    ModelSet::bootstrap(
        EntityHolder::root(JobRecord::new(ROOT)).with_child(EntityHolder::leaf(task("seed"))),
    )
}

/// Strategy over valid single updates against a small id space.
fn update_strategy() -> impl Strategy<Value = ModelUpdateAction> {
    let model = prop_oneof![
        Just(ModelKind::Reference),
        Just(ModelKind::Running),
        Just(ModelKind::Store),
    ];
    let child = prop_oneof![
        Just("t-a".to_string()),
        Just("t-b".to_string()),
        Just("seed".to_string()),
    ];
    (model, child, 0u8..4).prop_map(|(target, child_id, op)| {
        let op = match op {
            0 => ModelOp::Add {
                payload: EntityPayload::Task(task(&child_id)),
            },
            1 => ModelOp::Update {
                payload: EntityPayload::Task(task(&child_id)),
            },
            2 => ModelOp::Remove,
            _ => ModelOp::Tag {
                key: format!("note:{child_id}"),
                value: Some(serde_json::json!(1)),
            },
        };
        ModelUpdateAction::new(target, EntityPath::child(ROOT, child_id), op)
    })
}

proptest! {
    /// Property: applying any valid update twice yields the same trees as
    /// applying it once (model updates are idempotent transforms).
    #[test]
    fn prop_updates_are_idempotent(updates in prop::collection::vec(update_strategy(), 1..12)) {
        let mut once = bootstrap();
        let mut twice = bootstrap();

        for update in &updates {
            once.apply_group(std::slice::from_ref(update)).unwrap();
            twice.apply_group(std::slice::from_ref(update)).unwrap();
            twice.apply_group(std::slice::from_ref(update)).unwrap();
        }
        prop_assert_eq!(once, twice);
    }

    /// Property: group application is all-or-nothing. A group with a
    /// poisoned tail leaves the models untouched.
    #[test]
    fn prop_failed_group_changes_nothing(updates in prop::collection::vec(update_strategy(), 0..8)) {
        let mut models = bootstrap();
        let before = models.clone();

        let mut group = updates;
        // The root holder can never be removed, so this update poisons the
        // whole group.
        group.push(ModelUpdateAction::new(
            ModelKind::Reference,
            EntityPath::root(ROOT),
            ModelOp::Remove,
        ));

        prop_assert!(models.apply_group(&group).is_err());
        prop_assert_eq!(models, before);
    }

    /// Property: the iteration snapshot is deterministic. Draining the same
    /// queue twice with the same usage yields the same order.
    #[test]
    fn prop_drain_order_is_deterministic(
        groups in prop::collection::vec("[a-d]", 1..30),
    ) {
        let queue = TieredTaskQueue::new();
        for (i, group) in groups.iter().enumerate() {
            queue
                .enqueue(
                    Task::new(format!("t-{i}"), ROOT, ResourceSet::cpu_mem(1.0, 64))
                        .with_capacity_group(group.clone()),
                )
                .unwrap();
        }

        let usage = HashMap::new();
        let first: Vec<String> = queue
            .drain_for_iteration(&usage)
            .into_iter()
            .map(|t| t.id)
            .collect();
        let second: Vec<String> = queue
            .drain_for_iteration(&usage)
            .into_iter()
            .map(|t| t.id)
            .collect();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), groups.len());
    }
}
