//! Ordering invariants of generated plans over random topology pairs

use depup_planner::{bucket_of, LiveNode, LiveState, ModifiedEntities, Planner};
use depup_topology::{diff, ChangeOperation, EntityType, Topology};
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

fn topology_strategy() -> impl Strategy<Value = Topology> {
    prop::collection::btree_map(
        0usize..6,
        (
            prop::collection::btree_set(0usize..6, 0..3),
            0i64..3,
            0u32..3,
        ),
        0..6,
    )
    .prop_map(|nodes| {
        let mut raw = Map::new();
        for (index, (targets, port, default)) in &nodes {
            let relationships: Vec<Value> = targets
                .iter()
                .filter(|t| *t != index && nodes.contains_key(*t))
                .map(|t| json!({"type": "connected_to", "target_id": format!("n{t}")}))
                .collect();
            raw.insert(
                format!("n{index}"),
                json!({
                    "type": "server",
                    "properties": {"port": port},
                    "instances": {"default": default},
                    "relationships": relationships,
                }),
            );
        }
        Topology::from_value(json!({ "nodes": raw })).expect("generated topology is valid")
    })
}

fn live_state(topology: &Topology) -> LiveState {
    topology
        .nodes()
        .iter()
        .map(|(id, node)| (id.clone(), LiveNode::new(1, node.instances.target())))
        .collect()
}

proptest! {
    #[test]
    fn steps_follow_bucket_order(old in topology_strategy(), new in topology_strategy()) {
        let plan = Planner::new().plan(&diff(&old, &new), &live_state(&old)).unwrap();
        let buckets: Vec<_> = plan
            .steps
            .iter()
            .map(|s| bucket_of(s.entity_type, s.operation))
            .collect();
        prop_assert!(buckets.windows(2).all(|w| w[0] <= w[1]));

        for pair in plan.steps.windows(2) {
            if bucket_of(pair[0].entity_type, pair[0].operation)
                == bucket_of(pair[1].entity_type, pair[1].operation)
            {
                prop_assert!(pair[0].entity_id <= pair[1].entity_id);
            }
        }
    }

    #[test]
    fn sequence_indexes_are_dense(old in topology_strategy(), new in topology_strategy()) {
        let plan = Planner::new().plan(&diff(&old, &new), &LiveState::new()).unwrap();
        for (i, step) in plan.steps.iter().enumerate() {
            prop_assert_eq!(step.sequence_index as usize, i);
        }
        prop_assert_eq!(plan.modified_entities.len(), plan.steps.len());
    }

    #[test]
    fn modified_entities_read_back_unchanged(old in topology_strategy(), new in topology_strategy()) {
        let plan = Planner::new().plan(&diff(&old, &new), &LiveState::new()).unwrap();
        let encoded = serde_json::to_value(&plan.modified_entities).unwrap();
        let decoded: ModifiedEntities = serde_json::from_value(encoded).unwrap();
        prop_assert_eq!(decoded, plan.modified_entities);
    }

    #[test]
    fn relationship_removals_precede_node_removal(
        old in topology_strategy(),
        new in topology_strategy(),
    ) {
        let plan = Planner::new().plan(&diff(&old, &new), &live_state(&old)).unwrap();
        let position: BTreeMap<(EntityType, ChangeOperation, String), usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| ((s.entity_type, s.operation, s.entity_id.to_string()), i))
            .collect();

        for step in &plan.steps {
            if step.entity_type != EntityType::Relationship {
                continue;
            }
            let (source, target) = step.entity_id.relationship_endpoints().unwrap();
            let me = position[&(step.entity_type, step.operation, step.entity_id.to_string())];
            match step.operation {
                ChangeOperation::Remove => {
                    if let Some(&node) =
                        position.get(&(EntityType::Node, ChangeOperation::Remove, target.to_string()))
                    {
                        prop_assert!(me < node);
                    }
                }
                ChangeOperation::Add => {
                    for endpoint in [source, target] {
                        if let Some(&node) =
                            position.get(&(EntityType::Node, ChangeOperation::Add, endpoint.to_string()))
                        {
                            prop_assert!(node < me);
                        }
                    }
                }
                ChangeOperation::Modify => {}
            }
        }
    }

    #[test]
    fn instance_deltas_only_for_node_changes(old in topology_strategy(), new in topology_strategy()) {
        let plan = Planner::new().plan(&diff(&old, &new), &live_state(&old)).unwrap();
        let node_steps: BTreeSet<String> = plan
            .steps
            .iter()
            .filter(|s| s.entity_type == EntityType::Node)
            .map(|s| s.entity_id.to_string())
            .collect();
        for (node, delta) in &plan.instance_deltas {
            prop_assert!(node_steps.contains(node));
            prop_assert!(!delta.is_noop());
        }
    }
}
