use super::topology::*;
use crate::proto::instance;

fn defn(
    name: &str,
    defn_id: u64,
    instances: &[(u64, IndexState)],
) -> IndexDefnDistribution {
    IndexDefnDistribution {
        bucket: "b1".into(),
        name: name.into(),
        defn_id,
        sec_exprs: vec!["`city`".into()],
        instances: instances
            .iter()
            .map(|&(inst_id, state)| IndexInstDistribution { inst_id, state })
            .collect(),
    }
}

#[test]
fn decode_round_trips_store_payloads() {
    let topology = IndexTopology {
        version: 3,
        bucket: "b1".into(),
        definitions: vec![defn("idx-city", 1, &[(42, IndexState::Ready)])],
    };
    let raw = serde_json::to_vec(&topology).unwrap();
    assert_eq!(IndexTopology::decode(&raw).unwrap(), topology);

    let err = IndexTopology::decode(b"{not json").unwrap_err();
    assert!(err.to_string().contains("malformed topology payload"));
}

#[test]
fn bucket_from_key_takes_the_last_component() {
    assert_eq!(GlobalTopology::bucket_from_key("indexing/topology/b1"), "b1");
    assert_eq!(GlobalTopology::bucket_from_key("b1"), "b1");
}

#[test]
fn new_instance_in_to_state_is_added_without_history() {
    let new_defn = defn("idx", 1, &[(42, IndexState::Ready), (43, IndexState::Created)]);

    let changes = add_instances_to_change_list(
        None,
        &new_defn,
        Some(&[IndexState::Created]),
        Some(&[IndexState::Ready]),
    );
    // fromStates is ignored without a matching old instance
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].inst_id, 42);
    assert_eq!(changes[0].state, IndexState::Ready);
}

#[test]
fn transition_requires_from_state_and_a_real_change() {
    let old_defn = defn("idx", 1, &[(42, IndexState::Created), (43, IndexState::Ready)]);
    let new_defn = defn("idx", 1, &[(42, IndexState::Ready), (43, IndexState::Ready)]);

    let changes = add_instances_to_change_list(
        Some(&old_defn),
        &new_defn,
        Some(&[IndexState::Created]),
        Some(&[IndexState::Ready]),
    );
    // 43 did not change state, only 42 transitioned
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].inst_id, 42);
}

#[test]
fn wrong_from_state_blocks_the_add() {
    let old_defn = defn("idx", 1, &[(42, IndexState::Initial)]);
    let new_defn = defn("idx", 1, &[(42, IndexState::Ready)]);

    let changes = add_instances_to_change_list(
        Some(&old_defn),
        &new_defn,
        Some(&[IndexState::Created]),
        Some(&[IndexState::Ready]),
    );
    assert!(changes.is_empty());
}

#[test]
fn nil_state_lists_mean_any() {
    let old_defn = defn("idx", 1, &[(42, IndexState::Ready)]);
    let new_defn = defn("idx", 1, &[(42, IndexState::Deleted)]);

    let changes = add_instances_to_change_list(Some(&old_defn), &new_defn, None, None);
    assert_eq!(changes.len(), 1);

    assert!(in_state(IndexState::Active, None));
    assert!(!in_state(IndexState::Active, Some(&[IndexState::Ready])));
}

#[test]
fn change_record_materializes_a_wire_instance() {
    let new_defn = defn("idx", 5, &[(42, IndexState::Ready)]);
    let changes = add_instances_to_change_list(None, &new_defn, None, Some(&[IndexState::Ready]));

    let inst = changes[0].as_instance("127.0.0.1:9100");
    assert_eq!(inst.instance_id, 42);
    assert_eq!(inst.index_state(), instance::IndexState::Ready);
    assert_eq!(inst.endpoints, vec!["127.0.0.1:9100".to_string()]);
    let defn = inst.definition.unwrap();
    assert_eq!(defn.defn_id, 5);
    assert_eq!(defn.bucket, "b1");
}

#[test]
fn find_index_definition_matches_bucket_and_name() {
    let topology = IndexTopology {
        version: 1,
        bucket: "b1".into(),
        definitions: vec![defn("idx-a", 1, &[]), defn("idx-b", 2, &[])],
    };
    assert!(topology.find_index_definition("b1", "idx-b").is_some());
    assert!(topology.find_index_definition("b1", "idx-c").is_none());
    assert!(topology.find_index_definition("b2", "idx-a").is_none());
}
