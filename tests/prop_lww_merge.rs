// Copyright (c) 2026 Dawn Mesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

use dawn_mesh::core::types::NodeId;
use dawn_mesh::networking::agent_registry::{
    AgentEntry, AgentRegistry, RegistrySnapshot, VersionedEntry, SNAPSHOT_VERSION,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn nid(byte: u8) -> NodeId {
    NodeId::from_public_key(&[byte; 32])
}

fn entry(origin: u8, agent: &str, timestamp: u64, tombstone: bool) -> (String, VersionedEntry) {
    let origin = nid(origin);
    let key = format!("{origin}:{agent}");
    let payload = if tombstone {
        None
    } else {
        Some(AgentEntry {
            agent_id: agent.to_string(),
            name: agent.to_string(),
            description: String::new(),
            capabilities: vec![],
            origin: origin.clone(),
            health_score: 1.0,
            available: true,
        })
    };
    (
        key,
        VersionedEntry {
            timestamp,
            origin,
            tombstone,
            entry: payload,
            updated_ms: 0,
        },
    )
}

fn snapshot(entries: Vec<(String, VersionedEntry)>) -> RegistrySnapshot {
    let mut map: BTreeMap<String, VersionedEntry> = BTreeMap::new();
    for (k, v) in entries {
        // Later duplicates with a greater order key win, mirroring merge.
        match map.get(&k) {
            Some(cur) if (cur.timestamp, cur.origin.clone()) >= (v.timestamp, v.origin.clone()) => {}
            _ => {
                map.insert(k, v);
            }
        }
    }
    RegistrySnapshot {
        version: SNAPSHOT_VERSION,
        entries: map,
    }
}

prop_compose! {
    // Tombstone state derives from the timestamp: a real node never reuses a
    // timestamp for different content, so equal (origin, ts) slots agree.
    fn arb_entry()(origin in 1u8..6, agent in "[a-c]", ts in 1u64..50)
        -> (String, VersionedEntry) {
        entry(origin, &agent, ts, ts % 2 == 0)
    }
}

fn arb_snapshot() -> impl Strategy<Value = RegistrySnapshot> {
    proptest::collection::vec(arb_entry(), 0..12).prop_map(snapshot)
}

fn canonical(reg: &AgentRegistry) -> Vec<(String, u64, String, bool)> {
    reg.snapshot()
        .entries
        .into_iter()
        .map(|(k, v)| (k, v.timestamp, v.origin.as_str().to_string(), v.tombstone))
        .collect()
}

proptest! {
    #[test]
    fn merge_is_idempotent(snap in arb_snapshot()) {
        let reg = AgentRegistry::new(nid(99));
        reg.merge(&snap).expect("merge");
        let once = canonical(&reg);
        reg.merge(&snap).expect("merge");
        prop_assert_eq!(once, canonical(&reg));
    }

    #[test]
    fn merge_order_does_not_matter(s1 in arb_snapshot(), s2 in arb_snapshot()) {
        let left = AgentRegistry::new(nid(99));
        left.merge(&s1).expect("merge");
        left.merge(&s2).expect("merge");

        let right = AgentRegistry::new(nid(99));
        right.merge(&s2).expect("merge");
        right.merge(&s1).expect("merge");

        prop_assert_eq!(canonical(&left), canonical(&right));
    }

    #[test]
    fn replicas_converge_after_cross_merge(s1 in arb_snapshot(), s2 in arb_snapshot()) {
        let a = AgentRegistry::new(nid(98));
        let b = AgentRegistry::new(nid(99));
        a.merge(&s1).expect("merge");
        b.merge(&s2).expect("merge");

        a.merge(&b.snapshot()).expect("merge");
        b.merge(&a.snapshot()).expect("merge");
        a.merge(&b.snapshot()).expect("merge");

        prop_assert_eq!(canonical(&a), canonical(&b));
    }
}
