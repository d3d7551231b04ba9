// Copyright (c) 2026 Dawn Mesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

use dawn_mesh::core::config::NodeConfig;
use dawn_mesh::networking::discovery;
use dawn_mesh::networking::node::{AgentHandler, HandlerFuture, P2pNode};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

fn test_config(root: &std::path::Path) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.node.address = "ws://127.0.0.1:0".to_string();
    cfg.observability.metrics_port = 0;
    cfg.data_root = root.to_path_buf();
    cfg
}

struct EchoAgent;

impl AgentHandler for EchoAgent {
    fn call(&self, op: String, params: Value) -> HandlerFuture {
        Box::pin(async move { Ok(json!({ "op": op, "params": params })) })
    }
}

async fn gossip_rounds(nodes: &[&P2pNode], rounds: usize) {
    for _ in 0..rounds {
        for node in nodes {
            discovery::gossip_round(node, 3, 10, 0).await;
        }
    }
}

fn listed_keys(node: &P2pNode) -> BTreeSet<String> {
    node.agents()
        .list_agents(false)
        .into_iter()
        .map(|e| format!("{}:{}", e.origin, e.agent_id))
        .collect()
}

#[tokio::test]
async fn triangle_converges_and_tombstone_wins() {
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().expect("tempdir")).collect();
    let a = P2pNode::start(test_config(dirs[0].path())).await.expect("boot a");
    let b = P2pNode::start(test_config(dirs[1].path())).await.expect("boot b");
    let c = P2pNode::start(test_config(dirs[2].path())).await.expect("boot c");

    // Triangle topology.
    a.connect_to_address(&b.advertised_address()).await.expect("a-b");
    a.connect_to_address(&c.advertised_address()).await.expect("a-c");
    b.connect_to_address(&c.advertised_address()).await.expect("b-c");

    // Same agent id on two different owners.
    a.register_local_agent("agent1", "Agent One", "", vec![], Arc::new(EchoAgent));
    b.register_local_agent("agent1", "Agent One", "", vec![], Arc::new(EchoAgent));

    gossip_rounds(&[&a, &b, &c], 2).await;

    let expected: BTreeSet<String> = [
        format!("{}:agent1", a.node_id()),
        format!("{}:agent1", b.node_id()),
    ]
    .into_iter()
    .collect();
    for node in [&a, &b, &c] {
        assert_eq!(listed_keys(node), expected, "node {}", node.node_id());
    }

    // A unregisters; the tombstone propagates and only B's entry remains.
    a.unregister_local_agent("agent1");
    gossip_rounds(&[&a, &b, &c], 2).await;

    let expected: BTreeSet<String> = [format!("{}:agent1", b.node_id())].into_iter().collect();
    for node in [&a, &b, &c] {
        assert_eq!(listed_keys(node), expected, "node {}", node.node_id());
    }

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn bootstrap_exchanges_agent_snapshots() {
    let a_dir = tempfile::tempdir().expect("tempdir");
    let b_dir = tempfile::tempdir().expect("tempdir");

    let b = P2pNode::start(test_config(b_dir.path())).await.expect("boot b");
    b.register_local_agent("files", "Files", "", vec![], Arc::new(EchoAgent));

    let mut a_cfg = test_config(a_dir.path());
    a_cfg.node.bootstrap_nodes = vec![b.advertised_address()];
    let a = P2pNode::start(a_cfg).await.expect("boot a");

    // Bootstrap runs in the background; poll until it lands.
    let key = format!("{}:files", b.node_id());
    let mut found = false;
    for _ in 0..100 {
        if a.agents().get(&key).is_some() {
            found = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(found, "bootstrap did not replicate the agent registry");
    assert!(a.is_ready());

    a.shutdown().await;
    b.shutdown().await;
}
