// Copyright (c) 2026 Dawn Mesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

use dawn_mesh::core::config::NodeConfig;
use dawn_mesh::core::security::authorizer::Permission;
use dawn_mesh::core::types::{RpcRequest, RPC_UNAUTHORIZED};
use dawn_mesh::networking::node::{AgentHandler, HandlerFuture, P2pNode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn test_config(root: &std::path::Path) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.node.address = "ws://127.0.0.1:0".to_string();
    cfg.observability.metrics_port = 0;
    cfg.data_root = root.to_path_buf();
    cfg
}

struct CountingAgent {
    calls: Arc<AtomicU64>,
}

impl AgentHandler for CountingAgent {
    fn call(&self, _op: String, _params: Value) -> HandlerFuture {
        let calls = self.calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "stored": true }))
        })
    }
}

#[tokio::test]
async fn unauthorized_call_is_refused_without_touching_the_handler() {
    let b_dir = tempfile::tempdir().expect("tempdir");
    let c_dir = tempfile::tempdir().expect("tempdir");

    let b = P2pNode::start(test_config(b_dir.path())).await.expect("boot b");
    let calls = Arc::new(AtomicU64::new(0));
    b.register_local_agent(
        "first_agent",
        "First Agent",
        "memory store",
        vec![],
        Arc::new(CountingAgent { calls: calls.clone() }),
    );

    let c = P2pNode::start(test_config(c_dir.path())).await.expect("boot c");
    let b_id = c
        .connect_to_address(&b.advertised_address())
        .await
        .expect("connect");

    let req = RpcRequest::new(
        json!(1),
        "first_agent/memory_store",
        Some(json!({ "content": "x" })),
    );
    let resp = c.request_peer(&b_id, req).await.expect("request");

    assert_eq!(resp.id, json!(1));
    assert!(resp.result.is_none());
    let err = resp.error.expect("error");
    assert_eq!(err.code, RPC_UNAUTHORIZED);
    assert_eq!(err.message, "unauthorized");

    // The handler was never invoked, and exactly one denial was audited.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(b.audit_event_count("access_denied"), 1);

    c.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn granted_peer_reaches_the_handler() {
    let b_dir = tempfile::tempdir().expect("tempdir");
    let c_dir = tempfile::tempdir().expect("tempdir");

    let b = P2pNode::start(test_config(b_dir.path())).await.expect("boot b");
    let calls = Arc::new(AtomicU64::new(0));
    b.register_local_agent(
        "first_agent",
        "First Agent",
        "memory store",
        vec![],
        Arc::new(CountingAgent { calls: calls.clone() }),
    );

    let c = P2pNode::start(test_config(c_dir.path())).await.expect("boot c");
    let b_id = c
        .connect_to_address(&b.advertised_address())
        .await
        .expect("connect");

    b.authorizer()
        .grant(c.node_id(), Permission::AgentExecute)
        .expect("grant");

    let req = RpcRequest::new(json!(2), "first_agent/memory_store", Some(json!({ "content": "y" })));
    let resp = c.request_peer(&b_id, req).await.expect("request");

    assert_eq!(resp.id, json!(2));
    assert_eq!(resp.result.expect("result")["stored"], true);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Shorthand form reaches the first registered agent.
    let req = RpcRequest::new(json!(3), "memory_store", None);
    let resp = c.request_peer(&b_id, req).await.expect("request");
    assert!(resp.error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    c.shutdown().await;
    b.shutdown().await;
}
