// Copyright (c) 2026 Dawn Mesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

use dawn_mesh::core::config::NodeConfig;
use dawn_mesh::core::security::authorizer::Permission;
use dawn_mesh::core::types::{RpcRequest, RPC_RATE_LIMITED};
use dawn_mesh::networking::node::{AgentHandler, HandlerFuture, P2pNode};
use serde_json::{json, Value};
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

#[tokio::test]
async fn third_request_in_the_window_is_rate_limited() {
    let b_dir = tempfile::tempdir().expect("tempdir");
    let c_dir = tempfile::tempdir().expect("tempdir");

    let mut b_cfg = test_config(b_dir.path());
    b_cfg.resilience.rate_limit.max_requests = 2;
    b_cfg.resilience.rate_limit.time_window = 60.0;
    b_cfg.resilience.rate_limit.burst = 2;
    let b = P2pNode::start(b_cfg).await.expect("boot b");
    b.register_local_agent("echo", "Echo", "", vec![], Arc::new(EchoAgent));

    let c = P2pNode::start(test_config(c_dir.path())).await.expect("boot c");
    let b_id = c
        .connect_to_address(&b.advertised_address())
        .await
        .expect("connect");
    b.authorizer()
        .grant(c.node_id(), Permission::AgentExecute)
        .expect("grant");

    let first = c
        .request_peer(&b_id, RpcRequest::new(json!(1), "echo/ping", None))
        .await
        .expect("request");
    assert!(first.error.is_none());

    let second = c
        .request_peer(&b_id, RpcRequest::new(json!(2), "echo/ping", None))
        .await
        .expect("request");
    assert!(second.error.is_none());

    let third = c
        .request_peer(&b_id, RpcRequest::new(json!(3), "echo/ping", None))
        .await
        .expect("request");
    let err = third.error.expect("error");
    assert_eq!(err.code, RPC_RATE_LIMITED);
    let retry_after = err.data.expect("data")["retry_after"]
        .as_f64()
        .expect("retry_after");
    assert!(retry_after > 0.0);

    assert!(b.audit_event_count("rate_limited") >= 1);

    c.shutdown().await;
    b.shutdown().await;
}
