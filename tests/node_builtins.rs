// Copyright (c) 2026 Dawn Mesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

use dawn_mesh::core::config::NodeConfig;
use dawn_mesh::core::security::authorizer::Permission;
use dawn_mesh::core::types::{RpcRequest, RPC_DRAINING, RPC_METHOD_NOT_FOUND, RPC_PARSE_ERROR};
use dawn_mesh::networking::node::{AgentHandler, HandlerFuture, Lifecycle, P2pNode};
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
async fn node_get_info_reports_identity_and_version() {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = P2pNode::start(test_config(dir.path())).await.expect("boot");
    node.register_local_agent("echo", "Echo", "", vec![], Arc::new(EchoAgent));

    let self_id = node.node_id().clone();
    let req = serde_json::to_value(RpcRequest::new(json!(1), "node/get_info", None)).expect("req");
    let reply = node.handle_rpc(&self_id, req).await.expect("reply");

    assert_eq!(reply["result"]["node_id"], self_id.as_str());
    assert_eq!(reply["result"]["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(reply["result"]["agents"], 1);

    node.shutdown().await;
}

#[tokio::test]
async fn node_list_agents_and_peers_round_trip_over_the_wire() {
    let a_dir = tempfile::tempdir().expect("tempdir");
    let b_dir = tempfile::tempdir().expect("tempdir");

    let b = P2pNode::start(test_config(b_dir.path())).await.expect("boot b");
    b.register_local_agent("memory", "Memory", "notes", vec![], Arc::new(EchoAgent));

    let a = P2pNode::start(test_config(a_dir.path())).await.expect("boot a");
    let b_id = a
        .connect_to_address(&b.advertised_address())
        .await
        .expect("connect");

    // A verified peer may use node/* without an explicit grant.
    let resp = a
        .request_peer(&b_id, RpcRequest::new(json!(1), "node/list_agents", None))
        .await
        .expect("request");
    let agents = resp.result.expect("result");
    assert_eq!(agents.as_array().expect("array").len(), 1);
    assert_eq!(agents[0]["agent_id"], "memory");

    let resp = a
        .request_peer(&b_id, RpcRequest::new(json!(2), "node/list_peers", None))
        .await
        .expect("request");
    let peers = resp.result.expect("result");
    assert!(peers
        .as_array()
        .expect("array")
        .iter()
        .any(|p| p["node_id"] == a.node_id().as_str()));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn malformed_and_unknown_methods_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = P2pNode::start(test_config(dir.path())).await.expect("boot");
    let self_id = node.node_id().clone();

    let reply = node
        .handle_rpc(&self_id, json!({ "not": "jsonrpc" }))
        .await
        .expect("reply");
    assert_eq!(reply["error"]["code"], RPC_PARSE_ERROR);

    let req = serde_json::to_value(RpcRequest::new(json!(1), "node/no_such_op", None)).expect("req");
    let reply = node.handle_rpc(&self_id, req).await.expect("reply");
    assert_eq!(reply["error"]["code"], RPC_METHOD_NOT_FOUND);

    let req = serde_json::to_value(RpcRequest::new(json!(2), "missing_agent/op", None)).expect("req");
    let reply = node.handle_rpc(&self_id, req).await.expect("reply");
    assert_eq!(reply["error"]["code"], RPC_METHOD_NOT_FOUND);

    node.shutdown().await;
}

#[tokio::test]
async fn draining_node_refuses_new_requests() {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = P2pNode::start(test_config(dir.path())).await.expect("boot");
    assert_eq!(node.lifecycle(), Lifecycle::Running);
    let self_id = node.node_id().clone();

    node.shutdown().await;
    assert_eq!(node.lifecycle(), Lifecycle::Stopped);

    let req = serde_json::to_value(RpcRequest::new(json!(1), "node/get_info", None)).expect("req");
    let reply = node.handle_rpc(&self_id, req).await.expect("reply");
    assert_eq!(reply["error"]["code"], RPC_DRAINING);
}

#[tokio::test]
async fn requests_are_proxied_to_the_addressed_node() {
    let a_dir = tempfile::tempdir().expect("tempdir");
    let b_dir = tempfile::tempdir().expect("tempdir");
    let c_dir = tempfile::tempdir().expect("tempdir");

    // A hosts the agent; B relays; C calls through B.
    let a = P2pNode::start(test_config(a_dir.path())).await.expect("boot a");
    a.register_local_agent("echo", "Echo", "", vec![], Arc::new(EchoAgent));
    let b = P2pNode::start(test_config(b_dir.path())).await.expect("boot b");
    let c = P2pNode::start(test_config(c_dir.path())).await.expect("boot c");

    let a_id = b
        .connect_to_address(&a.advertised_address())
        .await
        .expect("b-a");
    let b_id = c
        .connect_to_address(&b.advertised_address())
        .await
        .expect("c-b");

    b.authorizer()
        .grant(c.node_id(), Permission::AgentExecute)
        .expect("grant");
    a.authorizer()
        .grant(b.node_id(), Permission::AgentExecute)
        .expect("grant");

    let method = format!("{a_id}:echo/ping");
    let resp = c
        .request_peer(&b_id, RpcRequest::new(json!(42), &method, Some(json!({ "n": 1 }))))
        .await
        .expect("request");

    assert_eq!(resp.id, json!(42));
    let result = resp.result.expect("result");
    assert_eq!(result["op"], "ping");
    assert_eq!(result["params"]["n"], 1);

    c.shutdown().await;
    b.shutdown().await;
    a.shutdown().await;
}
