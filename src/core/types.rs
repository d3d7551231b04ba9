// Copyright (c) 2026 Dawn Mesh
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Core identifiers, JSON-RPC 2.0 envelopes, and wire-frame variants.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Identifier and envelope errors.
#[derive(Debug, Error)]
pub enum TypeError {
    /// Not a valid node id (lowercase hex of a 32-byte key).
    #[error("invalid node id")]
    InvalidNodeId,
    /// Method string does not match the supported grammar.
    #[error("invalid method")]
    InvalidMethod,
}

/// Node identifier: lowercase hex of the node's 32-byte Ed25519 public key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Derive from a public key.
    pub fn from_public_key(pk: &[u8; 32]) -> Self {
        Self(hex::encode(pk))
    }

    /// Parse and validate a candidate id string.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        if s.len() != 64 {
            return Err(TypeError::InvalidNodeId);
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(TypeError::InvalidNodeId);
        }
        Ok(Self(s.to_string()))
    }

    /// Hex string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode back to the raw public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        // Valid hex by construction.
        if let Ok(bytes) = hex::decode(&self.0) {
            if bytes.len() == 32 {
                out.copy_from_slice(&bytes);
            }
        }
        out
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", &self.0[..self.0.len().min(8)])
    }
}

/// Composite agent key `node_id:agent_id`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentKey {
    /// Owning node.
    pub node: NodeId,
    /// Agent name on that node.
    pub agent: String,
}

impl AgentKey {
    /// Canonical composite string form.
    pub fn composite(&self) -> String {
        format!("{}:{}", self.node, self.agent)
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.agent)
    }
}

/// Parsed JSON-RPC method target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MethodTarget {
    /// `node/<op>` built-in.
    Node(String),
    /// `gossip/<op>` built-in.
    Gossip(String),
    /// Agent invocation: explicit node/agent or local shorthand.
    Agent {
        /// Addressed node; `None` means the receiving node.
        node: Option<NodeId>,
        /// Agent id; `None` means the first local agent.
        agent: Option<String>,
        /// Operation name.
        op: String,
    },
}

/// Parse the method grammar:
/// `[<node_id>:]<agent_id>/<operation>` | `node/<op>` | `gossip/<op>` | `<operation>`.
pub fn parse_method(method: &str) -> Result<MethodTarget, TypeError> {
    if method.is_empty() {
        return Err(TypeError::InvalidMethod);
    }
    let Some((prefix, op)) = method.split_once('/') else {
        // Bare operation: shorthand for the first local agent.
        return Ok(MethodTarget::Agent {
            node: None,
            agent: None,
            op: method.to_string(),
        });
    };
    if prefix.is_empty() || op.is_empty() || op.contains('/') {
        return Err(TypeError::InvalidMethod);
    }
    match prefix {
        "node" => Ok(MethodTarget::Node(op.to_string())),
        "gossip" => Ok(MethodTarget::Gossip(op.to_string())),
        _ => {
            if let Some((node, agent)) = prefix.split_once(':') {
                if agent.is_empty() {
                    return Err(TypeError::InvalidMethod);
                }
                let node = NodeId::parse(node)?;
                Ok(MethodTarget::Agent {
                    node: Some(node),
                    agent: Some(agent.to_string()),
                    op: op.to_string(),
                })
            } else {
                Ok(MethodTarget::Agent {
                    node: None,
                    agent: Some(prefix.to_string()),
                    op: op.to_string(),
                })
            }
        }
    }
}

/// JSON-RPC parse error.
pub const RPC_PARSE_ERROR: i64 = -32700;
/// JSON-RPC invalid request.
pub const RPC_INVALID_REQUEST: i64 = -32600;
/// JSON-RPC method not found.
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;
/// Rate limit exceeded (carries `retry_after` data).
pub const RPC_RATE_LIMITED: i64 = -32000;
/// Sender lacks the required permission.
pub const RPC_UNAUTHORIZED: i64 = -32001;
/// Node is draining and refuses new requests.
pub const RPC_DRAINING: i64 = -32002;
/// Internal or handler error.
pub const RPC_INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC 2.0 request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Request id; absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Method name.
    pub method: String,
    /// Free-form parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Build a request with the given id.
    pub fn new(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Machine-readable detail map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error with no data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a data payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// JSON-RPC 2.0 response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Mirrors the request id (null for unparseable requests).
    pub id: Value,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Success response.
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response.
    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A wire frame as carried in one WebSocket text frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    /// Signed ephemeral key exchange, sent once per connection per side.
    KeyExchange {
        /// Ephemeral X25519 public key, hex.
        public_key: String,
        /// Sender's long-term node id.
        node_id: String,
        /// Ed25519 signature over the handshake transcript digest, hex.
        signature: String,
    },
    /// AEAD-protected data frame.
    Encrypted {
        /// 12-byte AES-GCM nonce, hex.
        nonce: String,
        /// Ciphertext with appended tag, hex.
        ciphertext: String,
        /// Ed25519 signature over SHA-256(nonce || ciphertext || sender), hex.
        signature: String,
        /// Sender node id.
        sender: String,
    },
    /// Signed-but-unencrypted data frame (mutually-configured plaintext mode only).
    Plain {
        /// Inner JSON-RPC payload.
        payload: Value,
        /// Ed25519 signature over SHA-256(payload_bytes || sender), hex.
        signature: String,
        /// Sender node id.
        sender: String,
    },
}

/// Wall-clock milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
