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

//! Dawn Mesh - a decentralized peer-to-peer node hosting local agents behind
//! a JSON-RPC 2.0 surface.
//!
//! This crate provides:
//! - Long-lived Ed25519 node identity with optional passphrase wrapping
//! - Encrypted WebSocket transport (signed X25519 key exchange, AES-256-GCM)
//! - Persistent trust records, permission grants, and a security audit log
//! - Request routing with per-peer rate limiting, circuit breakers, and retry
//! - Gossip-based peer discovery and an eventually consistent agent registry
//! - Monitoring via Prometheus metrics and HTTP health probes

/// Core protocol primitives (config, types, storage, security).
pub mod core;
/// Observability (metrics, health probes).
pub mod monitoring;
/// P2P networking stack (transport, routing, discovery, resilience).
pub mod networking;
