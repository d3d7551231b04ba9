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

//! Peer discovery: bootstrap dialing, local-network announce, and gossip.
//!
//! All three sources are advisory. They feed the peer registry and the
//! distributed agent registry; trust decisions stay with the validator.

use crate::core::config::NodeConfig;
use crate::core::security::crypto::random_u64;
use crate::core::types::{now_ms, NodeId, RpcRequest};
use crate::networking::agent_registry::RegistrySnapshot;
use crate::networking::node::P2pNode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Default gossip fanout.
pub const DEFAULT_FANOUT: usize = 3;
/// Default peer-list sample size.
pub const DEFAULT_SAMPLE: usize = 10;
/// Default gossip interval.
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(30);
/// Default LAN announce interval.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);
/// Multicast group for LAN announces.
pub const ANNOUNCE_GROUP: Ipv4Addr = Ipv4Addr::new(239, 84, 11, 7);
/// UDP port for LAN announces.
pub const ANNOUNCE_PORT: u16 = 8427;
/// GC horizon for entries owned by unreachable nodes.
const UNREACHABLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Peers below this health with no session count as unreachable.
const UNREACHABLE_HEALTH: f64 = 0.05;

/// Gossiped peer-list sample.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerSample {
    /// Schema version.
    pub version: u32,
    /// Sampled peers.
    pub peers: Vec<SampledPeer>,
}

/// One gossiped peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SampledPeer {
    /// Peer id.
    pub node_id: NodeId,
    /// Advertised address.
    #[serde(default)]
    pub address: String,
}

/// LAN announce record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnnounceRecord {
    /// Announcing node.
    pub node_id: NodeId,
    /// Its WS listen address.
    pub address: String,
    /// Agent ids hosted there.
    #[serde(default)]
    pub agents: Vec<String>,
}

/// Discovery knobs.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Addresses dialed at startup.
    pub bootstrap_nodes: Vec<String>,
    /// Gossip period (jittered +/-10 %).
    pub gossip_interval: Duration,
    /// Peers gossiped to per round.
    pub fanout: usize,
    /// Peer-list sample size per round.
    pub sample: usize,
    /// LAN announce period.
    pub announce_interval: Duration,
    /// Enable the multicast announce task.
    pub enable_announce: bool,
}

impl DiscoveryConfig {
    /// Derive from node config with protocol defaults.
    pub fn from_node_config(cfg: &NodeConfig) -> Self {
        Self {
            bootstrap_nodes: cfg.node.bootstrap_nodes.clone(),
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            fanout: DEFAULT_FANOUT,
            sample: DEFAULT_SAMPLE,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            enable_announce: true,
        }
    }
}

/// Spawn the three discovery tasks for `node`.
pub fn spawn(node: P2pNode, cfg: DiscoveryConfig) {
    {
        let node = node.clone();
        let bootstrap = cfg.bootstrap_nodes.clone();
        tokio::spawn(async move {
            run_bootstrap(&node, &bootstrap).await;
            node.mark_ready();
        });
    }
    {
        let node = node.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move {
            run_gossip(node, cfg).await;
        });
    }
    if cfg.enable_announce {
        tokio::spawn(async move {
            run_announce(node, cfg).await;
        });
    }
}

/// Dial each bootstrap address and exchange peer-list and agent-registry
/// snapshots with the ones that answer.
pub async fn run_bootstrap(node: &P2pNode, bootstrap: &[String]) {
    for addr in bootstrap.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
        match node.connect_to_address(addr).await {
            Ok(peer) => {
                info!(boot = %addr, peer = %peer, "bootstrap peer connected");
                exchange_with(node, &peer).await;
            }
            Err(e) => warn!(boot = %addr, err = %e, "bootstrap dial failed"),
        }
    }
}

/// One peer-list + agent-snapshot exchange with `peer`.
async fn exchange_with(node: &P2pNode, peer: &NodeId) {
    let sample = node.peer_sample(DEFAULT_SAMPLE);
    if let Ok(params) = serde_json::to_value(&sample) {
        let req = RpcRequest::new(json!(0), "gossip/peers", Some(params));
        match node.request_peer(peer, req).await {
            Ok(resp) => {
                if let Some(result) = resp.result {
                    if let Ok(theirs) = serde_json::from_value::<PeerSample>(result) {
                        node.merge_peer_sample(&theirs);
                    }
                }
            }
            Err(e) => debug!(peer = %peer, err = %e, "peer-list exchange failed"),
        }
    }

    let snapshot = node.agents().snapshot();
    if let Ok(params) = serde_json::to_value(&snapshot) {
        let req = RpcRequest::new(json!(0), "gossip/agents", Some(params));
        match node.request_peer(peer, req).await {
            Ok(resp) => {
                if let Some(result) = resp.result {
                    if let Ok(theirs) = serde_json::from_value::<RegistrySnapshot>(result) {
                        if let Err(e) = node.agents().merge(&theirs) {
                            debug!(peer = %peer, err = %e, "agent snapshot merge failed");
                        }
                    }
                }
            }
            Err(e) => debug!(peer = %peer, err = %e, "agent snapshot exchange failed"),
        }
    }
}

/// Run one gossip round now: pick up to `fanout` random connected peers and
/// exchange an agent delta plus a peer sample of `sample_size` with each.
pub async fn gossip_round(node: &P2pNode, fanout: usize, sample_size: usize, delta_since_ms: u64) {
    let connected = node.connected_peers();
    if connected.is_empty() {
        return;
    }
    for peer in pick_random(&connected, fanout) {
        let delta = node.agents().delta_since(delta_since_ms);
        if !delta.entries.is_empty() {
            if let Ok(params) = serde_json::to_value(&delta) {
                let req = RpcRequest::new(json!(0), "gossip/agents", Some(params));
                if let Ok(resp) = node.request_peer(&peer, req).await {
                    if let Some(result) = resp.result {
                        if let Ok(theirs) = serde_json::from_value::<RegistrySnapshot>(result) {
                            let _ = node.agents().merge(&theirs);
                        }
                    }
                }
            }
        }

        let sample = node.peer_sample(sample_size);
        if let Ok(params) = serde_json::to_value(&sample) {
            let req = RpcRequest::new(json!(0), "gossip/peers", Some(params));
            if let Ok(resp) = node.request_peer(&peer, req).await {
                if let Some(result) = resp.result {
                    if let Ok(theirs) = serde_json::from_value::<PeerSample>(result) {
                        node.merge_peer_sample(&theirs);
                    }
                }
            }
        }
    }
}

async fn run_gossip(node: P2pNode, cfg: DiscoveryConfig) {
    let mut shutdown = node.shutdown_signal();
    let mut last_round_ms = 0u64;
    loop {
        let interval = jittered(cfg.gossip_interval);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        let round_start = now_ms();
        gossip_round(&node, cfg.fanout, cfg.sample, last_round_ms).await;
        last_round_ms = round_start;
        gc_unreachable(&node);
    }
}

fn gc_unreachable(node: &P2pNode) {
    let connected: BTreeSet<NodeId> = node.connected_peers().into_iter().collect();
    let unreachable: BTreeSet<NodeId> = node
        .peers()
        .list()
        .into_iter()
        .filter(|r| r.health_score < UNREACHABLE_HEALTH && !connected.contains(&r.node_id))
        .map(|r| r.node_id)
        .collect();
    node.agents().gc(&unreachable, UNREACHABLE_TTL);
}

async fn run_announce(node: P2pNode, cfg: DiscoveryConfig) {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, ANNOUNCE_PORT)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(err = %e, "announce socket unavailable; LAN discovery disabled");
            return;
        }
    };
    if let Err(e) = socket.join_multicast_v4(ANNOUNCE_GROUP, Ipv4Addr::UNSPECIFIED) {
        warn!(err = %e, "multicast join failed; LAN discovery disabled");
        return;
    }

    let mut shutdown = node.shutdown_signal();
    let mut buf = vec![0u8; 64 * 1024];
    let mut ticker = tokio::time::interval(cfg.announce_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let record = AnnounceRecord {
                    node_id: node.node_id().clone(),
                    address: node.advertised_address(),
                    agents: node
                        .agents()
                        .list_agents(true)
                        .into_iter()
                        .filter(|a| &a.origin == node.node_id())
                        .map(|a| a.agent_id)
                        .collect(),
                };
                if let Ok(bytes) = serde_json::to_vec(&record) {
                    let _ = socket.send_to(&bytes, (ANNOUNCE_GROUP, ANNOUNCE_PORT)).await;
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let Ok((n, _from)) = recv else { continue };
                let Ok(record) = serde_json::from_slice::<AnnounceRecord>(&buf[..n]) else {
                    continue;
                };
                if &record.node_id == node.node_id() {
                    continue;
                }
                node.merge_peer_sample(&PeerSample {
                    version: 1,
                    peers: vec![SampledPeer {
                        node_id: record.node_id,
                        address: record.address,
                    }],
                });
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Interval +/-10 % jitter.
fn jittered(base: Duration) -> Duration {
    let unit = (random_u64() >> 11) as f64 / (1u64 << 53) as f64;
    base.mul_f64(0.9 + 0.2 * unit)
}

/// Up to `n` distinct random picks from `items`.
fn pick_random(items: &[NodeId], n: usize) -> Vec<NodeId> {
    if items.len() <= n {
        return items.to_vec();
    }
    let mut picked = BTreeSet::new();
    while picked.len() < n {
        let idx = (random_u64() as usize) % items.len();
        picked.insert(items[idx].clone());
    }
    picked.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(30);
        for _ in 0..64 {
            let j = jittered(base);
            assert!(j >= Duration::from_secs(27));
            assert!(j <= Duration::from_secs(33));
        }
    }

    #[test]
    fn pick_random_is_bounded_and_distinct() {
        let ids: Vec<NodeId> = (0..10u8)
            .map(|i| NodeId::from_public_key(&[i; 32]))
            .collect();
        let picked = pick_random(&ids, 3);
        assert_eq!(picked.len(), 3);
        let set: BTreeSet<_> = picked.iter().collect();
        assert_eq!(set.len(), 3);

        let all = pick_random(&ids, 20);
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn announce_record_round_trips() {
        let rec = AnnounceRecord {
            node_id: NodeId::from_public_key(&[1u8; 32]),
            address: "ws://192.168.1.10:8420".into(),
            agents: vec!["memory".into()],
        };
        let raw = serde_json::to_vec(&rec).expect("encode");
        let back: AnnounceRecord = serde_json::from_slice(&raw).expect("decode");
        assert_eq!(back.node_id, rec.node_id);
        assert_eq!(back.agents, vec!["memory".to_string()]);
    }
}
