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
#![deny(missing_docs)]

//! Peer registry: persistent membership map at
//! `<data_root>/mesh/peer_registry.json`.
//!
//! Mutations mark the registry dirty and wake a background writer that
//! coalesces bursts into one atomic write. `flush` persists synchronously
//! for shutdown and tests.

use crate::core::storage::{atomic_write_json, read_json, StorageError};
use crate::core::types::{now_ms, NodeId};
use crate::core::security::crypto::random_u64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::warn;

/// Health score gain on success: `score += (1 - score) * SUCCESS_FACTOR`.
const SUCCESS_FACTOR: f64 = 0.3;
/// Health score loss on failure: `score *= 1 - FAILURE_FACTOR`.
const FAILURE_FACTOR: f64 = 0.4;
/// Coalescing window for the background writer.
const WRITE_COALESCE: Duration = Duration::from_millis(200);

/// Peer registry errors.
#[derive(Debug, Error)]
pub enum PeerRegistryError {
    /// Persistence failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One known peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer id.
    pub node_id: NodeId,
    /// Advertised address, `ws://host:port`.
    pub address: String,
    /// Last-known public key (hex), pinned after first verification.
    #[serde(default)]
    pub public_key: Option<String>,
    /// First discovery time (ms).
    pub first_seen: u64,
    /// Last activity time (ms).
    pub last_seen: u64,
    /// Health score in [0, 1].
    pub health_score: f64,
    /// Successful connection count.
    pub connection_success: u64,
    /// Failed connection count.
    pub connection_failure: u64,
}

/// Persistent peer map with health scoring.
pub struct PeerRegistry {
    path: PathBuf,
    peers: Mutex<BTreeMap<NodeId, PeerRecord>>,
    dirty: AtomicBool,
    write_failed: AtomicBool,
    notify: Notify,
}

impl PeerRegistry {
    /// Load from `<data_root>/mesh/peer_registry.json` (empty if absent).
    pub fn load(data_root: &Path) -> Result<Self, PeerRegistryError> {
        let path = data_root.join("mesh").join("peer_registry.json");
        let peers: BTreeMap<NodeId, PeerRecord> = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            peers: Mutex::new(peers),
            dirty: AtomicBool::new(false),
            write_failed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<NodeId, PeerRecord>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Insert or refresh a peer observed through discovery or a handshake.
    pub fn observe(&self, node_id: &NodeId, address: &str, public_key: Option<String>) {
        let now = now_ms();
        {
            let mut peers = self.lock();
            let rec = peers.entry(node_id.clone()).or_insert_with(|| PeerRecord {
                node_id: node_id.clone(),
                address: address.to_string(),
                public_key: None,
                first_seen: now,
                last_seen: now,
                health_score: 0.5,
                connection_success: 0,
                connection_failure: 0,
            });
            if !address.is_empty() {
                rec.address = address.to_string();
            }
            if let Some(pk) = public_key {
                rec.public_key = Some(pk);
            }
            rec.last_seen = now;
        }
        self.mark_dirty();
    }

    /// Record a successful connection; raises health toward 1.0.
    pub fn record_success(&self, node_id: &NodeId) {
        {
            let mut peers = self.lock();
            if let Some(rec) = peers.get_mut(node_id) {
                rec.connection_success += 1;
                rec.last_seen = now_ms();
                rec.health_score += (1.0 - rec.health_score) * SUCCESS_FACTOR;
                rec.health_score = rec.health_score.clamp(0.0, 1.0);
            }
        }
        self.mark_dirty();
    }

    /// Record a failed connection; lowers health.
    pub fn record_failure(&self, node_id: &NodeId) {
        {
            let mut peers = self.lock();
            if let Some(rec) = peers.get_mut(node_id) {
                rec.connection_failure += 1;
                rec.health_score *= 1.0 - FAILURE_FACTOR;
                rec.health_score = rec.health_score.clamp(0.0, 1.0);
            }
        }
        self.mark_dirty();
    }

    /// Explicit removal; peers are never deleted silently.
    pub fn remove(&self, node_id: &NodeId) -> Option<PeerRecord> {
        let removed = self.lock().remove(node_id);
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    /// Remove every record.
    pub fn clear(&self) {
        self.lock().clear();
        self.mark_dirty();
    }

    /// Record for a peer.
    pub fn get(&self, node_id: &NodeId) -> Option<PeerRecord> {
        self.lock().get(node_id).cloned()
    }

    /// All records.
    pub fn list(&self) -> Vec<PeerRecord> {
        self.lock().values().cloned().collect()
    }

    /// Up to `n` records, picked pseudo-randomly for gossip samples.
    pub fn sample(&self, n: usize) -> Vec<PeerRecord> {
        let peers = self.lock();
        let len = peers.len();
        if len <= n {
            return peers.values().cloned().collect();
        }
        let start = (random_u64() as usize) % len;
        peers
            .values()
            .cycle()
            .skip(start)
            .take(n)
            .cloned()
            .collect()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no peers are known.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// True while the last persistence attempt failed.
    pub fn write_failed(&self) -> bool {
        self.write_failed.load(Ordering::Relaxed)
    }

    /// Persist the current map now (atomic write), clearing the dirty flag.
    pub fn flush(&self) -> Result<(), PeerRegistryError> {
        let snapshot = self.lock().clone();
        self.dirty.store(false, Ordering::Release);
        match atomic_write_json(&self.path, &snapshot) {
            Ok(()) => {
                self.write_failed.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                // The in-memory mutation stands; the dirty flag ensures the
                // next successful write carries it.
                self.dirty.store(true, Ordering::Release);
                self.write_failed.store(true, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Background writer: coalesces dirty notifications into atomic writes.
    /// Runs until `shutdown` flips to true, flushing once more on the way out.
    pub fn spawn_writer(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = registry.notify.notified() => {
                        // Let a burst of mutations settle into one write.
                        tokio::time::sleep(WRITE_COALESCE).await;
                        if registry.dirty.load(Ordering::Acquire) {
                            if let Err(e) = registry.flush() {
                                warn!(err = %e, "peer registry persist failed");
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            if registry.dirty.load(Ordering::Acquire) {
                                let _ = registry.flush();
                            }
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(byte: u8) -> NodeId {
        NodeId::from_public_key(&[byte; 32])
    }

    #[test]
    fn observe_then_flush_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = PeerRegistry::load(dir.path()).expect("load");
        reg.observe(&nid(1), "ws://10.0.0.1:8420", None);
        reg.observe(&nid(2), "ws://10.0.0.2:8420", Some(hex::encode([2u8; 32])));
        reg.flush().expect("flush");

        let reloaded = PeerRegistry::load(dir.path()).expect("reload");
        assert_eq!(reloaded.len(), 2);
        let rec = reloaded.get(&nid(2)).expect("record");
        assert_eq!(rec.address, "ws://10.0.0.2:8420");
        assert_eq!(rec.public_key.as_deref(), Some(hex::encode([2u8; 32]).as_str()));
    }

    #[test]
    fn health_moves_with_outcomes_and_stays_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = PeerRegistry::load(dir.path()).expect("load");
        let peer = nid(3);
        reg.observe(&peer, "ws://10.0.0.3:8420", None);

        let base = reg.get(&peer).expect("record").health_score;
        reg.record_success(&peer);
        let up = reg.get(&peer).expect("record").health_score;
        assert!(up > base);

        for _ in 0..50 {
            reg.record_success(&peer);
        }
        assert!(reg.get(&peer).expect("record").health_score <= 1.0);

        for _ in 0..50 {
            reg.record_failure(&peer);
        }
        let down = reg.get(&peer).expect("record");
        assert!(down.health_score >= 0.0 && down.health_score < up);
        assert_eq!(down.connection_failure, 50);
    }

    #[test]
    fn remove_is_explicit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = PeerRegistry::load(dir.path()).expect("load");
        reg.observe(&nid(4), "ws://10.0.0.4:8420", None);
        assert!(reg.remove(&nid(4)).is_some());
        assert!(reg.get(&nid(4)).is_none());
        assert!(reg.remove(&nid(4)).is_none());
    }

    #[test]
    fn sample_is_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = PeerRegistry::load(dir.path()).expect("load");
        for i in 0..20u8 {
            reg.observe(&nid(i), &format!("ws://10.0.0.{i}:8420"), None);
        }
        assert_eq!(reg.sample(10).len(), 10);
        assert_eq!(reg.sample(50).len(), 20);
    }

    #[tokio::test]
    async fn writer_task_coalesces_mutations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = Arc::new(PeerRegistry::load(dir.path()).expect("load"));
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = reg.spawn_writer(rx);

        for i in 0..10u8 {
            reg.observe(&nid(i), &format!("ws://10.1.0.{i}:8420"), None);
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        let reloaded = PeerRegistry::load(dir.path()).expect("reload");
        assert_eq!(reloaded.len(), 10);

        let _ = tx.send(true);
        let _ = handle.await;
    }
}
