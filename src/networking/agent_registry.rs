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

//! Distributed agent registry: a last-write-wins replicated map keyed by
//! `node_id:agent_id`.
//!
//! Per-key winners are chosen by the `(timestamp, node_id)` total order,
//! where `timestamp` is the owning node's monotonic counter. Tombstones are
//! retained for a TTL before garbage collection. The registry is eventually
//! consistent under gossip and never blocks on consensus.

use crate::core::types::{now_ms, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Snapshot schema version carried in gossip payloads.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Default tombstone retention (24 h).
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Snapshot carries an unsupported schema version.
    #[error("unsupported snapshot version")]
    UnsupportedVersion,
}

/// Declared capability category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Invocable tool endpoint.
    Tool,
    /// Readable resource endpoint.
    Resource,
    /// Prompt template endpoint.
    Prompt,
}

/// One declared capability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Category.
    pub kind: CapabilityKind,
    /// Endpoint name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

/// Advertised agent metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    /// Agent id, unique on its owning node.
    pub agent_id: String,
    /// Display name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Declared capabilities.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Owning node.
    pub origin: NodeId,
    /// Health score in [0, 1].
    pub health_score: f64,
    /// Availability flag.
    pub available: bool,
}

/// A registry slot: LWW metadata plus the (possibly tombstoned) entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntry {
    /// Owning node's monotonic counter value.
    pub timestamp: u64,
    /// Owning node (LWW tie-break).
    pub origin: NodeId,
    /// True when the slot is a deletion marker.
    #[serde(default)]
    pub tombstone: bool,
    /// Entry payload; absent on tombstones.
    #[serde(default)]
    pub entry: Option<AgentEntry>,
    /// Local wall-clock of the last write (TTL bookkeeping, not replicated order).
    #[serde(default)]
    pub updated_ms: u64,
}

impl VersionedEntry {
    fn order_key(&self) -> (u64, &NodeId) {
        (self.timestamp, &self.origin)
    }
}

/// Replicated registry state as carried by gossip.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Schema version.
    pub version: u32,
    /// Slots keyed by `node_id:agent_id`.
    pub entries: BTreeMap<String, VersionedEntry>,
}

/// Merge statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct MergeOutcome {
    /// Keys where the remote slot won.
    pub applied: usize,
    /// Keys where the local slot was newer or equal.
    pub ignored: usize,
}

/// The distributed agent registry.
pub struct AgentRegistry {
    local: NodeId,
    clock: AtomicU64,
    entries: Mutex<BTreeMap<String, VersionedEntry>>,
    tombstone_ttl: Duration,
}

impl AgentRegistry {
    /// New empty registry for `local`.
    pub fn new(local: NodeId) -> Self {
        Self::with_tombstone_ttl(local, DEFAULT_TOMBSTONE_TTL)
    }

    /// New registry with an explicit tombstone TTL.
    pub fn with_tombstone_ttl(local: NodeId, tombstone_ttl: Duration) -> Self {
        Self {
            local,
            clock: AtomicU64::new(0),
            entries: Mutex::new(BTreeMap::new()),
            tombstone_ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, VersionedEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn bump_clock(&self, seen: u64) {
        self.clock.fetch_max(seen, Ordering::SeqCst);
    }

    fn composite(&self, agent_id: &str) -> String {
        format!("{}:{}", self.local, agent_id)
    }

    /// Register (or update) a local agent; returns its new timestamp.
    pub fn register_local(
        &self,
        agent_id: &str,
        name: &str,
        description: &str,
        capabilities: Vec<Capability>,
    ) -> u64 {
        let ts = self.tick();
        let entry = AgentEntry {
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            capabilities,
            origin: self.local.clone(),
            health_score: 1.0,
            available: true,
        };
        self.lock().insert(
            self.composite(agent_id),
            VersionedEntry {
                timestamp: ts,
                origin: self.local.clone(),
                tombstone: false,
                entry: Some(entry),
                updated_ms: now_ms(),
            },
        );
        ts
    }

    /// Tombstone a local agent with a fresh timestamp.
    pub fn unregister_local(&self, agent_id: &str) -> u64 {
        let ts = self.tick();
        self.lock().insert(
            self.composite(agent_id),
            VersionedEntry {
                timestamp: ts,
                origin: self.local.clone(),
                tombstone: true,
                entry: None,
                updated_ms: now_ms(),
            },
        );
        ts
    }

    /// LWW merge of a remote snapshot. Per key the entry with the greater
    /// `(timestamp, node_id)` wins; ties keep the local slot.
    pub fn merge(&self, remote: &RegistrySnapshot) -> Result<MergeOutcome, RegistryError> {
        if remote.version != SNAPSHOT_VERSION {
            return Err(RegistryError::UnsupportedVersion);
        }
        let mut outcome = MergeOutcome::default();
        let now = now_ms();
        let mut max_seen = 0u64;
        {
            let mut entries = self.lock();
            for (key, incoming) in &remote.entries {
                max_seen = max_seen.max(incoming.timestamp);
                match entries.get(key) {
                    Some(current) if incoming.order_key() <= current.order_key() => {
                        outcome.ignored += 1;
                    }
                    _ => {
                        let mut slot = incoming.clone();
                        slot.updated_ms = now;
                        entries.insert(key.clone(), slot);
                        outcome.applied += 1;
                    }
                }
            }
        }
        // Lamport bump keeps later local writes strictly newer than anything
        // already observed from any origin.
        self.bump_clock(max_seen);
        Ok(outcome)
    }

    /// Full replicated state.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            entries: self.lock().clone(),
        }
    }

    /// Slots written locally (by merge or registration) at or after `since_ms`.
    pub fn delta_since(&self, since_ms: u64) -> RegistrySnapshot {
        RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            entries: self
                .lock()
                .iter()
                .filter(|(_, v)| v.updated_ms >= since_ms)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Live entries, optionally only the available ones.
    pub fn list_agents(&self, available_only: bool) -> Vec<AgentEntry> {
        self.lock()
            .values()
            .filter(|v| !v.tombstone)
            .filter_map(|v| v.entry.clone())
            .filter(|e| !available_only || e.available)
            .collect()
    }

    /// Live entries declaring a capability of `kind` (and `name`, if given).
    pub fn find_by_capability(&self, kind: CapabilityKind, name: Option<&str>) -> Vec<AgentEntry> {
        self.list_agents(true)
            .into_iter()
            .filter(|e| {
                e.capabilities
                    .iter()
                    .any(|c| c.kind == kind && name.map_or(true, |n| c.name == n))
            })
            .collect()
    }

    /// Entry by composite key `node_id:agent_id`.
    pub fn get(&self, composite_key: &str) -> Option<AgentEntry> {
        self.lock()
            .get(composite_key)
            .filter(|v| !v.tombstone)
            .and_then(|v| v.entry.clone())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().values().filter(|v| !v.tombstone).count()
    }

    /// True when no live entries exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired tombstones and entries owned by `unreachable` nodes whose
    /// last write is older than `node_ttl`.
    pub fn gc(&self, unreachable: &BTreeSet<NodeId>, node_ttl: Duration) {
        let now = now_ms();
        let tomb_ttl_ms = self.tombstone_ttl.as_millis() as u64;
        let node_ttl_ms = node_ttl.as_millis() as u64;
        self.lock().retain(|_, v| {
            let age = now.saturating_sub(v.updated_ms);
            if v.tombstone && age > tomb_ttl_ms {
                return false;
            }
            if !v.tombstone && unreachable.contains(&v.origin) && age > node_ttl_ms {
                return false;
            }
            true
        });
    }
}
