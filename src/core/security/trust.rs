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

//! Trust manager: persistent per-peer trust records at
//! `<data_root>/vault/trust.json`.
//!
//! Level rules:
//! - a record at VERIFIED or above always carries a non-empty public key;
//! - only an observed signature from the recorded key raises UNKNOWN to
//!   VERIFIED;
//! - TRUSTED and BOOTSTRAP are reachable only through manual configuration;
//! - any record may be demoted to UNTRUSTED at any time.

use crate::core::security::audit::{AuditKind, AuditLog};
use crate::core::security::crypto::ct_eq;
use crate::core::storage::{atomic_write_json, read_json, StorageError};
use crate::core::types::{now_ms, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Trust errors.
#[derive(Debug, Error)]
pub enum TrustError {
    /// Observed key does not match the recorded key.
    #[error("key mismatch")]
    KeyMismatch,
    /// Record is UNTRUSTED; verification is not applicable.
    #[error("peer untrusted")]
    Untrusted,
    /// VERIFIED and above require a public key.
    #[error("missing public key")]
    MissingKey,
    /// Persistence failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Coarse per-peer policy tag. Variant order defines the level ordering.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Refused outright.
    Untrusted,
    /// Never seen or not yet verified.
    #[default]
    Unknown,
    /// Key observed and pinned through a successful handshake.
    Verified,
    /// Manually trusted by the operator.
    Trusted,
    /// Manually configured bootstrap anchor.
    Bootstrap,
}

/// One persistent trust record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrustRecord {
    /// Current level.
    pub trust_level: TrustLevel,
    /// Pinned public key (hex); required for VERIFIED and above.
    #[serde(default)]
    pub public_key: Option<String>,
    /// Creation time (ms).
    pub created_at: u64,
    /// Last mutation time (ms).
    pub updated_at: u64,
    /// Last successful verification time (ms).
    #[serde(default)]
    pub last_verified_at: Option<u64>,
    /// Operator notes.
    #[serde(default)]
    pub notes: String,
}

/// Persistent map `node_id -> TrustRecord` with audited mutations.
pub struct TrustManager {
    path: PathBuf,
    records: Mutex<BTreeMap<NodeId, TrustRecord>>,
    audit: Arc<AuditLog>,
    default_level: TrustLevel,
}

impl TrustManager {
    /// Load records from `<data_root>/vault/trust.json` (empty map if absent).
    pub fn load(data_root: &Path, audit: Arc<AuditLog>) -> Result<Self, TrustError> {
        let path = data_root.join("vault").join("trust.json");
        let records: BTreeMap<NodeId, TrustRecord> = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            records: Mutex::new(records),
            audit,
            default_level: TrustLevel::Unknown,
        })
    }

    /// Level assigned to newly seen nodes (`security.trust_default`).
    pub fn with_default_level(mut self, level: TrustLevel) -> Self {
        self.default_level = level;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<NodeId, TrustRecord>> {
        // A poisoned lock only means a panicking writer; the map is still valid.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Manually add or replace a record. The only path to TRUSTED/BOOTSTRAP.
    pub fn add_trusted_peer(
        &self,
        node_id: &NodeId,
        public_key: Option<String>,
        level: TrustLevel,
        notes: &str,
    ) -> Result<(), TrustError> {
        if level >= TrustLevel::Verified && public_key.as_deref().unwrap_or("").is_empty() {
            return Err(TrustError::MissingKey);
        }
        let now = now_ms();
        {
            let mut records = self.lock();
            let rec = records.entry(node_id.clone()).or_insert_with(|| TrustRecord {
                trust_level: level,
                public_key: None,
                created_at: now,
                updated_at: now,
                last_verified_at: None,
                notes: String::new(),
            });
            rec.trust_level = level;
            rec.public_key = public_key;
            rec.updated_at = now;
            rec.notes = notes.to_string();
            self.persist(&records)?;
        }
        self.audit_trust("trust_added", node_id, true, level);
        Ok(())
    }

    /// Current record, if any.
    pub fn get(&self, node_id: &NodeId) -> Option<TrustRecord> {
        self.lock().get(node_id).cloned()
    }

    /// Level for a node; UNKNOWN when absent.
    pub fn level(&self, node_id: &NodeId) -> TrustLevel {
        self.lock()
            .get(node_id)
            .map(|r| r.trust_level)
            .unwrap_or(TrustLevel::Unknown)
    }

    /// Record a successful signature observation for `node_id`.
    ///
    /// Promotes absent/UNKNOWN records to VERIFIED when the observed key
    /// matches the recorded one (or none was recorded); refreshes
    /// `last_verified_at` for VERIFIED and above. A key mismatch is fatal.
    pub fn record_verification(
        &self,
        node_id: &NodeId,
        observed_key: &[u8; 32],
    ) -> Result<TrustLevel, TrustError> {
        let observed_hex = hex::encode(observed_key);
        let now = now_ms();
        let level = {
            let mut records = self.lock();
            let default_level = self.default_level;
            let rec = records.entry(node_id.clone()).or_insert_with(|| TrustRecord {
                trust_level: default_level,
                public_key: None,
                created_at: now,
                updated_at: now,
                last_verified_at: None,
                notes: String::new(),
            });

            if rec.trust_level == TrustLevel::Untrusted {
                drop(records);
                self.audit_trust("verification_rejected", node_id, false, TrustLevel::Untrusted);
                return Err(TrustError::Untrusted);
            }

            if let Some(pinned) = rec.public_key.as_deref().filter(|k| !k.is_empty()) {
                if !ct_eq(pinned.as_bytes(), observed_hex.as_bytes()) {
                    drop(records);
                    self.audit_trust("key_mismatch", node_id, false, TrustLevel::Unknown);
                    return Err(TrustError::KeyMismatch);
                }
            }

            if rec.trust_level == TrustLevel::Unknown {
                rec.trust_level = TrustLevel::Verified;
            }
            rec.public_key = Some(observed_hex);
            rec.last_verified_at = Some(now);
            rec.updated_at = now;
            let level = rec.trust_level;
            self.persist(&records)?;
            level
        };
        self.audit_trust("peer_verified", node_id, true, level);
        Ok(level)
    }

    /// Demote a peer to UNTRUSTED.
    pub fn demote(&self, node_id: &NodeId) -> Result<(), TrustError> {
        let now = now_ms();
        {
            let mut records = self.lock();
            let rec = records.entry(node_id.clone()).or_insert_with(|| TrustRecord {
                trust_level: TrustLevel::Unknown,
                public_key: None,
                created_at: now,
                updated_at: now,
                last_verified_at: None,
                notes: String::new(),
            });
            rec.trust_level = TrustLevel::Untrusted;
            rec.updated_at = now;
            self.persist(&records)?;
        }
        self.audit_trust("peer_demoted", node_id, true, TrustLevel::Untrusted);
        Ok(())
    }

    fn persist(&self, records: &BTreeMap<NodeId, TrustRecord>) -> Result<(), StorageError> {
        atomic_write_json(&self.path, records)
    }

    fn audit_trust(&self, event: &str, peer: &NodeId, success: bool, level: TrustLevel) {
        let mut meta = BTreeMap::new();
        meta.insert(
            "level".to_string(),
            serde_json::to_value(level).unwrap_or_default(),
        );
        self.audit
            .record(AuditKind::Trust, event, Some(peer), success, meta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, TrustManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit = Arc::new(
            AuditLog::open(dir.path(), NodeId::from_public_key(&[0u8; 32]), true).expect("audit"),
        );
        let mgr = TrustManager::load(dir.path(), audit).expect("load");
        (dir, mgr)
    }

    fn nid(byte: u8) -> NodeId {
        NodeId::from_public_key(&[byte; 32])
    }

    #[test]
    fn absent_peer_is_unknown() {
        let (_dir, mgr) = setup();
        assert_eq!(mgr.level(&nid(1)), TrustLevel::Unknown);
    }

    #[test]
    fn verification_promotes_unknown_to_verified() {
        let (_dir, mgr) = setup();
        let peer = nid(2);
        let key = [2u8; 32];
        let level = mgr.record_verification(&peer, &key).expect("verify");
        assert_eq!(level, TrustLevel::Verified);
        let rec = mgr.get(&peer).expect("record");
        assert_eq!(rec.public_key.as_deref(), Some(hex::encode(key).as_str()));
        assert!(rec.last_verified_at.is_some());
    }

    #[test]
    fn key_mismatch_is_fatal() {
        let (_dir, mgr) = setup();
        let peer = nid(3);
        mgr.record_verification(&peer, &[3u8; 32]).expect("verify");
        assert!(matches!(
            mgr.record_verification(&peer, &[4u8; 32]),
            Err(TrustError::KeyMismatch)
        ));
        // Level untouched by the failed attempt.
        assert_eq!(mgr.level(&peer), TrustLevel::Verified);
    }

    #[test]
    fn bootstrap_keeps_level_on_verification() {
        let (_dir, mgr) = setup();
        let peer = nid(5);
        let key = [5u8; 32];
        mgr.add_trusted_peer(&peer, Some(hex::encode(key)), TrustLevel::Bootstrap, "anchor")
            .expect("add");
        let level = mgr.record_verification(&peer, &key).expect("verify");
        assert_eq!(level, TrustLevel::Bootstrap);
        assert!(mgr.get(&peer).expect("record").last_verified_at.is_some());
    }

    #[test]
    fn trusted_requires_public_key() {
        let (_dir, mgr) = setup();
        assert!(matches!(
            mgr.add_trusted_peer(&nid(6), None, TrustLevel::Trusted, ""),
            Err(TrustError::MissingKey)
        ));
    }

    #[test]
    fn demoted_peer_rejects_verification() {
        let (_dir, mgr) = setup();
        let peer = nid(7);
        mgr.record_verification(&peer, &[7u8; 32]).expect("verify");
        mgr.demote(&peer).expect("demote");
        assert_eq!(mgr.level(&peer), TrustLevel::Untrusted);
        assert!(matches!(
            mgr.record_verification(&peer, &[7u8; 32]),
            Err(TrustError::Untrusted)
        ));
    }

    #[test]
    fn records_survive_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit = Arc::new(
            AuditLog::open(dir.path(), NodeId::from_public_key(&[0u8; 32]), true).expect("audit"),
        );
        let peer = nid(8);
        {
            let mgr = TrustManager::load(dir.path(), audit.clone()).expect("load");
            mgr.record_verification(&peer, &[8u8; 32]).expect("verify");
        }
        let mgr = TrustManager::load(dir.path(), audit).expect("reload");
        assert_eq!(mgr.level(&peer), TrustLevel::Verified);
    }
}
