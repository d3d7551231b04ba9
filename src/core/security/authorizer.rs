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

//! Authorizer: persistent permission grants keyed by node id.
//!
//! The router consults `check` for every routed message; denial handling
//! (the `-32001` reply and the single ACCESS_DENIED audit event) lives at
//! the router's authorization gate.

use crate::core::storage::{atomic_write_json, read_json, StorageError};
use crate::core::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Authorization errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Persistence failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Closed permission set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    /// Read agent resources and prompts.
    AgentRead,
    /// Mutate agent-held state.
    AgentWrite,
    /// Invoke agent tools.
    AgentExecute,
    /// Open a connection to this node.
    PeerConnect,
    /// Exchange node/gossip messages.
    PeerMessage,
    /// Administrative operations.
    SystemAdmin,
}

/// Persistent `node_id -> set<Permission>` with atomic-write persistence.
pub struct Authorizer {
    path: PathBuf,
    grants: Mutex<BTreeMap<NodeId, BTreeSet<Permission>>>,
}

impl Authorizer {
    /// Load grants from `<data_root>/mesh/permissions.json` (empty if absent).
    pub fn load(data_root: &Path) -> Result<Self, AuthError> {
        let path = data_root.join("mesh").join("permissions.json");
        let grants: BTreeMap<NodeId, BTreeSet<Permission>> = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            grants: Mutex::new(grants),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<NodeId, BTreeSet<Permission>>> {
        self.grants.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `node_id` holds `required`. SYSTEM_ADMIN implies everything.
    pub fn check(&self, node_id: &NodeId, required: Permission) -> bool {
        let grants = self.lock();
        match grants.get(node_id) {
            Some(set) => set.contains(&required) || set.contains(&Permission::SystemAdmin),
            None => false,
        }
    }

    /// Grant a permission.
    pub fn grant(&self, node_id: &NodeId, permission: Permission) -> Result<(), AuthError> {
        let mut grants = self.lock();
        grants.entry(node_id.clone()).or_default().insert(permission);
        atomic_write_json(&self.path, &*grants)?;
        Ok(())
    }

    /// Revoke a permission; removes the node entry when its set empties.
    pub fn revoke(&self, node_id: &NodeId, permission: Permission) -> Result<(), AuthError> {
        let mut grants = self.lock();
        if let Some(set) = grants.get_mut(node_id) {
            set.remove(&permission);
            if set.is_empty() {
                grants.remove(node_id);
            }
        }
        atomic_write_json(&self.path, &*grants)?;
        Ok(())
    }

    /// Current grants for a node.
    pub fn grants_for(&self, node_id: &NodeId) -> BTreeSet<Permission> {
        self.lock().get(node_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(byte: u8) -> NodeId {
        NodeId::from_public_key(&[byte; 32])
    }

    #[test]
    fn absent_node_has_no_permissions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = Authorizer::load(dir.path()).expect("load");
        assert!(!auth.check(&nid(1), Permission::AgentExecute));
    }

    #[test]
    fn grant_check_revoke() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = Authorizer::load(dir.path()).expect("load");
        let peer = nid(2);
        auth.grant(&peer, Permission::AgentExecute).expect("grant");
        assert!(auth.check(&peer, Permission::AgentExecute));
        assert!(!auth.check(&peer, Permission::PeerMessage));
        auth.revoke(&peer, Permission::AgentExecute).expect("revoke");
        assert!(!auth.check(&peer, Permission::AgentExecute));
    }

    #[test]
    fn system_admin_implies_all() {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = Authorizer::load(dir.path()).expect("load");
        let peer = nid(3);
        auth.grant(&peer, Permission::SystemAdmin).expect("grant");
        assert!(auth.check(&peer, Permission::AgentExecute));
        assert!(auth.check(&peer, Permission::PeerMessage));
    }

    #[test]
    fn grants_survive_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let peer = nid(4);
        {
            let auth = Authorizer::load(dir.path()).expect("load");
            auth.grant(&peer, Permission::PeerMessage).expect("grant");
        }
        let auth = Authorizer::load(dir.path()).expect("reload");
        assert!(auth.check(&peer, Permission::PeerMessage));
    }

    #[test]
    fn permissions_serialize_screaming_snake() {
        let raw = serde_json::to_string(&Permission::AgentExecute).expect("encode");
        assert_eq!(raw, "\"AGENT_EXECUTE\"");
    }
}
