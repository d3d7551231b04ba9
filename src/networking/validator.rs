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

//! Peer validator: handshake signature verification plus the trust-based
//! connect/accept policy.
//!
//! | Trust level | can_connect | on verification success       |
//! |-------------|-------------|-------------------------------|
//! | UNTRUSTED   | no          | n/a                           |
//! | UNKNOWN     | policy      | promote to VERIFIED           |
//! | VERIFIED+   | yes         | refresh `last_verified_at`    |
//!
//! `reject_unknown` is read per attempt so runtime reconfiguration takes
//! effect immediately.

use crate::core::security::audit::{AuditKind, AuditLog};
use crate::core::security::crypto::{ed25519_verify, CryptoError};
use crate::core::security::trust::{TrustError, TrustLevel, TrustManager};
use crate::core::types::NodeId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Validation errors. All are fatal to the connection attempt.
#[derive(Debug, Error)]
pub enum ValidatorError {
    /// Transcript signature did not verify under the claimed key.
    #[error("signature failed")]
    SignatureFailed,
    /// Peer is UNTRUSTED.
    #[error("peer untrusted")]
    Untrusted,
    /// Peer is UNKNOWN and policy rejects unknown peers.
    #[error("unknown peer rejected")]
    UnknownRejected,
    /// Trust bookkeeping failed (key mismatch, storage).
    #[error(transparent)]
    Trust(#[from] TrustError),
}

/// Shared, hot-reloadable `reject_unknown` flag.
#[derive(Clone)]
pub struct RejectUnknown(Arc<AtomicBool>);

impl RejectUnknown {
    /// New flag handle.
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(AtomicBool::new(initial)))
    }

    /// Read the current policy.
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Reconfigure at runtime.
    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Relaxed)
    }
}

/// Connect/accept gatekeeper.
pub struct PeerValidator {
    trust: Arc<TrustManager>,
    audit: Arc<AuditLog>,
    reject_unknown: RejectUnknown,
}

impl PeerValidator {
    /// Build over the trust manager.
    pub fn new(trust: Arc<TrustManager>, audit: Arc<AuditLog>, reject_unknown: RejectUnknown) -> Self {
        Self {
            trust,
            audit,
            reject_unknown,
        }
    }

    /// The hot-reloadable policy handle.
    pub fn reject_unknown(&self) -> &RejectUnknown {
        &self.reject_unknown
    }

    /// Policy gate consulted before dialing out (no signature available yet).
    pub fn can_connect(&self, peer: &NodeId) -> Result<(), ValidatorError> {
        match self.trust.level(peer) {
            TrustLevel::Untrusted => Err(ValidatorError::Untrusted),
            TrustLevel::Unknown if self.reject_unknown.get() => Err(ValidatorError::UnknownRejected),
            _ => Ok(()),
        }
    }

    /// Full handshake validation: signature over one of the candidate
    /// transcript digests, then the trust policy, then verification
    /// bookkeeping. Consulted at connect-accept and connect-attempt.
    pub fn validate_handshake(
        &self,
        peer: &NodeId,
        transcripts: &[[u8; 32]],
        signature: &[u8],
    ) -> Result<TrustLevel, ValidatorError> {
        let claimed_key = peer.public_key_bytes();
        let verified = transcripts
            .iter()
            .any(|digest| matches!(ed25519_verify(&claimed_key, digest, signature), Ok(())));
        if !verified {
            self.audit.record(
                AuditKind::Signature,
                "signature_failed",
                Some(peer),
                false,
                BTreeMap::new(),
            );
            return Err(ValidatorError::SignatureFailed);
        }

        match self.trust.level(peer) {
            TrustLevel::Untrusted => {
                self.audit.record(
                    AuditKind::Connection,
                    "connect_rejected",
                    Some(peer),
                    false,
                    BTreeMap::new(),
                );
                Err(ValidatorError::Untrusted)
            }
            TrustLevel::Unknown if self.reject_unknown.get() => {
                self.audit.record(
                    AuditKind::Connection,
                    "connect_rejected",
                    Some(peer),
                    false,
                    BTreeMap::new(),
                );
                Err(ValidatorError::UnknownRejected)
            }
            _ => Ok(self.trust.record_verification(peer, &claimed_key)?),
        }
    }
}

// Keeps `CryptoError` out of the public surface here; verification failures
// collapse into `SignatureFailed`.
impl From<CryptoError> for ValidatorError {
    fn from(_: CryptoError) -> Self {
        ValidatorError::SignatureFailed
    }
}
