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

//! Node identity: the long-lived Ed25519 keypair behind `node_id`.
//!
//! The 32-byte seed lives at `<data_root>/vault/node_identity.key` with
//! owner-only permissions and is created on first run.
//!
//! ## Key encryption format
//! If `DAWN_KEY_PASSPHRASE` is set, the seed is stored as
//! `MAGIC(8) || SALT(16) || NONCE(12) || CIPHERTEXT+TAG(..)` where the
//! ciphertext is AES-256-GCM over the seed and the key is
//! PBKDF2-HMAC-SHA256 over the passphrase.

use crate::core::types::NodeId;
use ring::{
    aead, pbkdf2,
    rand::{SecureRandom, SystemRandom},
    signature::{Ed25519KeyPair, KeyPair},
};
use std::{
    fs,
    io::Write,
    num::NonZeroU32,
    path::{Path, PathBuf},
};
use thiserror::Error;
use zeroize::Zeroize;

const KEY_FILE_MAGIC: &[u8] = b"DAWNKEY1"; // 8 bytes
const KEY_SALT_LEN: usize = 16;
const KEY_NONCE_LEN: usize = 12;
const SEED_LEN: usize = 32;

// 100k PBKDF2 iterations is the baseline for server-side passphrases.
const PBKDF2_ITERS_DEFAULT: u32 = 100_000;

/// Identity load/store errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Filesystem failure.
    #[error("io")]
    Io,
    /// Key file is malformed.
    #[error("invalid key file")]
    InvalidKey,
    /// Encrypted key present but no passphrase configured.
    #[error("missing passphrase (set DAWN_KEY_PASSPHRASE)")]
    MissingPassphrase,
    /// Wrong passphrase (AEAD tag failure, constant time).
    #[error("bad passphrase")]
    BadPassphrase,
    /// Underlying crypto failure.
    #[error("crypto")]
    Crypto,
}

fn env_passphrase() -> Option<String> {
    std::env::var("DAWN_KEY_PASSPHRASE")
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn pbkdf2_iters() -> NonZeroU32 {
    let iters = std::env::var("DAWN_PBKDF2_ITERS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(PBKDF2_ITERS_DEFAULT);
    // Clamp to a practical range.
    let iters = iters.clamp(100_000, 10_000_000);
    NonZeroU32::new(iters).unwrap_or_else(|| NonZeroU32::new(PBKDF2_ITERS_DEFAULT).expect("nonzero"))
}

fn set_private_perms_best_effort(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
}

/// Atomic private write: temp file, fsync, rename.
fn atomic_write_private(path: &Path, bytes: &[u8]) -> Result<(), IdentityError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|_| IdentityError::Io)?;
    }
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|_| IdentityError::Io)?;
        f.write_all(bytes).map_err(|_| IdentityError::Io)?;
        let _ = f.sync_all();
    }
    set_private_perms_best_effort(&tmp);
    fs::rename(&tmp, path).map_err(|_| IdentityError::Io)?;
    set_private_perms_best_effort(path);
    Ok(())
}

fn derive_wrap_key(passphrase: &[u8], salt: &[u8; KEY_SALT_LEN]) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, pbkdf2_iters(), salt, passphrase, &mut out);
    out
}

fn wrap_seed(passphrase: &[u8], seed: &[u8; SEED_LEN]) -> Result<Vec<u8>, IdentityError> {
    let rng = SystemRandom::new();

    let mut salt = [0u8; KEY_SALT_LEN];
    rng.fill(&mut salt).map_err(|_| IdentityError::Crypto)?;
    let mut nonce_bytes = [0u8; KEY_NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| IdentityError::Crypto)?;
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut key = derive_wrap_key(passphrase, &salt);
    let unbound =
        aead::UnboundKey::new(&aead::AES_256_GCM, &key).map_err(|_| IdentityError::Crypto)?;
    let sealing = aead::LessSafeKey::new(unbound);

    let mut in_out = seed.to_vec();
    sealing
        .seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| IdentityError::Crypto)?;
    key.zeroize();

    let mut out = Vec::with_capacity(KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN + in_out.len());
    out.extend_from_slice(KEY_FILE_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

fn unwrap_seed(passphrase: &[u8], bytes: &[u8]) -> Result<[u8; SEED_LEN], IdentityError> {
    let header = KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN;
    if bytes.len() < header + SEED_LEN + 16 {
        return Err(IdentityError::InvalidKey);
    }

    let mut salt = [0u8; KEY_SALT_LEN];
    salt.copy_from_slice(&bytes[KEY_FILE_MAGIC.len()..KEY_FILE_MAGIC.len() + KEY_SALT_LEN]);
    let mut nonce_bytes = [0u8; KEY_NONCE_LEN];
    nonce_bytes.copy_from_slice(&bytes[KEY_FILE_MAGIC.len() + KEY_SALT_LEN..header]);
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut key = derive_wrap_key(passphrase, &salt);
    let unbound =
        aead::UnboundKey::new(&aead::AES_256_GCM, &key).map_err(|_| IdentityError::Crypto)?;
    let opening = aead::LessSafeKey::new(unbound);

    let mut in_out = bytes[header..].to_vec();
    let plain = opening
        .open_in_place(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| IdentityError::BadPassphrase)?;
    key.zeroize();

    if plain.len() != SEED_LEN {
        return Err(IdentityError::InvalidKey);
    }
    let mut seed = [0u8; SEED_LEN];
    seed.copy_from_slice(plain);
    in_out.zeroize();
    Ok(seed)
}

/// The node's long-term identity. Created once, never rotated while running.
pub struct NodeIdentity {
    keypair: Ed25519KeyPair,
    public: [u8; 32],
    node_id: NodeId,
}

impl NodeIdentity {
    /// Load the identity from `<data_root>/vault/node_identity.key`, creating
    /// and persisting a fresh one if absent.
    pub fn load_or_create(data_root: &Path) -> Result<Self, IdentityError> {
        let path = identity_path(data_root);
        let pass = env_passphrase();

        if path.exists() {
            let bytes = fs::read(&path).map_err(|_| IdentityError::Io)?;
            let mut seed = if bytes.starts_with(KEY_FILE_MAGIC) {
                let Some(p) = pass.as_deref() else {
                    return Err(IdentityError::MissingPassphrase);
                };
                unwrap_seed(p.as_bytes(), &bytes)?
            } else {
                if bytes.len() != SEED_LEN {
                    return Err(IdentityError::InvalidKey);
                }
                let mut s = [0u8; SEED_LEN];
                s.copy_from_slice(&bytes);
                s
            };
            let identity = Self::from_seed(&seed)?;
            seed.zeroize();
            return Ok(identity);
        }

        let rng = SystemRandom::new();
        let mut seed = [0u8; SEED_LEN];
        rng.fill(&mut seed).map_err(|_| IdentityError::Crypto)?;

        let on_disk = if let Some(p) = pass.as_deref() {
            wrap_seed(p.as_bytes(), &seed)?
        } else {
            seed.to_vec()
        };
        atomic_write_private(&path, &on_disk)?;

        let identity = Self::from_seed(&seed)?;
        seed.zeroize();
        Ok(identity)
    }

    /// Build from a raw 32-byte seed.
    pub fn from_seed(seed: &[u8; SEED_LEN]) -> Result<Self, IdentityError> {
        let keypair =
            Ed25519KeyPair::from_seed_unchecked(seed).map_err(|_| IdentityError::InvalidKey)?;
        let mut public = [0u8; 32];
        public.copy_from_slice(keypair.public_key().as_ref());
        let node_id = NodeId::from_public_key(&public);
        Ok(Self {
            keypair,
            public,
            node_id,
        })
    }

    /// Ed25519 signature over `msg` (64 bytes).
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.keypair.sign(msg).as_ref().to_vec()
    }

    /// Public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Derived node id.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

/// Path of the identity key under a data root.
pub fn identity_path(data_root: &Path) -> PathBuf {
    data_root.join("vault").join("node_identity.key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_across_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = NodeIdentity::load_or_create(dir.path()).expect("create");
        let second = NodeIdentity::load_or_create(dir.path()).expect("reload");
        assert_eq!(first.node_id(), second.node_id());
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn node_id_is_hex_of_public_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = NodeIdentity::load_or_create(dir.path()).expect("create");
        assert_eq!(id.node_id().as_str(), hex::encode(id.public_key()));
    }

    #[test]
    fn wrapped_seed_rejects_wrong_passphrase() {
        let mut seed = [9u8; SEED_LEN];
        let wrapped = wrap_seed(b"correct horse", &seed).expect("wrap");
        assert!(wrapped.starts_with(KEY_FILE_MAGIC));
        let got = unwrap_seed(b"correct horse", &wrapped).expect("unwrap");
        assert_eq!(got, seed);
        assert!(matches!(
            unwrap_seed(b"wrong", &wrapped),
            Err(IdentityError::BadPassphrase)
        ));
        seed.zeroize();
    }

    #[test]
    fn signature_verifies_under_derived_public_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = NodeIdentity::load_or_create(dir.path()).expect("create");
        let sig = id.sign(b"transcript");
        super::super::crypto::ed25519_verify(&id.public_key(), b"transcript", &sig).expect("verify");
    }
}
