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

//! Crypto primitives: Ed25519, X25519 + HKDF-SHA-256, AES-256-GCM, SHA-256,
//! secure random. Thin wrappers over `ring`; every failure is a `CryptoError`
//! and there is no fallback to weaker primitives.

use ring::{
    aead, agreement, digest, hkdf,
    rand::{SecureRandom, SystemRandom},
    signature::{UnparsedPublicKey, ED25519},
};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Random generator failure.
    #[error("rng")]
    Rng,
    /// Key material rejected by the primitive.
    #[error("bad key")]
    BadKey,
    /// Key agreement failed.
    #[error("agreement")]
    Agreement,
    /// Key derivation failed.
    #[error("kdf")]
    Kdf,
    /// AEAD seal failed.
    #[error("seal")]
    Seal,
    /// AEAD open failed (bad tag or corrupt frame).
    #[error("open")]
    Open,
    /// Signature did not verify.
    #[error("bad signature")]
    BadSignature,
}

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// Ed25519 signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Fill a buffer with cryptographically secure random bytes.
pub fn random_fill(buf: &mut [u8]) -> Result<(), CryptoError> {
    SystemRandom::new().fill(buf).map_err(|_| CryptoError::Rng)
}

/// A random `u64` (jitter, gossip peer picks).
pub fn random_u64() -> u64 {
    let mut b = [0u8; 8];
    // SystemRandom failure here would mean a broken platform RNG; zero is an
    // acceptable degenerate jitter value.
    let _ = SystemRandom::new().fill(&mut b);
    u64::from_be_bytes(b)
}

/// SHA-256 digest.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let d = digest::digest(&digest::SHA256, bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(d.as_ref());
    out
}

/// Constant-time byte comparison.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Verify an Ed25519 signature under raw public key bytes.
pub fn ed25519_verify(pk: &[u8; 32], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    if sig.len() != SIGNATURE_LEN {
        return Err(CryptoError::BadSignature);
    }
    let pk = UnparsedPublicKey::new(&ED25519, pk);
    pk.verify(msg, sig).map_err(|_| CryptoError::BadSignature)
}

/// An ephemeral X25519 keypair; the secret is consumed by `derive_shared`.
pub struct EphemeralKeys {
    secret: agreement::EphemeralPrivateKey,
    /// Public half, sent to the peer.
    pub public: [u8; 32],
}

/// Generate an ephemeral X25519 keypair.
pub fn x25519_generate() -> Result<EphemeralKeys, CryptoError> {
    let rng = SystemRandom::new();
    let secret = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng)
        .map_err(|_| CryptoError::Rng)?;
    let public_key = secret.compute_public_key().map_err(|_| CryptoError::BadKey)?;
    let mut public = [0u8; 32];
    public.copy_from_slice(public_key.as_ref());
    Ok(EphemeralKeys { secret, public })
}

/// X25519 shared secret with the peer's ephemeral public key.
pub fn derive_shared(local: EphemeralKeys, remote_public: &[u8]) -> Result<[u8; 32], CryptoError> {
    if remote_public.len() != 32 {
        return Err(CryptoError::BadKey);
    }
    let peer = agreement::UnparsedPublicKey::new(&agreement::X25519, remote_public);
    agreement::agree_ephemeral(local.secret, &peer, |shared| {
        let mut out = [0u8; 32];
        out.copy_from_slice(shared);
        out
    })
    .map_err(|_| CryptoError::Agreement)
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-SHA-256 over (ikm, salt, info) into a 32-byte key.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(ikm);
    let info_slices = [info];
    let okm = prk
        .expand(&info_slices, OkmLen(32))
        .map_err(|_| CryptoError::Kdf)?;
    let mut out = [0u8; 32];
    okm.fill(&mut out).map_err(|_| CryptoError::Kdf)?;
    Ok(out)
}

/// AES-256-GCM key bound to one session direction.
pub struct AeadKey {
    key: aead::LessSafeKey,
}

impl AeadKey {
    /// Wrap raw 32-byte key material.
    pub fn new(key_bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let unbound =
            aead::UnboundKey::new(&aead::AES_256_GCM, key_bytes).map_err(|_| CryptoError::BadKey)?;
        Ok(Self {
            key: aead::LessSafeKey::new(unbound),
        })
    }

    /// Encrypt; returns (random nonce, ciphertext with appended tag).
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        random_fill(&mut nonce_bytes)?;
        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);
        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, aead::Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::Seal)?;
        Ok((nonce_bytes, in_out))
    }

    /// Decrypt and verify the tag; the tag check is constant time inside ring.
    pub fn open(
        &self,
        nonce_bytes: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = aead::Nonce::assume_unique_for_key(*nonce_bytes);
        let mut in_out = ciphertext.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, aead::Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::Open)?;
        Ok(plain.to_vec())
    }
}
