//! Proof primitives for the data-mode handshake.
//!
//! The link is authenticated, not encrypted. A host proves knowledge of the
//! pre-shared secret by returning
//!
//!   proof = BLAKE3-keyed(secret, token || nonce)
//!
//! for a nonce the device issued. Nonces come from the OS-seeded thread RNG.
//! Secret material derives ZeroizeOnDrop and is wiped when dropped.

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Nonce size in bytes.
pub const NONCE_LEN: usize = 16;

/// Proof size in bytes (a BLAKE3 digest).
pub const PROOF_LEN: usize = 32;

/// Pre-shared secret size in bytes.
pub const SECRET_LEN: usize = 32;

pub type Nonce = [u8; NONCE_LEN];

/// Pre-shared link secret. Never printed, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    key: Zeroizing<[u8; SECRET_LEN]>,
}

impl SharedSecret {
    pub fn from_bytes(key: [u8; SECRET_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Parse a 64-character hex secret, as stored in config.
    pub fn from_hex(text: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(hex::decode(text.trim()).map_err(|_| CryptoError::BadSecret)?);
        let key: [u8; SECRET_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::BadSecret)?;
        Ok(Self::from_bytes(key))
    }

    /// Generate a fresh random secret.
    pub fn generate() -> Self {
        let mut key = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self::from_bytes(key)
    }

    /// Hex encoding for writing into config. Handle with care.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(*self.key))
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Generate a cryptographically random nonce.
pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn proof_hash(secret: &SharedSecret, token: &[u8], nonce: &Nonce) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new_keyed(&secret.key);
    hasher.update(token);
    hasher.update(nonce);
    hasher.finalize()
}

/// Compute the proof a host sends in AUTH_PROVE.
pub fn compute_proof(secret: &SharedSecret, token: &[u8], nonce: &Nonce) -> [u8; PROOF_LEN] {
    *proof_hash(secret, token, nonce).as_bytes()
}

/// Check a proof in constant time. A proof of the wrong length is simply
/// a mismatch.
pub fn verify_proof(secret: &SharedSecret, token: &[u8], nonce: &Nonce, proof: &[u8]) -> bool {
    let Ok(proof): Result<[u8; PROOF_LEN], _> = proof.try_into() else {
        return false;
    };
    // blake3::Hash equality is constant-time.
    proof_hash(secret, token, nonce) == blake3::Hash::from(proof)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("secret must be {} hex-encoded bytes", SECRET_LEN)]
    BadSecret,
}
