//! Peer identities.
//!
//! A `PeerId` is the first 20 bytes of the SHA-256 digest of an ed25519
//! verifying key. Closeness between two ids is the length of their common
//! leading-bit prefix (XOR distance read from the top), so a higher value
//! means "closer".

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

pub const PEER_ID_LEN: usize = 20;

/// Largest possible common prefix length, reached only by identical ids.
pub const MAX_CPL: usize = PEER_ID_LEN * 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_pubkey(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut id = [0u8; PEER_ID_LEN];
        id.copy_from_slice(&digest[..PEER_ID_LEN]);
        Self(id)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Compact projection used as a map key and in logs.
    pub fn to_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Closeness to `other`: number of leading bits the two ids share.
    pub fn distance(&self, other: &PeerId) -> usize {
        common_prefix_len(self, other)
    }

    /// Random id sharing exactly `cpl` leading bits with `target`.
    pub fn random_at_distance(target: &PeerId, cpl: usize) -> PeerId {
        if cpl >= MAX_CPL {
            return *target;
        }
        let mut bytes: [u8; PEER_ID_LEN] = rand::random();
        let byte = cpl / 8;
        let bit = cpl % 8;

        bytes[..byte].copy_from_slice(&target.0[..byte]);
        let keep_mask: u8 = if bit == 0 { 0 } else { 0xffu8 << (8 - bit) };
        let flip: u8 = 0x80 >> bit;
        let shared = target.0[byte] & keep_mask;
        let diverging = !target.0[byte] & flip;
        let rest = bytes[byte] & !(keep_mask | flip);
        bytes[byte] = shared | diverging | rest;

        PeerId(bytes)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

pub fn common_prefix_len(a: &PeerId, b: &PeerId) -> usize {
    for (i, (x, y)) in a.0.iter().zip(b.0.iter()).enumerate() {
        let xor = x ^ y;
        if xor != 0 {
            return i * 8 + xor.leading_zeros() as usize;
        }
    }
    MAX_CPL
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Id list length {0} should be < 128")]
    TooManyIds(usize),
}

/// Ids at distance zero from `target` (first bit differs), all unique.
pub fn generate_zero_distance_ids(target: &PeerId, num: usize) -> Result<Vec<PeerId>, PeerIdError> {
    if num >= 128 {
        return Err(PeerIdError::TooManyIds(num));
    }

    let mut seen = HashSet::with_capacity(num + 1);
    seen.insert(target.to_u64());
    let mut list = Vec::with_capacity(num);
    while list.len() < num {
        let id = PeerId::random_at_distance(target, 0);
        if seen.insert(id.to_u64()) {
            list.push(id);
        }
    }
    Ok(list)
}

/// A peer id together with the key that generated it. Never mutated in
/// place; a session that wants a new identity swaps in a fresh one.
#[derive(Clone)]
pub struct PeerKeyId {
    pub id: PeerId,
    key: SigningKey,
}

impl PeerKeyId {
    pub fn random() -> Self {
        let key = SigningKey::from_bytes(&rand::thread_rng().gen::<[u8; 32]>());
        Self::from_signing_key(key)
    }

    pub fn from_signing_key(key: SigningKey) -> Self {
        let id = PeerId::from_pubkey(&key.verifying_key());
        Self { id, key }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl fmt::Debug for PeerKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerKeyId").field("id", &self.id).finish()
    }
}
