//! Signed governance membership requests.
//!
//! Seed nodes ask for members without credentials (their authority comes
//! from being in the seed list). Governance nodes attach their public key and
//! a signature over it so the receiver can check the key against the
//! membership oracle.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const REQUEST_DOMAIN: &[u8] = b"subnet-members-request";

/// Largest clock distance, in seconds, between a signed request's timestamp
/// and the receiver's clock.
pub const MAX_REQUEST_SKEW_SECS: i64 = 5 * 60;

#[derive(Error, Debug)]
pub enum SignedMessageError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Request is not signed")]
    MissingSignature,
    #[error("Request timestamp {timestamp} is outside the accepted window (now {now})")]
    Stale { timestamp: i64, now: i64 },
}

/// Key material of a node taking part as a governance candidate.
#[derive(Clone)]
pub struct Account {
    key: SigningKey,
}

impl Account {
    pub fn random() -> Self {
        Self {
            key: SigningKey::from_bytes(&rand::thread_rng().gen::<[u8; 32]>()),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.key.sign(data)
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Account({})", pubkey_id(&self.public_key()))
    }
}

/// Stable string form of a governance public key.
pub fn pubkey_id(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

/// Inverse of `pubkey_id`. `None` for anything that is not a valid key.
pub fn pubkey_from_id(id: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(id).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RequestOrigin {
    Seed,
    Gov {
        pubkey: VerifyingKey,
        timestamp: i64,
        signature: Signature,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MembersRequest {
    pub origin: RequestOrigin,
}

impl MembersRequest {
    pub fn from_seed() -> Self {
        Self {
            origin: RequestOrigin::Seed,
        }
    }

    pub fn from_account(account: &Account) -> Self {
        let pubkey = account.public_key();
        let timestamp = chrono::Utc::now().timestamp();
        let signature = account.sign(&signing_bytes(&pubkey, timestamp));
        Self {
            origin: RequestOrigin::Gov {
                pubkey,
                timestamp,
                signature,
            },
        }
    }

    pub fn is_from_seed(&self) -> bool {
        matches!(self.origin, RequestOrigin::Seed)
    }

    pub fn pubkey(&self) -> Option<&VerifyingKey> {
        match &self.origin {
            RequestOrigin::Seed => None,
            RequestOrigin::Gov { pubkey, .. } => Some(pubkey),
        }
    }

    pub fn verify(&self) -> Result<(), SignedMessageError> {
        self.verify_at(chrono::Utc::now().timestamp())
    }

    /// Check the signature and that the request was signed within
    /// `MAX_REQUEST_SKEW_SECS` of `now`.
    pub fn verify_at(&self, now: i64) -> Result<(), SignedMessageError> {
        match &self.origin {
            RequestOrigin::Seed => Err(SignedMessageError::MissingSignature),
            RequestOrigin::Gov {
                pubkey,
                timestamp,
                signature,
            } => {
                pubkey
                    .verify(&signing_bytes(pubkey, *timestamp), signature)
                    .map_err(|_| SignedMessageError::InvalidSignature)?;
                if (now - *timestamp).abs() > MAX_REQUEST_SKEW_SECS {
                    return Err(SignedMessageError::Stale {
                        timestamp: *timestamp,
                        now,
                    });
                }
                Ok(())
            }
        }
    }
}

fn signing_bytes(pubkey: &VerifyingKey, timestamp: i64) -> Vec<u8> {
    let mut data = Vec::with_capacity(REQUEST_DOMAIN.len() + 32 + 8);
    data.extend_from_slice(REQUEST_DOMAIN);
    data.extend_from_slice(pubkey.as_bytes());
    data.extend_from_slice(&timestamp.to_le_bytes());
    data
}
