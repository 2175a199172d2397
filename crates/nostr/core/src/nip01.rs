//! NIP-01: Basic protocol flow.
//!
//! Event structure, canonical hashing, BIP-340 signing and verification.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/01.md>

use crate::tag_parsing::find_tag_value;
use bitcoin::secp256k1::{Keypair as SecpKeypair, Message, Secp256k1, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur while building, signing or verifying events.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("system clock is before unix epoch")]
    Clock,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A signed Nostr event.
///
/// ```json
/// {
///   "id": "<32-byte sha256 of the serialized event, hex>",
///   "pubkey": "<32-byte x-only public key, hex>",
///   "created_at": 1700000000,
///   "kind": 30078,
///   "tags": [["d", "ride-1"], ["g", "w21z4"]],
///   "content": "{...}",
///   "sig": "<64-byte schnorr signature, hex>"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Identifier of a parameterized replaceable event (`d` tag).
    pub fn d_tag(&self) -> Option<&str> {
        find_tag_value(&self.tags, "d")
    }

    /// Kind classification of this event.
    pub fn classification(&self) -> KindClassification {
        KindClassification::of(self.kind)
    }
}

/// Event fields supplied by the author before hashing and signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Template with the author key attached, ready to be hashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Storage semantics of an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    Regular,
    Replaceable,
    Ephemeral,
    ParameterizedReplaceable,
    Unknown,
}

impl KindClassification {
    pub fn of(kind: u16) -> Self {
        match kind {
            0 | 3 => Self::Replaceable,
            1..=2 | 4..=44 | 1000..=9999 => Self::Regular,
            10000..=19999 => Self::Replaceable,
            20000..=29999 => Self::Ephemeral,
            30000..=39999 => Self::ParameterizedReplaceable,
            _ => Self::Unknown,
        }
    }

    pub fn is_replaceable(&self) -> bool {
        matches!(self, Self::Replaceable | Self::ParameterizedReplaceable)
    }
}

/// Current unix time in seconds.
pub fn unix_now_secs() -> Result<u64, Nip01Error> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .map_err(|_| Nip01Error::Clock)
}

/// Generate a random secp256k1 secret key.
pub fn generate_secret_key() -> [u8; 32] {
    loop {
        let candidate: [u8; 32] = rand::random();
        if bitcoin::secp256k1::SecretKey::from_slice(&candidate).is_ok() {
            return candidate;
        }
    }
}

/// X-only public key for a secret key.
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], Nip01Error> {
    let secp = Secp256k1::new();
    let keypair = SecpKeypair::from_seckey_slice(&secp, secret_key)
        .map_err(|error| Nip01Error::InvalidSecretKey(error.to_string()))?;
    Ok(keypair.x_only_public_key().0.serialize())
}

/// Hex encoded x-only public key for a secret key.
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    get_public_key(secret_key).map(hex::encode)
}

/// Canonical NIP-01 event id: `sha256([0, pubkey, created_at, kind, tags, content])`.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    let serialized = serde_json::to_string(&json!([
        0,
        event.pubkey,
        event.created_at,
        event.kind,
        event.tags,
        event.content
    ]))?;
    Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
}

/// Attach the author key, compute the id and sign.
pub fn finalize_event(template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event, Nip01Error> {
    let secp = Secp256k1::new();
    let keypair = SecpKeypair::from_seckey_slice(&secp, secret_key)
        .map_err(|error| Nip01Error::InvalidSecretKey(error.to_string()))?;
    let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());

    let unsigned = UnsignedEvent {
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };
    let id = get_event_hash(&unsigned)?;
    let digest = decode_fixed::<32>(&id)
        .ok_or_else(|| Nip01Error::InvalidEvent("event id is not 32 bytes".to_string()))?;
    let signature = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);

    Ok(Event {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: signature.to_string(),
    })
}

/// Check the structural shape of an event (hex lengths).
pub fn validate_event(event: &Event) -> bool {
    decode_fixed::<32>(&event.id).is_some()
        && decode_fixed::<32>(&event.pubkey).is_some()
        && decode_fixed::<64>(&event.sig).is_some()
}

/// Recompute the id and verify the signature against `pubkey`.
pub fn verify_event(event: &Event) -> Result<bool, Nip01Error> {
    if !validate_event(event) {
        return Ok(false);
    }

    let unsigned = UnsignedEvent {
        pubkey: event.pubkey.clone(),
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    if get_event_hash(&unsigned)? != event.id {
        return Ok(false);
    }

    let digest = decode_fixed::<32>(&event.id)
        .ok_or_else(|| Nip01Error::InvalidEvent("event id is not 32 bytes".to_string()))?;
    let pubkey_bytes = decode_fixed::<32>(&event.pubkey)
        .ok_or_else(|| Nip01Error::InvalidPublicKey(event.pubkey.clone()))?;
    let sig_bytes = decode_fixed::<64>(&event.sig)
        .ok_or_else(|| Nip01Error::InvalidSignature(event.sig.clone()))?;

    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|error| Nip01Error::InvalidPublicKey(error.to_string()))?;
    let signature = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|error| Nip01Error::InvalidSignature(error.to_string()))?;

    let secp = Secp256k1::verification_only();
    Ok(secp
        .verify_schnorr(&signature, &Message::from_digest(digest), &pubkey)
        .is_ok())
}

fn decode_fixed<const N: usize>(value: &str) -> Option<[u8; N]> {
    let bytes = hex::decode(value).ok()?;
    bytes.try_into().ok()
}
