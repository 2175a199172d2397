//! Nostr protocol primitives: signed events, keys, NIP-04 direct messages
//! and NIP-40 expiration.

mod keys;
pub mod nip01;
#[cfg(feature = "full")]
pub mod nip04;
pub mod nip40;
pub mod tag_parsing;

pub use keys::{KeyError, Keypair};
pub use nip01::{
    Event, EventTemplate, KindClassification, Nip01Error, UnsignedEvent, finalize_event,
    generate_secret_key, get_event_hash, get_public_key, get_public_key_hex, unix_now_secs,
    validate_event, verify_event,
};
#[cfg(feature = "full")]
pub use nip04::{KIND_ENCRYPTED_DIRECT_MESSAGE, Nip04Error};
pub use nip40::{create_expiration_tag, get_expiration, is_expired};
