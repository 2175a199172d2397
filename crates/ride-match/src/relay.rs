//! Relay network capability consumed by the matching service.
//!
//! The service never talks to sockets directly. Everything it needs from the
//! network is behind [`EventRelayClient`], implemented over WebSocket relays
//! by [`crate::transport::NostrRelayClient`] and in-process by
//! `MemoryRelayClient` (behind the `test-util` feature).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use nostr::nip04;
use nostr::tag_parsing::{create_tag, find_tag_value};
use nostr::{Event, EventTemplate, KIND_ENCRYPTED_DIRECT_MESSAGE, Keypair, finalize_event, verify_event};
use nostr_client::Filter;
use tracing::warn;

use crate::error::{MatchingError, Result};

pub use nostr_client::RelayCountCallback;

/// Receives every verified event matching a subscription.
pub type RelayEventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// A decrypted direct message.
///
/// The same event can arrive once per relay; `event_id` identifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub event_id: String,
    pub sender: String,
    pub plaintext: String,
}

pub type DirectMessageCallback = Arc<dyn Fn(IncomingMessage) + Send + Sync>;

/// Subscription id used for the inbound direct message stream.
pub const DIRECT_MESSAGE_SUBSCRIPTION: &str = "ride-match-dm";

#[async_trait]
pub trait EventRelayClient: Send + Sync {
    /// Hex x-only public key events are signed with.
    fn public_key(&self) -> String;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Sign and publish a parameterized replaceable event keyed by `key`.
    ///
    /// The `d` tag is added here; `tags` carries everything else. Returns the
    /// event id.
    async fn publish_replaceable(
        &self,
        kind: u16,
        key: &str,
        tags: Vec<Vec<String>>,
        content: &str,
    ) -> Result<String>;

    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: Filter,
        on_event: RelayEventCallback,
    ) -> Result<()>;

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;

    /// Stream of encrypted messages addressed to [`Self::public_key`].
    async fn subscribe_direct_messages(&self, on_message: DirectMessageCallback) -> Result<()>;

    /// Encrypt and send `payload` to `recipient`. Returns the event id.
    async fn send_direct_message(&self, recipient: &str, payload: &str) -> Result<String>;

    fn on_relay_count_change(&self, callback: RelayCountCallback);
}

/// Issues strictly increasing `created_at` values.
///
/// Replaceable events with equal timestamps are ordered by id, so a status
/// change published in the same second as a heartbeat could otherwise lose.
#[derive(Debug, Default)]
pub struct CreatedAt {
    last: AtomicU64,
}

impl CreatedAt {
    pub fn next(&self, now: u64) -> u64 {
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(current + 1);
            match self
                .last
                .compare_exchange(current, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }
}

pub fn sign_replaceable(
    keys: &Keypair,
    created_at: u64,
    kind: u16,
    key: &str,
    tags: Vec<Vec<String>>,
    content: &str,
) -> Result<Event> {
    let mut all_tags = Vec::with_capacity(tags.len() + 1);
    all_tags.push(create_tag("d", key));
    all_tags.extend(tags.into_iter().filter(|tag| tag.first().is_none_or(|name| name != "d")));

    let template = EventTemplate {
        created_at,
        kind,
        tags: all_tags,
        content: content.to_string(),
    };
    Ok(finalize_event(&template, &keys.private_key)?)
}

pub fn seal_direct_message(
    keys: &Keypair,
    created_at: u64,
    recipient: &str,
    payload: &str,
) -> Result<Event> {
    let ciphertext = nip04::encrypt(&keys.private_key, recipient, payload)?;
    let template = EventTemplate {
        created_at,
        kind: KIND_ENCRYPTED_DIRECT_MESSAGE,
        tags: vec![create_tag("p", recipient)],
        content: ciphertext,
    };
    Ok(finalize_event(&template, &keys.private_key)?)
}

/// Decrypt a direct message addressed to `keys`, returning `(sender, plaintext)`.
pub fn open_direct_message(keys: &Keypair, event: &Event) -> Result<(String, String)> {
    if event.kind != KIND_ENCRYPTED_DIRECT_MESSAGE {
        return Err(MatchingError::InvalidInput(format!(
            "kind {} is not a direct message",
            event.kind
        )));
    }
    let recipient = find_tag_value(&event.tags, "p");
    if recipient != Some(keys.public_key_hex().as_str()) {
        return Err(MatchingError::InvalidInput(
            "direct message is addressed to someone else".to_string(),
        ));
    }
    let plaintext = nip04::decrypt(&keys.private_key, &event.pubkey, &event.content)?;
    Ok((event.pubkey.clone(), plaintext))
}

/// Signature check applied before an event reaches any callback.
pub fn is_authentic(event: &Event) -> bool {
    match verify_event(event) {
        Ok(true) => true,
        Ok(false) => {
            warn!(event_id = %event.id, "dropping event with bad signature");
            false
        }
        Err(error) => {
            warn!(event_id = %event.id, "dropping unverifiable event: {}", error);
            false
        }
    }
}

/// Wraps a subscriber so only authentic events reach it.
pub fn verified(on_event: RelayEventCallback) -> RelayEventCallback {
    Arc::new(move |event: Event| {
        if is_authentic(&event) {
            on_event(event);
        }
    })
}

/// Filter for direct messages to `pubkey` published at or after `since`.
pub fn direct_message_filter(pubkey: &str, since: u64) -> Filter {
    Filter::new()
        .kind(KIND_ENCRYPTED_DIRECT_MESSAGE)
        .pubkey(pubkey)
        .since(since)
}

/// Turns a raw DM subscriber into an event subscriber that decrypts.
pub fn decrypting(keys: Keypair, on_message: DirectMessageCallback) -> RelayEventCallback {
    verified(Arc::new(move |event: Event| {
        match open_direct_message(&keys, &event) {
            Ok((sender, plaintext)) => on_message(IncomingMessage {
                event_id: event.id.clone(),
                sender,
                plaintext,
            }),
            Err(error) => warn!(event_id = %event.id, "dropping direct message: {}", error),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::get_expiration;

    #[test]
    fn created_at_is_strictly_increasing() {
        let clock = CreatedAt::default();
        assert_eq!(clock.next(100), 100);
        assert_eq!(clock.next(100), 101);
        assert_eq!(clock.next(100), 102);
        assert_eq!(clock.next(200), 200);
        assert_eq!(clock.next(150), 201);
    }

    #[test]
    fn replaceable_event_carries_single_d_tag() {
        let keys = Keypair::generate();
        let event = sign_replaceable(
            &keys,
            1_700_000_000,
            30078,
            "r1",
            vec![
                create_tag("d", "spoofed"),
                create_tag("g", "w21z4"),
                nostr::create_expiration_tag(1_700_000_060),
            ],
            "{}",
        )
        .unwrap();

        assert_eq!(event.d_tag(), Some("r1"));
        assert_eq!(event.tags.iter().filter(|tag| tag[0] == "d").count(), 1);
        assert_eq!(get_expiration(&event), Some(1_700_000_060));
        assert_eq!(event.pubkey, keys.public_key_hex());
        assert!(is_authentic(&event));
    }

    #[test]
    fn direct_message_round_trip_between_two_keys() {
        let driver = Keypair::generate();
        let rider = Keypair::generate();

        let event =
            seal_direct_message(&driver, 1_700_000_000, &rider.public_key_hex(), "hello").unwrap();
        assert_eq!(event.kind, KIND_ENCRYPTED_DIRECT_MESSAGE);
        assert_ne!(event.content, "hello");

        let (sender, plaintext) = open_direct_message(&rider, &event).unwrap();
        assert_eq!(sender, driver.public_key_hex());
        assert_eq!(plaintext, "hello");

        let bystander = Keypair::generate();
        assert!(open_direct_message(&bystander, &event).is_err());
    }

    #[test]
    fn tampered_events_are_not_authentic() {
        let keys = Keypair::generate();
        let mut event = sign_replaceable(&keys, 1, 30078, "r1", vec![], "{}").unwrap();
        event.content = "{\"status\":\"taken\"}".to_string();
        assert!(!is_authentic(&event));
    }
}
