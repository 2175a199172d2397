//! NIP-40: Expiration Timestamp.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/40.md>

use crate::Event;
use crate::tag_parsing::parse_tag_value;

pub const EXPIRATION_TAG: &str = "expiration";

/// Create an `expiration` tag for the given unix timestamp.
pub fn create_expiration_tag(expires_at: u64) -> Vec<String> {
    vec![EXPIRATION_TAG.to_string(), expires_at.to_string()]
}

/// Expiration timestamp carried by the event, if any.
///
/// An unparseable value is treated as absent.
pub fn get_expiration(event: &Event) -> Option<u64> {
    parse_tag_value::<u64>(&event.tags, EXPIRATION_TAG)
}

/// Whether the event has expired at `now` (strictly after its deadline).
pub fn is_expired(event: &Event, now: u64) -> bool {
    get_expiration(event).is_some_and(|expires_at| now > expires_at)
}
