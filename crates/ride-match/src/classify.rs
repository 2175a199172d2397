//! Classification of inbound protocol events.
//!
//! Relays may reorder, duplicate or replay events. These trackers fold that
//! stream into a small set of transitions and are idempotent: feeding the
//! same event twice changes nothing the second time. Both are pure state
//! machines over `(event, now)`; timers and callbacks live in the service.

use std::collections::{HashMap, HashSet};

use nostr::{Event, get_expiration};
use tracing::{debug, warn};

use crate::model::{DriverAvailability, RideRequest, RideStatus};

/// Why an event produced no transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Empty content.
    Retracted,
    Malformed,
    /// Already expired and never seen.
    Stale,
    /// Known and open, with nothing to refresh.
    Duplicate,
    /// Finished before this observer saw it open.
    Historical,
}

/// A request id is only unique per author, so requests are tracked by both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub rider_pubkey: String,
    pub request_id: String,
}

impl RequestKey {
    pub fn new(rider_pubkey: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            rider_pubkey: rider_pubkey.into(),
            request_id: request_id.into(),
        }
    }

    fn of(request: &RideRequest) -> Self {
        Self::new(request.pubkey.clone(), request.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestObservation {
    Appeared {
        request: RideRequest,
        /// Deadline for the local expiration timer, when the event carries one.
        expires_at: Option<u64>,
    },
    Gone {
        key: RequestKey,
        matched_driver_pubkey: Option<String>,
    },
    /// A known open request was re-published; only its deadline moves.
    Heartbeat { key: RequestKey, expires_at: u64 },
    Ignored(IgnoreReason),
}

/// Set of open ride requests visible to one observer.
///
/// Only the author of a request can move it: an event signed by anyone else
/// is a different request, so a forged `taken` under someone else's id is
/// historical noise.
#[derive(Debug, Default)]
pub struct RequestTracker {
    known: HashMap<RequestKey, Option<u64>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &Event, now: u64) -> RequestObservation {
        if event.content.trim().is_empty() {
            return RequestObservation::Ignored(IgnoreReason::Retracted);
        }

        let request = match RideRequest::from_event(event) {
            Ok(request) => request,
            Err(error) => {
                warn!(event_id = %event.id, "discarding malformed ride request: {}", error);
                return RequestObservation::Ignored(IgnoreReason::Malformed);
            }
        };
        let key = RequestKey::of(&request);
        let expires_at = get_expiration(event);

        if expires_at.is_some_and(|deadline| now > deadline) {
            if self.known.remove(&key).is_some() {
                debug!(request_id = %key.request_id, rider = %key.rider_pubkey, "known request arrived already expired");
                return RequestObservation::Gone {
                    key,
                    matched_driver_pubkey: None,
                };
            }
            debug!(request_id = %key.request_id, "ignoring stale request");
            return RequestObservation::Ignored(IgnoreReason::Stale);
        }

        if let Some(current) = self.known.get(&key).copied() {
            return match request.status {
                RideStatus::Taken | RideStatus::Cancelled => {
                    self.known.remove(&key);
                    RequestObservation::Gone {
                        key,
                        matched_driver_pubkey: request.matched_driver_pubkey,
                    }
                }
                RideStatus::Open => match expires_at {
                    Some(expires_at) => {
                        // A reordered older copy never pulls the deadline back.
                        let expires_at = current.map_or(expires_at, |known| known.max(expires_at));
                        self.known.insert(key.clone(), Some(expires_at));
                        RequestObservation::Heartbeat { key, expires_at }
                    }
                    None => RequestObservation::Ignored(IgnoreReason::Duplicate),
                },
            };
        }

        if request.status == RideStatus::Open {
            self.known.insert(key, expires_at);
            return RequestObservation::Appeared {
                request,
                expires_at,
            };
        }

        debug!(request_id = %key.request_id, rider = %key.rider_pubkey, status = %request.status, "ignoring finished request");
        RequestObservation::Ignored(IgnoreReason::Historical)
    }

    /// Local timer for `key` fired at `now`.
    ///
    /// Returns `Gone` only when the request is still known and its latest
    /// deadline has passed; a heartbeat since the timer was armed, or an
    /// earlier `Gone`, makes this a no-op.
    pub fn expire(&mut self, key: &RequestKey, now: u64) -> Option<RequestObservation> {
        let deadline = (*self.known.get(key)?)?;
        if now <= deadline {
            return None;
        }
        self.known.remove(key);
        Some(RequestObservation::Gone {
            key: key.clone(),
            matched_driver_pubkey: None,
        })
    }

    pub fn is_known(&self, key: &RequestKey) -> bool {
        self.known.contains_key(key)
    }

    pub fn deadline(&self, key: &RequestKey) -> Option<u64> {
        self.known.get(key).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn clear(&mut self) {
        self.known.clear();
    }
}

/// Online drivers in one cell.
#[derive(Debug, Default)]
pub struct DriverRoster {
    online: HashSet<String>,
}

impl DriverRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an availability event in; returns the new count when it changed.
    pub fn observe(&mut self, event: &Event) -> Option<usize> {
        let changed = match DriverAvailability::from_event(event) {
            Ok(Some(_)) => self.online.insert(event.pubkey.clone()),
            Ok(None) => self.online.remove(&event.pubkey),
            Err(error) => {
                warn!(event_id = %event.id, "discarding malformed availability: {}", error);
                false
            }
        };
        changed.then_some(self.online.len())
    }

    pub fn count(&self) -> usize {
        self.online.len()
    }

    pub fn contains(&self, pubkey: &str) -> bool {
        self.online.contains(pubkey)
    }

    pub fn clear(&mut self) {
        self.online.clear();
    }
}
