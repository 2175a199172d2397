//! Subscription filters and delivery.

use crate::error::{ClientError, Result};
use nostr::Event;
use nostr::tag_parsing::collect_tag_values;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Callback type for handling received events.
pub type EventCallback = Arc<dyn Fn(Event) -> Result<()> + Send + Sync>;

/// NIP-01 subscription filter.
///
/// Only the tag filters the workspace queries on are modelled (`#d`, `#g`,
/// `#p`, `#t`). Absent fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(rename = "#d", default, skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<Vec<String>>,
    #[serde(rename = "#g", default, skip_serializing_if = "Option::is_none")]
    pub geohashes: Option<Vec<String>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<String>>,
    #[serde(rename = "#t", default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(pubkey.into());
        self
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifiers
            .get_or_insert_with(Vec::new)
            .push(identifier.into());
        self
    }

    pub fn geohash(mut self, geohash: impl Into<String>) -> Self {
        self.geohashes
            .get_or_insert_with(Vec::new)
            .push(geohash.into());
        self
    }

    pub fn pubkey(mut self, pubkey: impl Into<String>) -> Self {
        self.pubkeys.get_or_insert_with(Vec::new).push(pubkey.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.get_or_insert_with(Vec::new).push(topic.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// JSON object as sent in a `REQ` message.
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Evaluate the filter locally, the way a relay would.
    ///
    /// `limit` only bounds stored-event replay and is ignored here.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.contains(&event.id)
        {
            return false;
        }
        if let Some(authors) = &self.authors
            && !authors.contains(&event.pubkey)
        {
            return false;
        }
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }

        let tag_filters = [
            ("d", &self.identifiers),
            ("g", &self.geohashes),
            ("p", &self.pubkeys),
            ("t", &self.topics),
        ];
        tag_filters.into_iter().all(|(name, wanted)| match wanted {
            Some(wanted) => collect_tag_values(&event.tags, name)
                .iter()
                .any(|value| wanted.contains(value)),
            None => true,
        })
    }
}

/// A subscription to filtered events from a relay.
#[derive(Clone)]
pub struct Subscription {
    /// Subscription ID.
    pub id: String,
    /// Filters for this subscription.
    pub filters: Vec<Filter>,
    eose_received: Arc<AtomicBool>,
    callback: Option<EventCallback>,
    event_tx: Option<mpsc::Sender<Event>>,
}

impl Subscription {
    /// Create a new subscription with filters.
    pub fn new(id: String, filters: Vec<Filter>) -> Self {
        Self {
            id,
            filters,
            eose_received: Arc::new(AtomicBool::new(false)),
            callback: None,
            event_tx: None,
        }
    }

    /// Create a subscription with callback-based event handling.
    pub fn with_callback(id: String, filters: Vec<Filter>, callback: EventCallback) -> Self {
        Self {
            callback: Some(callback),
            ..Self::new(id, filters)
        }
    }

    /// Create a subscription that receives events on a bounded channel.
    pub fn with_channel(id: String, filters: Vec<Filter>) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(1000);
        let subscription = Self {
            event_tx: Some(tx),
            ..Self::new(id, filters)
        };
        (subscription, rx)
    }

    /// Whether any of the filters accepts the event.
    pub fn matches(&self, event: &Event) -> bool {
        self.filters.iter().any(|filter| filter.matches(event))
    }

    /// Handle a received event.
    pub fn handle_event(&self, event: Event) -> Result<()> {
        if let Some(callback) = &self.callback {
            callback(event.clone())?;
        }

        if let Some(tx) = &self.event_tx {
            tx.try_send(event).map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => {
                    ClientError::Subscription("event channel full - consumer too slow".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    ClientError::Subscription("event channel closed".to_string())
                }
            })?;
        }

        Ok(())
    }

    /// Mark EOSE as received.
    pub fn mark_eose(&self) {
        self.eose_received.store(true, Ordering::Relaxed);
    }

    /// Check if EOSE has been received.
    pub fn has_eose(&self) -> bool {
        self.eose_received.load(Ordering::Relaxed)
    }
}
