//! In-process relay.
//!
//! Behaves like a single well-behaved relay: parameterized replaceable events
//! are upserted by `(pubkey, kind, d)`, expired events are never served, new
//! subscribers get a replay of stored matches, and live events reach every
//! matching subscriber synchronously inside `publish`. Useful as a
//! deterministic harness and for running several sessions in one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use nostr::{Event, Keypair, KindClassification, is_expired};
use nostr_client::Filter;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{MatchingError, Result};
use crate::relay::{
    CreatedAt, DIRECT_MESSAGE_SUBSCRIPTION, DirectMessageCallback, EventRelayClient,
    RelayCountCallback, RelayEventCallback, decrypting, direct_message_filter, is_authentic,
    seal_direct_message, sign_replaceable, verified,
};

struct HubSubscription {
    client: u64,
    id: String,
    filter: Filter,
    callback: RelayEventCallback,
}

#[derive(Default)]
struct ClientSlot {
    connected: bool,
    listeners: Vec<RelayCountCallback>,
}

struct Hub {
    online: bool,
    events: Vec<Event>,
    subscriptions: Vec<HubSubscription>,
    clients: HashMap<u64, ClientSlot>,
    next_client: u64,
}

impl Hub {
    fn purge_expired(&mut self, now: u64) {
        self.events.retain(|event| !is_expired(event, now));
    }

    fn store(&mut self, event: &Event) -> Result<()> {
        match event.classification() {
            KindClassification::Ephemeral => return Ok(()),
            KindClassification::Replaceable | KindClassification::ParameterizedReplaceable => {
                let same_slot = |stored: &Event| {
                    stored.pubkey == event.pubkey
                        && stored.kind == event.kind
                        && stored.d_tag() == event.d_tag()
                };
                if let Some(existing) = self.events.iter().find(|stored| same_slot(*stored))
                    && existing.created_at > event.created_at
                {
                    return Err(MatchingError::Transport(format!(
                        "event {} is older than the stored replacement",
                        event.id
                    )));
                }
                self.events.retain(|stored| !same_slot(stored));
            }
            KindClassification::Regular | KindClassification::Unknown => {
                if self.events.iter().any(|stored| stored.id == event.id) {
                    return Ok(());
                }
            }
        }
        self.events.push(event.clone());
        Ok(())
    }

    fn listeners_with_counts(&self) -> Vec<(RelayCountCallback, usize)> {
        self.clients
            .values()
            .flat_map(|slot| {
                let count = usize::from(self.online && slot.connected);
                slot.listeners
                    .iter()
                    .map(move |listener| (Arc::clone(listener), count))
            })
            .collect()
    }
}

/// Shared handle to one in-memory relay.
#[derive(Clone)]
pub struct MemoryRelay {
    hub: Arc<Mutex<Hub>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Relay whose expiration checks and timestamps follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                online: true,
                events: Vec::new(),
                subscriptions: Vec::new(),
                clients: HashMap::new(),
                next_client: 0,
            })),
            clock,
        }
    }

    /// New client identity attached to this relay.
    pub fn client(&self, keys: Keypair) -> MemoryRelayClient {
        let id = match self.lock() {
            Ok(mut hub) => {
                let id = hub.next_client;
                hub.next_client += 1;
                hub.clients.insert(id, ClientSlot::default());
                id
            }
            Err(_) => u64::MAX,
        };
        MemoryRelayClient {
            relay: self.clone(),
            id,
            keys,
            created_at: CreatedAt::default(),
        }
    }

    /// Simulate the relay becoming unreachable (or reachable again).
    ///
    /// While offline, publishes and direct messages fail and nothing is
    /// delivered. Stored events survive.
    pub fn set_online(&self, online: bool) {
        let notifications = match self.lock() {
            Ok(mut hub) => {
                if hub.online == online {
                    return;
                }
                hub.online = online;
                hub.listeners_with_counts()
            }
            Err(_) => return,
        };
        debug!(online, "memory relay availability changed");
        for (listener, count) in notifications {
            listener(count);
        }
    }

    /// Stored, unexpired events matching `filter`, oldest first.
    pub fn query(&self, filter: &Filter) -> Vec<Event> {
        let now = self.clock.now_secs();
        match self.lock() {
            Ok(mut hub) => {
                hub.purge_expired(now);
                let mut events: Vec<Event> = hub
                    .events
                    .iter()
                    .filter(|event| filter.matches(event))
                    .cloned()
                    .collect();
                events.sort_by_key(|event| event.created_at);
                events
            }
            Err(_) => Vec::new(),
        }
    }

    /// Active subscription count across all clients.
    pub fn subscription_count(&self) -> usize {
        self.lock().map(|hub| hub.subscriptions.len()).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Hub>> {
        self.hub
            .lock()
            .map_err(|_| MatchingError::Transport("memory relay state poisoned".to_string()))
    }

    fn publish(&self, client: u64, event: Event) -> Result<String> {
        if !is_authentic(&event) {
            return Err(MatchingError::Transport(format!(
                "event {} failed verification",
                event.id
            )));
        }
        let now = self.clock.now_secs();

        let deliveries = {
            let mut hub = self.lock()?;
            ensure_reachable(&hub, client)?;
            hub.purge_expired(now);
            if is_expired(&event, now) {
                return Err(MatchingError::Transport(format!(
                    "event {} is already expired",
                    event.id
                )));
            }
            hub.store(&event)?;
            hub.subscriptions
                .iter()
                .filter(|subscription| subscription.filter.matches(&event))
                .map(|subscription| Arc::clone(&subscription.callback))
                .collect::<Vec<_>>()
        };

        debug!(event_id = %event.id, kind = event.kind, subscribers = deliveries.len(), "memory relay accepted event");
        for callback in deliveries {
            callback(event.clone());
        }
        Ok(event.id)
    }

    fn subscribe(
        &self,
        client: u64,
        subscription_id: &str,
        filter: Filter,
        callback: RelayEventCallback,
    ) -> Result<()> {
        let now = self.clock.now_secs();
        let replay = {
            let mut hub = self.lock()?;
            ensure_reachable(&hub, client)?;
            hub.purge_expired(now);
            hub.subscriptions
                .retain(|existing| !(existing.client == client && existing.id == subscription_id));
            let mut replay: Vec<Event> = hub
                .events
                .iter()
                .filter(|event| filter.matches(event))
                .cloned()
                .collect();
            replay.sort_by_key(|event| event.created_at);
            hub.subscriptions.push(HubSubscription {
                client,
                id: subscription_id.to_string(),
                filter,
                callback: Arc::clone(&callback),
            });
            replay
        };

        for event in replay {
            callback(event);
        }
        Ok(())
    }

    fn unsubscribe(&self, client: u64, subscription_id: &str) -> Result<()> {
        let mut hub = self.lock()?;
        hub.subscriptions
            .retain(|existing| !(existing.client == client && existing.id == subscription_id));
        Ok(())
    }

    fn set_connected(&self, client: u64, connected: bool) -> Result<()> {
        let notifications = {
            let mut hub = self.lock()?;
            if connected && !hub.online {
                return Err(MatchingError::Transport("relay unreachable".to_string()));
            }
            let online = hub.online;
            let Some(slot) = hub.clients.get_mut(&client) else {
                return Err(MatchingError::Transport("unknown client".to_string()));
            };
            if slot.connected == connected {
                return Ok(());
            }
            slot.connected = connected;
            let count = usize::from(online && connected);
            let listeners = slot.listeners.clone();
            if !connected {
                hub.subscriptions.retain(|existing| existing.client != client);
            }
            listeners
                .into_iter()
                .map(|listener| (listener, count))
                .collect::<Vec<_>>()
        };
        for (listener, count) in notifications {
            listener(count);
        }
        Ok(())
    }

    fn add_listener(&self, client: u64, callback: RelayCountCallback) {
        if let Ok(mut hub) = self.lock()
            && let Some(slot) = hub.clients.get_mut(&client)
        {
            slot.listeners.push(callback);
        }
    }
}

fn ensure_reachable(hub: &Hub, client: u64) -> Result<()> {
    if !hub.online {
        return Err(MatchingError::Transport("relay unreachable".to_string()));
    }
    if !hub.clients.get(&client).is_some_and(|slot| slot.connected) {
        return Err(MatchingError::Transport("not connected".to_string()));
    }
    Ok(())
}

/// One signing identity connected to a [`MemoryRelay`].
pub struct MemoryRelayClient {
    relay: MemoryRelay,
    id: u64,
    keys: Keypair,
    created_at: CreatedAt,
}

impl MemoryRelayClient {
    pub fn relay(&self) -> &MemoryRelay {
        &self.relay
    }

    fn now(&self) -> u64 {
        self.relay.clock.now_secs()
    }
}

#[async_trait]
impl EventRelayClient for MemoryRelayClient {
    fn public_key(&self) -> String {
        self.keys.public_key_hex()
    }

    async fn connect(&self) -> Result<()> {
        self.relay.set_connected(self.id, true)
    }

    async fn disconnect(&self) -> Result<()> {
        self.relay.set_connected(self.id, false)
    }

    async fn publish_replaceable(
        &self,
        kind: u16,
        key: &str,
        tags: Vec<Vec<String>>,
        content: &str,
    ) -> Result<String> {
        let created_at = self.created_at.next(self.now());
        let event = sign_replaceable(&self.keys, created_at, kind, key, tags, content)?;
        self.relay.publish(self.id, event)
    }

    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: Filter,
        on_event: RelayEventCallback,
    ) -> Result<()> {
        self.relay
            .subscribe(self.id, subscription_id, filter, verified(on_event))
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.relay.unsubscribe(self.id, subscription_id)
    }

    async fn subscribe_direct_messages(&self, on_message: DirectMessageCallback) -> Result<()> {
        let filter = direct_message_filter(&self.public_key(), self.now());
        self.relay.subscribe(
            self.id,
            DIRECT_MESSAGE_SUBSCRIPTION,
            filter,
            decrypting(self.keys.clone(), on_message),
        )
    }

    async fn send_direct_message(&self, recipient: &str, payload: &str) -> Result<String> {
        let event = seal_direct_message(&self.keys, self.now(), recipient, payload)?;
        self.relay.publish(self.id, event)
    }

    fn on_relay_count_change(&self, callback: RelayCountCallback) {
        self.relay.add_listener(self.id, callback);
    }
}
