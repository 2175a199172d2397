//! Relay pool for multi-relay fanout.

use crate::error::{ClientError, Result};
use crate::relay::{ConnectionState, PublishConfirmation, RelayConfig, RelayConnection};
use crate::subscription::{Filter, Subscription};
use nostr::Event;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Callback invoked with the number of connected relays when it changes.
pub type RelayCountCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of relays in the pool.
    pub max_relays: usize,
    /// Relay configuration template.
    pub relay_config: RelayConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_relays: 16,
            relay_config: RelayConfig::default(),
        }
    }
}

#[derive(Default)]
struct ConnectedRelays {
    urls: HashSet<String>,
    listeners: Vec<RelayCountCallback>,
}

impl ConnectedRelays {
    /// Apply a state transition; returns the listeners to notify and the new
    /// count when the count changed.
    fn apply(&mut self, url: &str, state: ConnectionState) -> Option<(Vec<RelayCountCallback>, usize)> {
        let changed = match state {
            ConnectionState::Connected => self.urls.insert(url.to_string()),
            ConnectionState::Disconnected => self.urls.remove(url),
            ConnectionState::Connecting => false,
        };
        changed.then(|| (self.listeners.clone(), self.urls.len()))
    }
}

/// Minimal multi-relay pool.
pub struct RelayPool {
    relays: Arc<RwLock<HashMap<String, Arc<RelayConnection>>>>,
    connected: Arc<Mutex<ConnectedRelays>>,
    config: PoolConfig,
}

impl RelayPool {
    /// Create new relay pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            relays: Arc::new(RwLock::new(HashMap::new())),
            connected: Arc::new(Mutex::new(ConnectedRelays::default())),
            config,
        }
    }

    /// Add relay URL to pool (not connected until `connect_all` or `connect_relay`).
    pub async fn add_relay(&self, url: &str) -> Result<()> {
        let mut relays = self.relays.write().await;
        if relays.contains_key(url) {
            return Ok(());
        }
        if relays.len() >= self.config.max_relays {
            return Err(ClientError::InvalidRequest(format!(
                "maximum relay limit ({}) reached",
                self.config.max_relays
            )));
        }

        let relay = RelayConnection::with_config(url, self.config.relay_config.clone())?;
        let connected = Arc::clone(&self.connected);
        let pool_key = url.to_string();
        relay.on_state_change(Arc::new(move |_relay_url: &str, state: ConnectionState| {
            let notification = connected
                .lock()
                .ok()
                .and_then(|mut connected| connected.apply(&pool_key, state));
            if let Some((listeners, count)) = notification {
                debug!("connected relay count is now {}", count);
                for listener in listeners {
                    listener(count);
                }
            }
        }));
        relays.insert(url.to_string(), Arc::new(relay));
        Ok(())
    }

    /// Register a listener for connected relay count changes.
    pub fn on_relay_count_change(&self, callback: RelayCountCallback) {
        if let Ok(mut connected) = self.connected.lock() {
            connected.listeners.push(callback);
        }
    }

    /// Number of relays currently connected.
    pub fn connected_count(&self) -> usize {
        self.connected
            .lock()
            .map(|connected| connected.urls.len())
            .unwrap_or_default()
    }

    /// Connect a specific relay.
    pub async fn connect_relay(&self, url: &str) -> Result<()> {
        let relay = self
            .relays
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| ClientError::InvalidRequest(format!("unknown relay: {}", url)))?;
        relay.connect().await
    }

    /// Connect all relays that are not connected yet.
    pub async fn connect_all(&self) -> Result<()> {
        let relays: Vec<Arc<RelayConnection>> =
            self.relays.read().await.values().cloned().collect();
        for relay in relays {
            if relay.state().await == ConnectionState::Connected {
                continue;
            }
            if let Err(error) = relay.connect().await {
                debug!("relay connect failed for {}: {}", relay.url(), error);
            }
        }

        let connected = self.connected_count();
        if connected == 0 {
            return Err(ClientError::Connection(
                "failed to connect to any relay".to_string(),
            ));
        }
        info!("connected to {} relay(s)", connected);
        Ok(())
    }

    /// Disconnect all relays.
    pub async fn disconnect_all(&self) -> Result<()> {
        let relays: Vec<Arc<RelayConnection>> =
            self.relays.read().await.values().cloned().collect();
        for relay in relays {
            relay.disconnect().await?;
        }
        Ok(())
    }

    /// Publish event to all connected relays.
    ///
    /// Fails only when no relay accepted the event.
    pub async fn publish(&self, event: &Event) -> Result<Vec<PublishConfirmation>> {
        let relays: Vec<Arc<RelayConnection>> =
            self.relays.read().await.values().cloned().collect();
        if relays.is_empty() {
            return Err(ClientError::NotConnected);
        }

        let mut confirmations = Vec::new();
        for relay in relays {
            match relay.publish(event).await {
                Ok(confirmation) => confirmations.push(confirmation),
                Err(error) => confirmations.push(PublishConfirmation {
                    relay_url: relay.url().to_string(),
                    event_id: event.id.clone(),
                    accepted: false,
                    message: error.to_string(),
                }),
            }
        }

        if !confirmations.iter().any(|confirmation| confirmation.accepted) {
            let message = confirmations
                .iter()
                .map(|confirmation| format!("{}: {}", confirmation.relay_url, confirmation.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ClientError::Rejected {
                event_id: event.id.clone(),
                message,
            });
        }
        Ok(confirmations)
    }

    /// Send subscription to all connected relays.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        let relays: Vec<Arc<RelayConnection>> =
            self.relays.read().await.values().cloned().collect();
        if relays.is_empty() {
            return Err(ClientError::NotConnected);
        }

        let mut subscribed = 0usize;
        for relay in relays {
            match relay.subscribe(subscription.clone()).await {
                Ok(()) => subscribed += 1,
                Err(error) => debug!("subscribe on {} failed: {}", relay.url(), error),
            }
        }
        if subscribed == 0 {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    /// Subscribe using filters only.
    pub async fn subscribe_filters(
        &self,
        subscription_id: impl Into<String>,
        filters: Vec<Filter>,
    ) -> Result<()> {
        self.subscribe(Subscription::new(subscription_id.into(), filters))
            .await
    }

    /// Close subscription on all relays.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let relays: Vec<Arc<RelayConnection>> =
            self.relays.read().await.values().cloned().collect();
        for relay in relays {
            if let Err(error) = relay.unsubscribe(subscription_id).await {
                debug!("unsubscribe on {} failed: {}", relay.url(), error);
            }
        }
        Ok(())
    }

    /// Get relay by URL.
    pub async fn relay(&self, url: &str) -> Option<Arc<RelayConnection>> {
        self.relays.read().await.get(url).cloned()
    }
}
