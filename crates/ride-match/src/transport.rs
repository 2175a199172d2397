//! [`EventRelayClient`] over WebSocket relays.

use std::sync::Arc;

use async_trait::async_trait;
use nostr::{Event, Keypair};
use nostr_client::{Filter, PoolConfig, RelayPool, Subscription};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::relay::{
    CreatedAt, DIRECT_MESSAGE_SUBSCRIPTION, DirectMessageCallback, EventRelayClient,
    RelayCountCallback, RelayEventCallback, decrypting, direct_message_filter, seal_direct_message,
    sign_replaceable, verified,
};

pub struct NostrRelayClient {
    pool: RelayPool,
    relays: Vec<String>,
    keys: Keypair,
    clock: Arc<dyn Clock>,
    created_at: CreatedAt,
    connecting: Mutex<()>,
}

impl NostrRelayClient {
    pub fn new(keys: Keypair, relays: Vec<String>) -> Self {
        Self::with_pool_config(keys, relays, PoolConfig::default())
    }

    pub fn with_pool_config(keys: Keypair, relays: Vec<String>, config: PoolConfig) -> Self {
        Self {
            pool: RelayPool::new(config),
            relays,
            keys,
            clock: Arc::new(SystemClock),
            created_at: CreatedAt::default(),
            connecting: Mutex::new(()),
        }
    }

    /// Register every relay with the pool without connecting.
    pub async fn add_relays(&self) -> Result<()> {
        for url in &self.relays {
            self.pool.add_relay(url).await?;
        }
        Ok(())
    }

    /// Start connecting and return immediately.
    ///
    /// Subscriptions made before the sockets are up are sent once they
    /// connect. Progress is visible through the relay count callback.
    pub fn connect_in_background(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = client.connect().await {
                warn!("background relay connect failed: {}", error);
            }
        });
    }

    pub fn connected_count(&self) -> usize {
        self.pool.connected_count()
    }

    fn subscription(&self, id: &str, filter: Filter, on_event: RelayEventCallback) -> Subscription {
        Subscription::with_callback(
            id.to_string(),
            vec![filter],
            Arc::new(move |event: Event| {
                on_event(event);
                Ok(())
            }),
        )
    }
}

#[async_trait]
impl EventRelayClient for NostrRelayClient {
    fn public_key(&self) -> String {
        self.keys.public_key_hex()
    }

    /// Connects once; later calls return as soon as any relay is up, waiting
    /// for a connect already in flight.
    async fn connect(&self) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        if self.pool.connected_count() > 0 {
            return Ok(());
        }
        self.add_relays().await?;
        self.pool.connect_all().await?;
        info!(
            pubkey = %self.public_key(),
            relays = self.pool.connected_count(),
            "connected to relay network"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.disconnect_all().await?;
        Ok(())
    }

    async fn publish_replaceable(
        &self,
        kind: u16,
        key: &str,
        tags: Vec<Vec<String>>,
        content: &str,
    ) -> Result<String> {
        let created_at = self.created_at.next(self.clock.now_secs());
        let event = sign_replaceable(&self.keys, created_at, kind, key, tags, content)?;
        self.pool.publish(&event).await?;
        Ok(event.id)
    }

    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: Filter,
        on_event: RelayEventCallback,
    ) -> Result<()> {
        self.add_relays().await?;
        let subscription = self.subscription(subscription_id, filter, verified(on_event));
        self.pool.subscribe(subscription).await?;
        Ok(())
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.pool.unsubscribe(subscription_id).await?;
        Ok(())
    }

    async fn subscribe_direct_messages(&self, on_message: DirectMessageCallback) -> Result<()> {
        self.add_relays().await?;
        let filter = direct_message_filter(&self.public_key(), self.clock.now_secs());
        let subscription = self.subscription(
            DIRECT_MESSAGE_SUBSCRIPTION,
            filter,
            decrypting(self.keys.clone(), on_message),
        );
        self.pool.subscribe(subscription).await?;
        Ok(())
    }

    async fn send_direct_message(&self, recipient: &str, payload: &str) -> Result<String> {
        let event = seal_direct_message(&self.keys, self.clock.now_secs(), recipient, payload)?;
        self.pool.publish(&event).await?;
        Ok(event.id)
    }

    fn on_relay_count_change(&self, callback: RelayCountCallback) {
        self.pool.on_relay_count_change(callback);
    }
}
