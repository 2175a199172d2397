//! Single relay connection management.

use crate::error::{ClientError, Result};
use crate::subscription::{Filter, Subscription};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use nostr::Event;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type PendingOks = Arc<Mutex<HashMap<String, oneshot::Sender<(bool, String)>>>>;

/// Callback invoked with the relay URL whenever the connection state changes.
pub type StateCallback = Arc<dyn Fn(&str, ConnectionState) + Send + Sync>;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Relay message received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event(String, Event),
    Ok(String, bool, String),
    Eose(String),
    Closed(String, String),
    Notice(String),
    Auth(String),
}

/// Publish confirmation from a relay.
#[derive(Debug, Clone)]
pub struct PublishConfirmation {
    pub relay_url: String,
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    /// How long `publish` waits for the relay's `OK`.
    pub publish_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// Relay connection.
pub struct RelayConnection {
    url: Url,
    config: RelayConfig,
    state: Arc<RwLock<ConnectionState>>,
    writer: Arc<Mutex<Option<WsWriter>>>,
    subscriptions: Arc<Mutex<HashMap<String, Subscription>>>,
    pending_oks: PendingOks,
    state_callback: Arc<std::sync::Mutex<Option<StateCallback>>>,
    recv_task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl RelayConnection {
    /// Create a new relay connection with default config.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config.
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        let parsed_url = Url::parse(url)?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }

        Ok(Self {
            url: parsed_url,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            writer: Arc::new(Mutex::new(None)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            pending_oks: Arc::new(Mutex::new(HashMap::new())),
            state_callback: Arc::new(std::sync::Mutex::new(None)),
            recv_task: Arc::new(Mutex::new(None)),
        })
    }

    /// Relay URL as string.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Register the state change callback, replacing any previous one.
    pub fn on_state_change(&self, callback: StateCallback) {
        if let Ok(mut slot) = self.state_callback.lock() {
            *slot = Some(callback);
        }
    }

    /// Connect to relay and start background receive loop.
    ///
    /// Subscriptions registered before a reconnect are re-sent.
    pub async fn connect(&self) -> Result<()> {
        let mut state_guard = self.state.write().await;
        if *state_guard == ConnectionState::Connected {
            return Err(ClientError::AlreadyConnected);
        }
        *state_guard = ConnectionState::Connecting;
        drop(state_guard);

        let connect_result = timeout(
            self.config.connect_timeout,
            connect_async(self.url.as_str()),
        )
        .await;
        let (stream, _response) = match connect_result {
            Ok(Ok(connected)) => connected,
            Ok(Err(error)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::WebSocket(error.to_string()));
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.config.connect_timeout
                )));
            }
        };

        let (writer, mut reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        *self.state.write().await = ConnectionState::Connected;
        notify_state(&self.state_callback, self.url.as_str(), ConnectionState::Connected);

        let resubscribe: Vec<Subscription> =
            self.subscriptions.lock().await.values().cloned().collect();
        for subscription in resubscribe {
            self.send_json(&req_frame(&subscription)?).await?;
        }

        let subscriptions = Arc::clone(&self.subscriptions);
        let pending_oks = Arc::clone(&self.pending_oks);
        let state = Arc::clone(&self.state);
        let state_callback = Arc::clone(&self.state_callback);
        let relay_url = self.url.to_string();

        let task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match parse_relay_message(text.as_str()) {
                        Ok(Some(message)) => {
                            dispatch(&relay_url, message, &subscriptions, &pending_oks).await;
                        }
                        Ok(None) => {}
                        Err(error) => {
                            warn!("protocol parse error on {}: {}", relay_url, error);
                        }
                    },
                    Ok(Message::Ping(payload)) => {
                        debug!("received ping from {} ({} bytes)", relay_url, payload.len());
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        warn!("websocket read error on {}: {}", relay_url, error);
                        break;
                    }
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            pending_oks.lock().await.clear();
            notify_state(&state_callback, &relay_url, ConnectionState::Disconnected);
        });

        *self.recv_task.lock().await = Some(task);
        Ok(())
    }

    /// Disconnect from relay and stop background tasks.
    pub async fn disconnect(&self) -> Result<()> {
        let was_connected = self.state().await == ConnectionState::Connected;

        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(error) = writer.send(Message::Close(None)).await
        {
            debug!("close frame to {} failed: {}", self.url, error);
        }

        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }

        self.pending_oks.lock().await.clear();
        *self.state.write().await = ConnectionState::Disconnected;
        if was_connected {
            notify_state(
                &self.state_callback,
                self.url.as_str(),
                ConnectionState::Disconnected,
            );
        }
        Ok(())
    }

    /// Publish event and wait for the relay's `OK`.
    pub async fn publish(&self, event: &Event) -> Result<PublishConfirmation> {
        let (ok_tx, ok_rx) = oneshot::channel();
        self.pending_oks
            .lock()
            .await
            .insert(event.id.clone(), ok_tx);

        if let Err(error) = self.send_json(&json!(["EVENT", event])).await {
            self.pending_oks.lock().await.remove(&event.id);
            return Err(error);
        }

        match timeout(self.config.publish_timeout, ok_rx).await {
            Ok(Ok((accepted, message))) => Ok(PublishConfirmation {
                relay_url: self.url.to_string(),
                event_id: event.id.clone(),
                accepted,
                message,
            }),
            Ok(Err(_)) => Err(ClientError::Connection(format!(
                "connection to {} closed before OK",
                self.url
            ))),
            Err(_) => {
                self.pending_oks.lock().await.remove(&event.id);
                Err(ClientError::Timeout(format!(
                    "no OK from {} after {:?}",
                    self.url, self.config.publish_timeout
                )))
            }
        }
    }

    /// Register and send subscription request.
    ///
    /// While disconnected the subscription is only registered; `connect`
    /// sends it.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        let frame = req_frame(&subscription)?;
        self.subscriptions
            .lock()
            .await
            .insert(subscription.id.clone(), subscription);
        match self.send_json(&frame).await {
            Err(ClientError::NotConnected) => {
                debug!("subscription queued until {} connects", self.url);
                Ok(())
            }
            other => other,
        }
    }

    /// Subscribe with filters and no delivery target other than EOSE tracking.
    pub async fn subscribe_filters(
        &self,
        subscription_id: impl Into<String>,
        filters: Vec<Filter>,
    ) -> Result<()> {
        self.subscribe(Subscription::new(subscription_id.into(), filters))
            .await
    }

    /// Close subscription on relay.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.subscriptions.lock().await.remove(subscription_id);
        self.send_json(&json!(["CLOSE", subscription_id])).await
    }

    async fn send_json(&self, value: &Value) -> Result<()> {
        if self.state().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let text = serde_json::to_string(value)?;
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }
}

async fn dispatch(
    relay_url: &str,
    message: RelayMessage,
    subscriptions: &Mutex<HashMap<String, Subscription>>,
    pending_oks: &PendingOks,
) {
    match message {
        RelayMessage::Event(subscription_id, event) => {
            let subscription = { subscriptions.lock().await.get(&subscription_id).cloned() };
            if let Some(subscription) = subscription
                && let Err(error) = subscription.handle_event(event)
            {
                warn!("subscription callback error on {}: {}", relay_url, error);
            }
        }
        RelayMessage::Ok(event_id, accepted, text) => {
            if let Some(sender) = pending_oks.lock().await.remove(&event_id) {
                let _ = sender.send((accepted, text));
            }
        }
        RelayMessage::Eose(subscription_id) => {
            if let Some(subscription) = subscriptions.lock().await.get(&subscription_id) {
                subscription.mark_eose();
            }
        }
        RelayMessage::Closed(subscription_id, reason) => {
            warn!(
                "relay {} closed subscription {}: {}",
                relay_url, subscription_id, reason
            );
            subscriptions.lock().await.remove(&subscription_id);
        }
        RelayMessage::Notice(text) => debug!("notice from {}: {}", relay_url, text),
        RelayMessage::Auth(_) => debug!("relay {} requested auth; ignoring", relay_url),
    }
}

/// `["REQ", <id>, <filter>...]`
fn req_frame(subscription: &Subscription) -> Result<Value> {
    let mut frame = vec![json!("REQ"), json!(subscription.id)];
    for filter in &subscription.filters {
        frame.push(filter.to_json()?);
    }
    Ok(Value::Array(frame))
}

fn notify_state(
    slot: &std::sync::Mutex<Option<StateCallback>>,
    relay_url: &str,
    state: ConnectionState,
) {
    let callback = slot.lock().ok().and_then(|guard| guard.clone());
    if let Some(callback) = callback {
        callback(relay_url, state);
    }
}

fn string_field<'a>(array: &'a [Value], index: usize, what: &str) -> Result<&'a str> {
    array
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::Protocol(format!("invalid {what}")))
}

/// Parse relay protocol JSON text message into typed relay message.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let array = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
    let Some(first) = array.first() else {
        return Ok(None);
    };
    let kind = first
        .as_str()
        .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

    let min_len = match kind {
        "EVENT" => 3,
        "OK" => 4,
        "CLOSED" => 2,
        "EOSE" | "NOTICE" | "AUTH" => 2,
        _ => return Ok(None),
    };
    if array.len() < min_len {
        return Err(ClientError::Protocol(format!("invalid {kind} message")));
    }

    let message = match kind {
        "EVENT" => {
            let subscription_id = string_field(array, 1, "EVENT subscription id")?.to_string();
            let event: Event = serde_json::from_value(array[2].clone()).map_err(|error| {
                ClientError::Protocol(format!("invalid EVENT payload: {}", error))
            })?;
            RelayMessage::Event(subscription_id, event)
        }
        "OK" => {
            let event_id = string_field(array, 1, "OK event id")?.to_string();
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
            let text = string_field(array, 3, "OK message text")?.to_string();
            RelayMessage::Ok(event_id, accepted, text)
        }
        "EOSE" => RelayMessage::Eose(string_field(array, 1, "EOSE subscription id")?.to_string()),
        "CLOSED" => RelayMessage::Closed(
            string_field(array, 1, "CLOSED subscription id")?.to_string(),
            array
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        "NOTICE" => RelayMessage::Notice(string_field(array, 1, "NOTICE message text")?.to_string()),
        _ => RelayMessage::Auth(string_field(array, 1, "AUTH challenge")?.to_string()),
    };
    Ok(Some(message))
}
