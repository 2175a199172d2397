//! Ride matching service.
//!
//! One [`RideMatchingService`] runs one session, either as a rider or as a
//! driver. It publishes and interprets protocol events through an
//! [`EventRelayClient`] and reports what it sees as [`MatchingEvent`]s.
//!
//! Inbound events are classified synchronously inside the relay's delivery
//! callback under a plain mutex. The lock is never held across an `.await`
//! or while the caller's callback runs. Expiration timers and the heartbeat
//! are tokio tasks holding only a weak reference to the service.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use nostr::{Event, create_expiration_tag};
use nostr_client::Filter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::classify::{DriverRoster, RequestKey, RequestObservation, RequestTracker};
use crate::clock::{Clock, SystemClock};
use crate::config::MatchingConfig;
use crate::error::{MatchingError, Result};
use crate::geohash::{self, Coordinates};
use crate::model::{
    AVAILABILITY_KEY, DirectMessage, DriverAvailability, RideRequest, RideStatus, RiderAction,
    RiderPhase, create_geohash_tag, create_topic_tag,
};
use crate::relay::{DIRECT_MESSAGE_SUBSCRIPTION, EventRelayClient, IncomingMessage};

const REQUEST_SUBSCRIPTION: &str = "ride-match-requests";
const DRIVER_SUBSCRIPTION: &str = "ride-match-drivers";

/// Everything the service reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchingEvent {
    /// Driver side: an open request appeared in the cell.
    RequestAppeared(RideRequest),
    /// Driver side: a request was taken, cancelled or expired.
    RequestGone {
        rider_pubkey: String,
        request_id: String,
        matched_driver_pubkey: Option<String>,
    },
    /// Rider side: a driver proposed to take the active request.
    DriverAccepted {
        request_id: String,
        driver_pubkey: String,
    },
    /// Rider side: number of online drivers in the cell.
    DriverCountChanged(usize),
    RelayCountChanged(usize),
    /// Rider side: the active request outlived its expiration locally.
    RequestExpired { request_id: String },
}

pub type MatchingCallback = Arc<dyn Fn(MatchingEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Rider,
    Driver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Rider => "rider",
            Role::Driver => "driver",
        }
    }
}

struct RiderSession {
    request: RideRequest,
    cell: String,
    phase: RiderPhase,
    expires_at: u64,
}

struct DriverSession {
    cell: String,
    location: Coordinates,
    online: bool,
}

enum Session {
    Idle,
    Rider(RiderSession),
    Driver(DriverSession),
}

impl Session {
    fn role(&self) -> Option<Role> {
        match self {
            Session::Idle => None,
            Session::Rider(_) => Some(Role::Rider),
            Session::Driver(_) => Some(Role::Driver),
        }
    }
}

struct SessionState {
    session: Session,
    requests: RequestTracker,
    drivers: DriverRoster,
    /// Direct message event ids already handled; relays deliver copies.
    seen_messages: HashSet<String>,
    request_timers: HashMap<RequestKey, JoinHandle<()>>,
    expiry_timer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    subscriptions: Vec<String>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            session: Session::Idle,
            requests: RequestTracker::new(),
            drivers: DriverRoster::new(),
            seen_messages: HashSet::new(),
            request_timers: HashMap::new(),
            expiry_timer: None,
            heartbeat: None,
            subscriptions: Vec::new(),
        }
    }

    fn stop_rider_tasks(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(timer) = self.expiry_timer.take() {
            timer.abort();
        }
    }

    fn abort_all(&mut self) {
        self.stop_rider_tasks();
        for (_, timer) in self.request_timers.drain() {
            timer.abort();
        }
    }

    /// The rider session driving `request_id`, checked for the caller.
    fn rider(&self, request_id: &str) -> Result<&RiderSession> {
        match &self.session {
            Session::Rider(rider) if rider.request.id == request_id => Ok(rider),
            Session::Rider(rider) => Err(MatchingError::NotActiveRequest {
                expected: rider.request.id.clone(),
                actual: request_id.to_string(),
            }),
            Session::Driver(_) => Err(MatchingError::WrongRole(Role::Rider.as_str())),
            Session::Idle => Err(MatchingError::NoActiveRequest),
        }
    }
}

/// Session-scoped matching protocol engine.
pub struct RideMatchingService {
    relay: Arc<dyn EventRelayClient>,
    config: MatchingConfig,
    clock: Arc<dyn Clock>,
    notify: MatchingCallback,
    state: Mutex<SessionState>,
    // Orders rider publishes so a heartbeat can never land after a status change.
    publish_lock: tokio::sync::Mutex<()>,
    weak: Weak<Self>,
}

/// Builder for [`RideMatchingService`].
pub struct ServiceBuilder {
    relay: Arc<dyn EventRelayClient>,
    config: MatchingConfig,
    clock: Arc<dyn Clock>,
}

impl ServiceBuilder {
    pub fn config(mut self, config: MatchingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self, notify: MatchingCallback) -> Arc<RideMatchingService> {
        let ServiceBuilder {
            relay,
            config,
            clock,
        } = self;
        Arc::new_cyclic(|weak: &Weak<RideMatchingService>| {
            let listener = weak.clone();
            relay.on_relay_count_change(Arc::new(move |count: usize| {
                if let Some(service) = listener.upgrade() {
                    service.emit(MatchingEvent::RelayCountChanged(count));
                }
            }));
            RideMatchingService {
                relay,
                config,
                clock,
                notify,
                state: Mutex::new(SessionState::new()),
                publish_lock: tokio::sync::Mutex::new(()),
                weak: weak.clone(),
            }
        })
    }

    pub fn build_with_channel(
        self,
    ) -> (
        Arc<RideMatchingService>,
        mpsc::UnboundedReceiver<MatchingEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = self.build(Arc::new(move |event: MatchingEvent| {
            if tx.send(event).is_err() {
                debug!("matching event receiver dropped");
            }
        }));
        (service, rx)
    }
}

impl RideMatchingService {
    pub fn builder(relay: Arc<dyn EventRelayClient>) -> ServiceBuilder {
        ServiceBuilder {
            relay,
            config: MatchingConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn new(
        relay: Arc<dyn EventRelayClient>,
        config: MatchingConfig,
        notify: MatchingCallback,
    ) -> Arc<Self> {
        Self::builder(relay).config(config).build(notify)
    }

    /// Service whose notifications arrive on an unbounded channel.
    pub fn with_channel(
        relay: Arc<dyn EventRelayClient>,
        config: MatchingConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MatchingEvent>) {
        Self::builder(relay).config(config).build_with_channel()
    }

    pub fn public_key(&self) -> String {
        self.relay.public_key()
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn role(&self) -> Option<Role> {
        self.lock().ok().and_then(|state| state.session.role())
    }

    /// Phase of the rider's request; `Idle` outside a rider session.
    pub fn rider_phase(&self) -> RiderPhase {
        match self.lock().as_deref() {
            Ok(SessionState {
                session: Session::Rider(rider),
                ..
            }) => rider.phase,
            _ => RiderPhase::Idle,
        }
    }

    pub fn active_request(&self) -> Option<RideRequest> {
        match self.lock().as_deref() {
            Ok(SessionState {
                session: Session::Rider(rider),
                ..
            }) => Some(rider.request.clone()),
            _ => None,
        }
    }

    pub fn driver_count(&self) -> usize {
        self.lock().map(|state| state.drivers.count()).unwrap_or_default()
    }

    /// Open requests currently visible to a driver session.
    pub fn open_request_count(&self) -> usize {
        self.lock().map(|state| state.requests.len()).unwrap_or_default()
    }

    // ---- rider ----

    /// Publish `request` in `cell` and start listening for accepts and drivers.
    ///
    /// Returns the request as published, with the author key filled in.
    pub async fn start_as_rider(&self, cell: &str, request: RideRequest) -> Result<RideRequest> {
        if request.status != RideStatus::Open {
            return Err(MatchingError::RequestNotOpen(request.status));
        }
        if request.id.trim().is_empty() {
            return Err(MatchingError::InvalidInput(
                "request id must not be empty".to_string(),
            ));
        }
        validate_cell(cell)?;

        let mut request = request;
        request.pubkey = self.relay.public_key();
        if request.geohash != cell {
            debug!(request_id = %request.id, from = %request.geohash, to = %cell, "request re-scoped to cell");
            request.geohash = cell.to_string();
        }

        let expires_at = self.clock.now_secs() + self.config.request_ttl.as_secs();
        self.reserve(Session::Rider(RiderSession {
            request: request.clone(),
            cell: cell.to_string(),
            phase: RiderPhase::Open,
            expires_at,
        }))?;

        if let Err(error) = self.open_rider_session(cell, &request, expires_at).await {
            warn!(request_id = %request.id, "rider session failed to start: {}", error);
            self.abandon().await;
            return Err(error);
        }

        if let Ok(mut state) = self.lock() {
            self.arm_expiry_timer(&mut state, expires_at);
            if self.config.auto_heartbeat {
                state.heartbeat = self.spawn_heartbeat();
            }
        }
        info!(request_id = %request.id, cell, "ride request published");
        Ok(request)
    }

    async fn open_rider_session(
        &self,
        cell: &str,
        request: &RideRequest,
        expires_at: u64,
    ) -> Result<()> {
        self.relay.connect().await?;

        let weak = self.weak.clone();
        self.relay
            .subscribe_direct_messages(Arc::new(move |message: IncomingMessage| {
                if let Some(service) = weak.upgrade() {
                    service.handle_direct_message(&message);
                }
            }))
            .await?;
        self.track_subscription(DIRECT_MESSAGE_SUBSCRIPTION);

        self.publish_request(request, cell, expires_at).await?;

        let filter = Filter::new()
            .kind(self.config.event_kind)
            .identifier(AVAILABILITY_KEY)
            .geohash(cell)
            .topic(&self.config.driver_topic);
        let weak = self.weak.clone();
        self.relay
            .subscribe(
                DRIVER_SUBSCRIPTION,
                filter,
                Arc::new(move |event: Event| {
                    if let Some(service) = weak.upgrade() {
                        service.handle_availability_event(&event);
                    }
                }),
            )
            .await?;
        self.track_subscription(DRIVER_SUBSCRIPTION);
        Ok(())
    }

    /// Re-publish the active request with a fresh expiration.
    pub async fn refresh_request(&self, request: &RideRequest) -> Result<()> {
        self.transition(&request.id, RiderAction::Heartbeat).await?;
        Ok(())
    }

    /// Mark the active request taken by `driver_pubkey`.
    pub async fn confirm_match(
        &self,
        request: &RideRequest,
        driver_pubkey: &str,
    ) -> Result<RideRequest> {
        let confirmed = self
            .transition(
                &request.id,
                RiderAction::Confirm {
                    driver_pubkey: driver_pubkey.to_string(),
                },
            )
            .await?;
        info!(request_id = %confirmed.id, driver = %driver_pubkey, "match confirmed");
        Ok(confirmed)
    }

    pub async fn cancel_request(&self, request: &RideRequest) -> Result<RideRequest> {
        let cancelled = self.transition(&request.id, RiderAction::Cancel).await?;
        info!(request_id = %cancelled.id, "ride request cancelled");
        Ok(cancelled)
    }

    async fn transition(&self, request_id: &str, action: RiderAction) -> Result<RideRequest> {
        let _publishing = self.publish_lock.lock().await;

        let (next, cell) = {
            let state = self.lock()?;
            let rider = state.rider(request_id)?;
            if rider.phase == RiderPhase::Expired {
                return Err(MatchingError::RequestExpired(rider.request.id.clone()));
            }
            (rider.request.apply(&action)?, rider.cell.clone())
        };

        let expires_at = self.clock.now_secs() + self.config.request_ttl.as_secs();
        self.publish_request(&next, &cell, expires_at).await?;

        let mut state = self.lock()?;
        let still_active = matches!(&state.session, Session::Rider(rider) if rider.request.id == next.id);
        if !still_active {
            return Ok(next);
        }
        if let Session::Rider(rider) = &mut state.session {
            rider.request = next.clone();
            rider.phase = RiderPhase::from(next.status);
            rider.expires_at = expires_at;
        }
        if next.status.is_terminal() {
            state.stop_rider_tasks();
        } else {
            self.arm_expiry_timer(&mut state, expires_at);
        }
        Ok(next)
    }

    /// Heartbeat from the background task; `false` once there is nothing to keep alive.
    async fn heartbeat(&self) -> Result<bool> {
        let request_id = {
            let state = self.lock()?;
            match &state.session {
                Session::Rider(rider) if rider.phase == RiderPhase::Open => rider.request.id.clone(),
                _ => return Ok(false),
            }
        };
        match self.transition(&request_id, RiderAction::Heartbeat).await {
            Ok(_) => {
                debug!(request_id = %request_id, "heartbeat published");
                Ok(true)
            }
            Err(
                MatchingError::InvalidTransition { .. }
                | MatchingError::RequestExpired(_)
                | MatchingError::NotActiveRequest { .. }
                | MatchingError::NoActiveRequest,
            ) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn publish_request(&self, request: &RideRequest, cell: &str, expires_at: u64) -> Result<String> {
        let tags = vec![
            create_geohash_tag(cell),
            create_topic_tag(&self.config.request_topic),
            create_expiration_tag(expires_at),
        ];
        let content = request.to_content()?;
        self.relay
            .publish_replaceable(self.config.event_kind, &request.id, tags, &content)
            .await
    }

    fn handle_direct_message(&self, message: &IncomingMessage) {
        let sender = message.sender.as_str();
        let accept = match DirectMessage::parse(&message.plaintext) {
            Ok(DirectMessage::Accept(accept)) => accept,
            Err(error) => {
                warn!(sender, "discarding malformed direct message: {}", error);
                return;
            }
        };

        let surfaced = match self.lock() {
            Ok(mut state) => {
                let current = match &state.session {
                    Session::Rider(rider) => {
                        rider.request.id == accept.request_id && rider.phase == RiderPhase::Open
                    }
                    _ => false,
                };
                if current && !state.seen_messages.insert(message.event_id.clone()) {
                    debug!(event_id = %message.event_id, sender, "duplicate accept delivery");
                    return;
                }
                current
            }
            Err(_) => false,
        };
        if !surfaced {
            debug!(request_id = %accept.request_id, sender, "ignoring accept for inactive request");
            return;
        }
        if accept.driver_pubkey != sender {
            warn!(
                request_id = %accept.request_id,
                claimed = %accept.driver_pubkey,
                sender,
                "accept names a different driver; using the sender"
            );
        }

        info!(request_id = %accept.request_id, driver = sender, "driver accepted");
        self.emit(MatchingEvent::DriverAccepted {
            request_id: accept.request_id,
            driver_pubkey: sender.to_string(),
        });
    }

    fn handle_availability_event(&self, event: &Event) {
        let changed = match self.lock() {
            Ok(mut state) if matches!(state.session, Session::Rider(_)) => {
                state.drivers.observe(event)
            }
            _ => None,
        };
        if let Some(count) = changed {
            debug!(count, "driver count changed");
            self.emit(MatchingEvent::DriverCountChanged(count));
        }
    }

    fn expire_own_request(&self) {
        let now = self.clock.now_secs();
        let expired = match self.lock() {
            Ok(mut state) => {
                let expired = match &mut state.session {
                    Session::Rider(rider)
                        if rider.phase == RiderPhase::Open && now > rider.expires_at =>
                    {
                        rider.phase = RiderPhase::Expired;
                        Some(rider.request.id.clone())
                    }
                    _ => None,
                };
                if expired.is_some() {
                    state.expiry_timer = None;
                    if let Some(heartbeat) = state.heartbeat.take() {
                        heartbeat.abort();
                    }
                }
                expired
            }
            Err(_) => None,
        };
        if let Some(request_id) = expired {
            warn!(request_id = %request_id, "ride request expired without a heartbeat");
            self.emit(MatchingEvent::RequestExpired { request_id });
        }
    }

    fn arm_expiry_timer(&self, state: &mut SessionState, expires_at: u64) {
        let delay = self.delay_until(expires_at);
        let weak = self.weak.clone();
        let timer = spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(service) = weak.upgrade() {
                service.expire_own_request();
            }
        });
        if let Some(previous) = std::mem::replace(&mut state.expiry_timer, timer) {
            previous.abort();
        }
    }

    fn spawn_heartbeat(&self) -> Option<JoinHandle<()>> {
        let weak = self.weak.clone();
        let period = self.config.heartbeat_interval.max(Duration::from_secs(1));
        spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                match service.heartbeat().await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(error) => warn!("heartbeat failed: {}", error),
                }
            }
        })
    }

    // ---- driver ----

    /// Announce availability in `cell` and watch its ride requests.
    pub async fn start_as_driver(&self, cell: &str, location: Coordinates) -> Result<()> {
        validate_cell(cell)?;
        self.reserve(Session::Driver(DriverSession {
            cell: cell.to_string(),
            location,
            online: true,
        }))?;

        if let Err(error) = self.open_driver_session(cell, location).await {
            warn!(cell, "driver session failed to start: {}", error);
            self.abandon().await;
            return Err(error);
        }
        info!(cell, "driver online");
        Ok(())
    }

    async fn open_driver_session(&self, cell: &str, location: Coordinates) -> Result<()> {
        self.relay.connect().await?;
        self.publish_availability(cell, Some(location)).await?;

        let since = self
            .clock
            .now_secs()
            .saturating_sub(self.config.lookback.as_secs());
        let filter = Filter::new()
            .kind(self.config.event_kind)
            .geohash(cell)
            .topic(&self.config.request_topic)
            .since(since);
        let weak = self.weak.clone();
        self.relay
            .subscribe(
                REQUEST_SUBSCRIPTION,
                filter,
                Arc::new(move |event: Event| {
                    if let Some(service) = weak.upgrade() {
                        service.handle_request_event(&event);
                    }
                }),
            )
            .await?;
        self.track_subscription(REQUEST_SUBSCRIPTION);
        Ok(())
    }

    /// Send the accept proposal for `request_id` to its rider.
    ///
    /// A transport failure is returned as is; nothing is retried.
    pub async fn accept_request(&self, rider_pubkey: &str, request_id: &str) -> Result<String> {
        self.driver_cell()?;
        if rider_pubkey.trim().is_empty() || request_id.trim().is_empty() {
            return Err(MatchingError::InvalidInput(
                "rider pubkey and request id are required".to_string(),
            ));
        }

        let payload = DirectMessage::accept(request_id, self.relay.public_key()).to_payload()?;
        match self.relay.send_direct_message(rider_pubkey, &payload).await {
            Ok(event_id) => {
                info!(request_id, rider = rider_pubkey, "accept sent");
                Ok(event_id)
            }
            Err(error) => {
                warn!(request_id, rider = rider_pubkey, "accept not delivered: {}", error);
                Err(error)
            }
        }
    }

    /// Publish empty availability; requests keep arriving.
    pub async fn go_offline(&self) -> Result<()> {
        let cell = self.driver_cell()?;
        self.publish_availability(&cell, None).await?;
        if let Ok(mut state) = self.lock()
            && let Session::Driver(driver) = &mut state.session
        {
            driver.online = false;
        }
        info!(cell = %cell, "driver offline");
        Ok(())
    }

    /// Publish availability again after [`Self::go_offline`].
    pub async fn go_online(&self) -> Result<()> {
        let (cell, location) = {
            let state = self.lock()?;
            match &state.session {
                Session::Driver(driver) => (driver.cell.clone(), driver.location),
                _ => return Err(MatchingError::WrongRole(Role::Driver.as_str())),
            }
        };
        self.publish_availability(&cell, Some(location)).await?;
        if let Ok(mut state) = self.lock()
            && let Session::Driver(driver) = &mut state.session
        {
            driver.online = true;
        }
        info!(cell = %cell, "driver online");
        Ok(())
    }

    async fn publish_availability(&self, cell: &str, location: Option<Coordinates>) -> Result<String> {
        let content = match location {
            Some(location) => {
                let mut availability = DriverAvailability::new(cell, location);
                availability.pubkey = self.relay.public_key();
                availability.to_content()?
            }
            None => String::new(),
        };
        let tags = vec![
            create_geohash_tag(cell),
            create_topic_tag(&self.config.driver_topic),
        ];
        self.relay
            .publish_replaceable(self.config.event_kind, AVAILABILITY_KEY, tags, &content)
            .await
    }

    fn handle_request_event(&self, event: &Event) {
        let now = self.clock.now_secs();
        let observation = match self.lock() {
            Ok(mut state) if matches!(state.session, Session::Driver(_)) => {
                let observation = state.requests.observe(event, now);
                match &observation {
                    RequestObservation::Appeared {
                        request,
                        expires_at: Some(expires_at),
                    } => {
                        let key = RequestKey::new(request.pubkey.clone(), request.id.clone());
                        self.arm_request_timer(&mut state, key, *expires_at, now);
                    }
                    RequestObservation::Heartbeat { key, expires_at } => {
                        self.arm_request_timer(&mut state, key.clone(), *expires_at, now);
                    }
                    RequestObservation::Gone { key, .. } => {
                        if let Some(timer) = state.request_timers.remove(key) {
                            timer.abort();
                        }
                    }
                    RequestObservation::Appeared { .. } | RequestObservation::Ignored(_) => {}
                }
                observation
            }
            _ => return,
        };
        self.surface(observation);
    }

    fn expire_request(&self, key: &RequestKey) {
        let now = self.clock.now_secs();
        let observation = match self.lock() {
            Ok(mut state) => {
                let observation = state.requests.expire(key, now);
                if observation.is_some() {
                    state.request_timers.remove(key);
                }
                observation
            }
            Err(_) => None,
        };
        match observation {
            Some(observation) => {
                debug!(request_id = %key.request_id, "request expired locally");
                self.surface(observation);
            }
            None => debug!(
                request_id = %key.request_id,
                "expiration timer fired for a request no longer pending"
            ),
        }
    }

    fn arm_request_timer(&self, state: &mut SessionState, key: RequestKey, expires_at: u64, now: u64) {
        let delay = Duration::from_secs(expires_at.saturating_sub(now) + 1);
        let weak = self.weak.clone();
        let timer_key = key.clone();
        let timer = spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(service) = weak.upgrade() {
                service.expire_request(&timer_key);
            }
        });
        let previous = match timer {
            Some(timer) => state.request_timers.insert(key, timer),
            None => state.request_timers.remove(&key),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn surface(&self, observation: RequestObservation) {
        match observation {
            RequestObservation::Appeared { request, .. } => {
                info!(request_id = %request.id, rider = %request.pubkey, "ride request appeared");
                self.emit(MatchingEvent::RequestAppeared(request));
            }
            RequestObservation::Gone {
                key,
                matched_driver_pubkey,
            } => {
                info!(
                    request_id = %key.request_id,
                    rider = %key.rider_pubkey,
                    matched = ?matched_driver_pubkey,
                    "ride request gone"
                );
                self.emit(MatchingEvent::RequestGone {
                    rider_pubkey: key.rider_pubkey,
                    request_id: key.request_id,
                    matched_driver_pubkey,
                });
            }
            RequestObservation::Heartbeat { .. } | RequestObservation::Ignored(_) => {}
        }
    }

    fn driver_cell(&self) -> Result<String> {
        let state = self.lock()?;
        match &state.session {
            Session::Driver(driver) => Ok(driver.cell.clone()),
            _ => Err(MatchingError::WrongRole(Role::Driver.as_str())),
        }
    }

    // ---- shared ----

    /// Tear the session down.
    ///
    /// Timers and the heartbeat stop, subscriptions close and local state is
    /// cleared. An online driver publishes empty availability first. A rider's
    /// open request is left to expire on the relays.
    pub async fn stop(&self) -> Result<()> {
        let (session, subscriptions) = {
            let mut state = self.lock()?;
            state.abort_all();
            state.requests.clear();
            state.drivers.clear();
            state.seen_messages.clear();
            let session = std::mem::replace(&mut state.session, Session::Idle);
            (session, std::mem::take(&mut state.subscriptions))
        };

        for subscription in subscriptions {
            if let Err(error) = self.relay.unsubscribe(&subscription).await {
                warn!(subscription = %subscription, "unsubscribe failed: {}", error);
            }
        }

        match session {
            Session::Driver(driver) if driver.online => {
                if let Err(error) = self.publish_availability(&driver.cell, None).await {
                    warn!(cell = %driver.cell, "could not announce going offline: {}", error);
                }
            }
            Session::Rider(rider) => {
                debug!(request_id = %rider.request.id, phase = ?rider.phase, "leaving request to relay expiration");
            }
            _ => {}
        }

        self.relay.disconnect().await?;
        info!("matching session stopped");
        Ok(())
    }

    fn reserve(&self, session: Session) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(role) = state.session.role() {
            return Err(MatchingError::AlreadyStarted(role.as_str()));
        }
        state.session = session;
        Ok(())
    }

    async fn abandon(&self) {
        let subscriptions = match self.lock() {
            Ok(mut state) => {
                state.abort_all();
                state.requests.clear();
                state.drivers.clear();
                state.seen_messages.clear();
                state.session = Session::Idle;
                std::mem::take(&mut state.subscriptions)
            }
            Err(_) => Vec::new(),
        };
        for subscription in subscriptions {
            if let Err(error) = self.relay.unsubscribe(&subscription).await {
                debug!(subscription = %subscription, "unsubscribe failed: {}", error);
            }
        }
    }

    fn track_subscription(&self, subscription_id: &str) {
        if let Ok(mut state) = self.lock()
            && !state.subscriptions.iter().any(|existing| existing == subscription_id)
        {
            state.subscriptions.push(subscription_id.to_string());
        }
    }

    fn delay_until(&self, deadline: u64) -> Duration {
        Duration::from_secs(deadline.saturating_sub(self.clock.now_secs()) + 1)
    }

    fn emit(&self, event: MatchingEvent) {
        (self.notify)(event);
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.state.lock().map_err(|_| MatchingError::StatePoisoned)
    }
}

impl Drop for RideMatchingService {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            state.abort_all();
        }
    }
}

fn validate_cell(cell: &str) -> Result<()> {
    if geohash::is_valid(cell) {
        Ok(())
    } else {
        Err(MatchingError::InvalidInput(format!("invalid geohash cell: {cell:?}")))
    }
}

fn spawn<F>(future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn(future)),
        Err(_) => {
            warn!("no tokio runtime; timer not started");
            None
        }
    }
}
