//! End-to-end matching sessions over the in-memory relay.
//!
//! Every test runs on a paused tokio clock; the relay and all services share
//! one `TokioClock`, so expiration tags, relay-side purging and local timers
//! move together.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Keypair, create_expiration_tag};
use nostr_client::{Filter, RelayCountCallback};
use ride_match::model::DEFAULT_EVENT_KIND;
use ride_match::{
    Coordinates, DirectMessage, DirectMessageCallback, EventRelayClient, IncomingMessage,
    MatchingConfig, MatchingError, MatchingEvent, MemoryRelay, MemoryRelayClient,
    RelayEventCallback, RideMatchingService, RideRequest, RideStatus, RiderAction, RiderPhase,
    Role, TokioClock,
};
use tokio::sync::mpsc;

const BASE: u64 = 1_700_000_000;
const CELL: &str = "w21z74";

fn location() -> Coordinates {
    Coordinates::new(1.3521, 103.8198)
}

struct Harness {
    relay: MemoryRelay,
    clock: Arc<TokioClock>,
}

struct Node {
    service: Arc<RideMatchingService>,
    events: mpsc::UnboundedReceiver<MatchingEvent>,
    pubkey: String,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(TokioClock::new(BASE));
        Self {
            relay: MemoryRelay::with_clock(clock.clone()),
            clock,
        }
    }

    fn node(&self, auto_heartbeat: bool) -> Node {
        self.node_on(Arc::new(self.relay.client(Keypair::generate())), auto_heartbeat)
    }

    fn node_on(&self, client: Arc<dyn EventRelayClient>, auto_heartbeat: bool) -> Node {
        let pubkey = client.public_key();
        let (service, events) = RideMatchingService::builder(client)
            .config(MatchingConfig {
                auto_heartbeat,
                ..MatchingConfig::default()
            })
            .clock(self.clock.clone())
            .build_with_channel();
        Node {
            service,
            events,
            pubkey,
        }
    }

    async fn driver(&self) -> Node {
        let driver = self.node(true);
        driver
            .service
            .start_as_driver(CELL, location())
            .await
            .unwrap();
        driver
    }
}

impl Node {
    /// Protocol events received so far, without relay count updates.
    fn drain(&mut self) -> Vec<MatchingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if !matches!(event, MatchingEvent::RelayCountChanged(_)) {
                events.push(event);
            }
        }
        events
    }
}

/// Client seeing the network through two relays that both store every
/// direct message, so each one is delivered twice.
struct MirroredRelayClient {
    inner: MemoryRelayClient,
}

#[async_trait]
impl EventRelayClient for MirroredRelayClient {
    fn public_key(&self) -> String {
        self.inner.public_key()
    }

    async fn connect(&self) -> ride_match::Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> ride_match::Result<()> {
        self.inner.disconnect().await
    }

    async fn publish_replaceable(
        &self,
        kind: u16,
        key: &str,
        tags: Vec<Vec<String>>,
        content: &str,
    ) -> ride_match::Result<String> {
        self.inner.publish_replaceable(kind, key, tags, content).await
    }

    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: Filter,
        on_event: RelayEventCallback,
    ) -> ride_match::Result<()> {
        self.inner.subscribe(subscription_id, filter, on_event).await
    }

    async fn unsubscribe(&self, subscription_id: &str) -> ride_match::Result<()> {
        self.inner.unsubscribe(subscription_id).await
    }

    async fn subscribe_direct_messages(
        &self,
        on_message: DirectMessageCallback,
    ) -> ride_match::Result<()> {
        self.inner
            .subscribe_direct_messages(Arc::new(move |message: IncomingMessage| {
                on_message(message.clone());
                on_message(message);
            }))
            .await
    }

    async fn send_direct_message(&self, recipient: &str, payload: &str) -> ride_match::Result<String> {
        self.inner.send_direct_message(recipient, payload).await
    }

    fn on_relay_count_change(&self, callback: RelayCountCallback) {
        self.inner.on_relay_count_change(callback);
    }
}

/// Let paused time run forward and spawned tasks catch up.
async fn elapse(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

fn gone(rider: &Node, request_id: &str, matched: Option<&str>) -> MatchingEvent {
    MatchingEvent::RequestGone {
        rider_pubkey: rider.pubkey.clone(),
        request_id: request_id.to_string(),
        matched_driver_pubkey: matched.map(str::to_string),
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_a_heartbeat_keeps_request_alive() {
    let harness = Harness::new();
    let mut driver = harness.driver().await;
    let mut rider = harness.node(true);

    let request = rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    assert_eq!(request.pubkey, rider.pubkey);
    assert_eq!(
        driver.drain(),
        vec![MatchingEvent::RequestAppeared(request.clone())]
    );

    // Heartbeat at t=45 renews the expiration to t=105.
    elapse(46).await;
    assert!(driver.drain().is_empty());
    elapse(24).await;
    assert!(driver.drain().is_empty());
    assert_eq!(driver.service.open_request_count(), 1);
    assert_eq!(rider.service.rider_phase(), RiderPhase::Open);

    // Rider goes away without retracting anything; TTL does the rest.
    rider.service.stop().await.unwrap();
    elapse(40).await;
    assert_eq!(driver.drain(), vec![gone(&rider, "r1", None)]);
    assert!(rider.drain().iter().all(|event| !matches!(event, MatchingEvent::RequestExpired { .. })));
}

#[tokio::test(start_paused = true)]
async fn scenario_a_silence_past_deadline_is_gone() {
    let harness = Harness::new();
    let mut driver = harness.driver().await;
    let mut rider = harness.node(false);

    rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    assert_eq!(driver.drain().len(), 1);

    elapse(60).await;
    assert!(driver.drain().is_empty());

    elapse(2).await;
    assert_eq!(driver.drain(), vec![gone(&rider, "r1", None)]);
    assert_eq!(
        rider.drain(),
        vec![
            MatchingEvent::DriverCountChanged(1),
            MatchingEvent::RequestExpired {
                request_id: "r1".to_string()
            },
        ]
    );
    assert_eq!(rider.service.rider_phase(), RiderPhase::Expired);

    let request = rider.service.active_request().unwrap();
    assert!(matches!(
        rider.service.refresh_request(&request).await,
        Err(MatchingError::RequestExpired(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_moves_the_deadline() {
    let harness = Harness::new();
    let mut driver = harness.driver().await;
    let rider = harness.node(false);

    let request = rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    driver.drain();

    elapse(30).await;
    rider.service.refresh_request(&request).await.unwrap();
    assert!(driver.drain().is_empty());

    elapse(32).await;
    assert!(driver.drain().is_empty());
    assert_eq!(rider.service.rider_phase(), RiderPhase::Open);

    elapse(30).await;
    assert_eq!(driver.drain(), vec![gone(&rider, "r1", None)]);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_rider_picks_one_of_two_accepts() {
    let harness = Harness::new();
    let mut first = harness.driver().await;
    let mut second = harness.driver().await;
    let mut rider = harness.node(true);

    let request = rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    first.drain();
    second.drain();
    rider.drain();

    first
        .service
        .accept_request(&rider.pubkey, "r1")
        .await
        .unwrap();
    second
        .service
        .accept_request(&rider.pubkey, "r1")
        .await
        .unwrap();
    assert_eq!(
        rider.drain(),
        vec![
            MatchingEvent::DriverAccepted {
                request_id: "r1".to_string(),
                driver_pubkey: first.pubkey.clone(),
            },
            MatchingEvent::DriverAccepted {
                request_id: "r1".to_string(),
                driver_pubkey: second.pubkey.clone(),
            },
        ]
    );

    let taken = rider
        .service
        .confirm_match(&request, &first.pubkey)
        .await
        .unwrap();
    assert_eq!(taken.status, RideStatus::Taken);
    assert_eq!(taken.matched_driver_pubkey.as_deref(), Some(first.pubkey.as_str()));
    assert_eq!(rider.service.rider_phase(), RiderPhase::Taken);

    assert_eq!(first.drain(), vec![gone(&rider, "r1", Some(&first.pubkey))]);
    assert_eq!(second.drain(), vec![gone(&rider, "r1", Some(&first.pubkey))]);

    // Late proposals are no longer surfaced and the heartbeat has stopped.
    second
        .service
        .accept_request(&rider.pubkey, "r1")
        .await
        .unwrap();
    assert!(rider.drain().is_empty());
    assert!(matches!(
        rider.service.cancel_request(&request).await,
        Err(MatchingError::InvalidTransition {
            status: RideStatus::Taken,
            ..
        })
    ));

    elapse(120).await;
    assert!(first.drain().is_empty());
    let stored = harness
        .relay
        .query(&Filter::new().kind(DEFAULT_EVENT_KIND).identifier("r1"));
    assert!(stored.is_empty(), "taken request should expire on the relay");
}

#[tokio::test(start_paused = true)]
async fn scenario_c_cancel_before_any_accept() {
    let harness = Harness::new();
    let mut first = harness.driver().await;
    let mut second = harness.driver().await;
    let rider = harness.node(true);

    let request = rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    first.drain();
    second.drain();

    let cancelled = rider.service.cancel_request(&request).await.unwrap();
    assert_eq!(cancelled.status, RideStatus::Cancelled);
    assert_eq!(rider.service.rider_phase(), RiderPhase::Cancelled);
    assert_eq!(first.drain(), vec![gone(&rider, "r1", None)]);
    assert_eq!(second.drain(), vec![gone(&rider, "r1", None)]);

    elapse(120).await;
    assert!(first.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scenario_d_driver_going_offline_decrements_count_once() {
    let harness = Harness::new();
    let first = harness.driver().await;
    let _second = harness.driver().await;
    let mut rider = harness.node(true);

    rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    assert_eq!(
        rider.drain(),
        vec![
            MatchingEvent::DriverCountChanged(1),
            MatchingEvent::DriverCountChanged(2),
        ]
    );

    first.service.go_offline().await.unwrap();
    assert_eq!(rider.drain(), vec![MatchingEvent::DriverCountChanged(1)]);
    assert_eq!(rider.service.driver_count(), 1);

    // Already offline: stopping publishes nothing new.
    first.service.stop().await.unwrap();
    assert!(rider.drain().is_empty());

    let third = harness.driver().await;
    assert_eq!(rider.drain(), vec![MatchingEvent::DriverCountChanged(2)]);
    third.service.go_offline().await.unwrap();
    third.service.go_online().await.unwrap();
    assert_eq!(
        rider.drain(),
        vec![
            MatchingEvent::DriverCountChanged(1),
            MatchingEvent::DriverCountChanged(2),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn late_driver_sees_open_request_once() {
    let harness = Harness::new();
    let rider = harness.node(true);
    rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL).with_note("two bags"))
        .await
        .unwrap();

    elapse(50).await;
    let mut driver = harness.driver().await;
    let events = driver.drain();
    assert_eq!(events.len(), 1);
    match &events[0] {
        MatchingEvent::RequestAppeared(request) => {
            assert_eq!(request.id, "r1");
            assert_eq!(request.pubkey, rider.pubkey);
            assert_eq!(request.note.as_deref(), Some("two bags"));
        }
        other => panic!("expected appeared, got {other:?}"),
    }

    // Further heartbeats are duplicates of a known open request.
    elapse(100).await;
    assert!(driver.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn finished_requests_are_historical_noise() {
    let harness = Harness::new();
    let rider = harness.node(true);
    let request = rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    rider
        .service
        .confirm_match(&request, "some-driver")
        .await
        .unwrap();

    let mut driver = harness.driver().await;
    assert!(driver.drain().is_empty());
    assert_eq!(driver.service.open_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn lookback_bounds_replayed_history() {
    let harness = Harness::new();
    let legacy = harness.relay.client(Keypair::generate());
    legacy.connect().await.unwrap();
    let content = RideRequest::new("ancient", CELL).to_content().unwrap();
    legacy
        .publish_replaceable(
            DEFAULT_EVENT_KIND,
            "ancient",
            vec![
                vec!["g".to_string(), CELL.to_string()],
                vec!["t".to_string(), "rideshare-request".to_string()],
            ],
            &content,
        )
        .await
        .unwrap();

    elapse(301).await;
    let mut driver = harness.driver().await;
    assert!(driver.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn requests_outside_the_cell_are_not_seen() {
    let harness = Harness::new();
    let mut driver = harness.driver().await;
    let rider = harness.node(true);
    rider
        .service
        .start_as_rider("u4pruy", RideRequest::new("r1", "u4pruy"))
        .await
        .unwrap();
    assert!(driver.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn accepts_for_other_requests_are_filtered() {
    let harness = Harness::new();
    let driver = harness.driver().await;
    let mut rider = harness.node(true);
    rider
        .service
        .start_as_rider(CELL, RideRequest::new("r2", CELL))
        .await
        .unwrap();
    rider.drain();

    driver
        .service
        .accept_request(&rider.pubkey, "r1")
        .await
        .unwrap();
    assert!(rider.drain().is_empty());

    driver
        .service
        .accept_request(&rider.pubkey, "r2")
        .await
        .unwrap();
    assert_eq!(rider.drain().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn accept_is_attributed_to_the_sender() {
    let harness = Harness::new();
    let mut rider = harness.node(true);
    rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    rider.drain();

    let impostor = harness.relay.client(Keypair::generate());
    impostor.connect().await.unwrap();
    let payload = DirectMessage::accept("r1", "someone-else").to_payload().unwrap();
    impostor
        .send_direct_message(&rider.pubkey, &payload)
        .await
        .unwrap();
    impostor
        .send_direct_message(&rider.pubkey, "{\"type\":\"decline\"}")
        .await
        .unwrap();

    assert_eq!(
        rider.drain(),
        vec![MatchingEvent::DriverAccepted {
            request_id: "r1".to_string(),
            driver_pubkey: impostor.public_key(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn accept_transport_failure_is_reported() {
    let harness = Harness::new();
    let driver = harness.driver().await;
    let mut rider = harness.node(true);
    rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    rider.drain();

    harness.relay.set_online(false);
    assert!(matches!(
        driver.service.accept_request(&rider.pubkey, "r1").await,
        Err(MatchingError::Transport(_))
    ));
    harness.relay.set_online(true);
    assert!(rider.drain().is_empty());

    // Nothing was retried behind the caller's back.
    elapse(5).await;
    assert!(rider.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn relay_outage_expires_requests_on_both_sides() {
    let harness = Harness::new();
    let mut driver = harness.driver().await;
    let mut rider = harness.node(true);
    rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    driver.drain();
    rider.drain();

    elapse(10).await;
    harness.relay.set_online(false);
    assert_eq!(
        rider.events.try_recv().ok(),
        Some(MatchingEvent::RelayCountChanged(0))
    );

    // The t=45 heartbeat fails; both sides' timers fire at t=61.
    elapse(52).await;
    assert_eq!(driver.drain(), vec![gone(&rider, "r1", None)]);
    assert_eq!(
        rider.drain(),
        vec![MatchingEvent::RequestExpired {
            request_id: "r1".to_string()
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_tears_everything_down() {
    let harness = Harness::new();
    let mut driver = harness.driver().await;
    let mut rider = harness.node(true);
    rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    driver.drain();
    assert_eq!(rider.drain(), vec![MatchingEvent::DriverCountChanged(1)]);
    assert_eq!(harness.relay.subscription_count(), 3);

    driver.service.stop().await.unwrap();
    assert_eq!(driver.service.role(), None);
    assert_eq!(driver.service.open_request_count(), 0);
    assert_eq!(rider.drain(), vec![MatchingEvent::DriverCountChanged(0)]);
    assert_eq!(harness.relay.subscription_count(), 2);

    // No timer survives the stop.
    elapse(120).await;
    assert!(driver.drain().is_empty());

    rider.service.stop().await.unwrap();
    assert_eq!(rider.service.role(), None);
    assert_eq!(rider.service.rider_phase(), RiderPhase::Idle);
    assert_eq!(harness.relay.subscription_count(), 0);

    // A stopped service can start a new session.
    rider
        .service
        .start_as_rider(CELL, RideRequest::new("r2", CELL))
        .await
        .unwrap();
    assert_eq!(rider.service.role(), Some(Role::Rider));
}

#[tokio::test(start_paused = true)]
async fn rider_stop_leaves_request_to_expire() {
    let harness = Harness::new();
    let rider = harness.node(true);
    rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    rider.service.stop().await.unwrap();

    let filter = Filter::new().kind(DEFAULT_EVENT_KIND).identifier("r1");
    assert_eq!(harness.relay.query(&filter).len(), 1);
    elapse(61).await;
    assert!(harness.relay.query(&filter).is_empty());
}

#[tokio::test(start_paused = true)]
async fn caller_errors_are_reported() {
    let harness = Harness::new();
    let rider = harness.node(true);
    let request = RideRequest::new("r1", CELL);

    assert!(matches!(
        rider.service.refresh_request(&request).await,
        Err(MatchingError::NoActiveRequest)
    ));
    let taken = request
        .apply(&RiderAction::Confirm {
            driver_pubkey: "d1".to_string(),
        })
        .unwrap();
    assert!(matches!(
        rider.service.start_as_rider(CELL, taken).await,
        Err(MatchingError::RequestNotOpen(RideStatus::Taken))
    ));
    assert!(matches!(
        rider.service.start_as_rider("not a cell", request.clone()).await,
        Err(MatchingError::InvalidInput(_))
    ));

    rider
        .service
        .start_as_rider(CELL, request.clone())
        .await
        .unwrap();
    assert!(matches!(
        rider.service.start_as_rider(CELL, RideRequest::new("r2", CELL)).await,
        Err(MatchingError::AlreadyStarted("rider"))
    ));
    assert!(matches!(
        rider.service.confirm_match(&RideRequest::new("r9", CELL), "d1").await,
        Err(MatchingError::NotActiveRequest { .. })
    ));
    assert!(matches!(
        rider.service.accept_request(&rider.pubkey, "r1").await,
        Err(MatchingError::WrongRole("driver"))
    ));
    assert!(matches!(
        rider.service.go_offline().await,
        Err(MatchingError::WrongRole("driver"))
    ));

    let driver = harness.driver().await;
    assert!(matches!(
        driver.service.cancel_request(&request).await,
        Err(MatchingError::WrongRole("rider"))
    ));
    assert!(matches!(
        driver.service.accept_request("", "r1").await,
        Err(MatchingError::InvalidInput(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_start_leaves_service_idle() {
    let harness = Harness::new();
    let rider = harness.node(true);
    harness.relay.set_online(false);

    assert!(matches!(
        rider
            .service
            .start_as_rider(CELL, RideRequest::new("r1", CELL))
            .await,
        Err(MatchingError::Transport(_))
    ));
    assert_eq!(rider.service.role(), None);

    harness.relay.set_online(true);
    rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    assert_eq!(rider.service.rider_phase(), RiderPhase::Open);
}

#[tokio::test(start_paused = true)]
async fn riders_sharing_a_request_id_stay_separate() {
    let harness = Harness::new();
    let mut driver = harness.driver().await;
    let alice = harness.node(true);
    let bob = harness.node(true);

    alice
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    let bobs_request = bob
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    let riders: Vec<String> = driver
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            MatchingEvent::RequestAppeared(request) => Some(request.pubkey),
            _ => None,
        })
        .collect();
    assert_eq!(riders, vec![alice.pubkey.clone(), bob.pubkey.clone()]);
    assert_eq!(driver.service.open_request_count(), 2);

    bob.service.cancel_request(&bobs_request).await.unwrap();
    assert_eq!(driver.drain(), vec![gone(&bob, "r1", None)]);
    assert_eq!(driver.service.open_request_count(), 1);
    assert_eq!(alice.service.rider_phase(), RiderPhase::Open);

    // Alice's request keeps its own deadline and heartbeat.
    elapse(100).await;
    assert!(driver.drain().is_empty());
    assert_eq!(driver.service.open_request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn forged_status_change_is_ignored() {
    let harness = Harness::new();
    let mut driver = harness.driver().await;
    let rider = harness.node(true);
    let request = rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    driver.drain();

    let forger = harness.relay.client(Keypair::generate());
    forger.connect().await.unwrap();
    let forged = request
        .apply(&RiderAction::Confirm {
            driver_pubkey: forger.public_key(),
        })
        .unwrap();
    forger
        .publish_replaceable(
            DEFAULT_EVENT_KIND,
            "r1",
            vec![
                vec!["g".to_string(), CELL.to_string()],
                vec!["t".to_string(), "rideshare-request".to_string()],
                create_expiration_tag(BASE + 60),
            ],
            &forged.to_content().unwrap(),
        )
        .await
        .unwrap();

    assert!(driver.drain().is_empty());
    assert_eq!(driver.service.open_request_count(), 1);

    let taken = rider
        .service
        .confirm_match(&request, &driver.pubkey)
        .await
        .unwrap();
    assert_eq!(taken.status, RideStatus::Taken);
    assert_eq!(driver.drain(), vec![gone(&rider, "r1", Some(&driver.pubkey))]);
}

#[tokio::test(start_paused = true)]
async fn accept_seen_on_two_relays_is_surfaced_once() {
    let harness = Harness::new();
    let driver = harness.driver().await;
    let mut rider = harness.node_on(
        Arc::new(MirroredRelayClient {
            inner: harness.relay.client(Keypair::generate()),
        }),
        true,
    );
    rider
        .service
        .start_as_rider(CELL, RideRequest::new("r1", CELL))
        .await
        .unwrap();
    rider.drain();

    driver
        .service
        .accept_request(&rider.pubkey, "r1")
        .await
        .unwrap();
    assert_eq!(
        rider.drain(),
        vec![MatchingEvent::DriverAccepted {
            request_id: "r1".to_string(),
            driver_pubkey: driver.pubkey.clone(),
        }]
    );

    // A second, distinct accept from the same driver is a new message.
    driver
        .service
        .accept_request(&rider.pubkey, "r1")
        .await
        .unwrap();
    assert_eq!(rider.drain().len(), 1);
}
