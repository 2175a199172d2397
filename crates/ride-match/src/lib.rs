//! Decentralized ride matching over a Nostr relay network.
//!
//! A rider publishes a replaceable, expiring ride request scoped to a
//! geohash cell and keeps it alive with heartbeats. Drivers in the same cell
//! watch requests and propose with an encrypted accept message; the rider
//! alone publishes the outcome.
//!
//! - [`geohash`]: cell encoding and decoding
//! - [`model`]: protocol payloads and the rider transition function
//! - [`classify`]: idempotent folding of inbound events
//! - [`relay`]: the network capability the service consumes; the
//!   `test-util` feature adds an in-process relay in `memory`
//! - [`service`]: the session engine

pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod geohash;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod model;
pub mod relay;
pub mod service;
pub mod transport;

pub use classify::{DriverRoster, IgnoreReason, RequestKey, RequestObservation, RequestTracker};
pub use clock::{Clock, SystemClock, TokioClock};
pub use config::{ConfigError, MatchingConfig, NodeConfig};
pub use error::{MatchingError, Result};
pub use geohash::{BoundingBox, Coordinates};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryRelay, MemoryRelayClient};
pub use model::{
    AcceptMessage, DirectMessage, DriverAvailability, PayloadError, RideRequest, RideStatus,
    RiderAction, RiderPhase,
};
pub use relay::{DirectMessageCallback, EventRelayClient, IncomingMessage, RelayEventCallback};
pub use service::{MatchingCallback, MatchingEvent, RideMatchingService, Role, ServiceBuilder};
pub use transport::NostrRelayClient;
