//! Ride protocol payloads.
//!
//! Three message shapes travel over the relay network:
//! - [`RideRequest`]: public, replaceable, owned by the rider
//! - [`DriverAvailability`]: public, replaceable, owned by each driver
//! - [`DirectMessage::Accept`]: encrypted, driver to rider only
//!
//! Every payload is parsed defensively at the relay boundary. Author keys are
//! taken from the signed event, never from the JSON content.

use crate::error::MatchingError;
use crate::geohash::Coordinates;
use nostr::Event;
use nostr::tag_parsing::create_tag;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// NIP-78 application data kind, parameterized replaceable.
pub const DEFAULT_EVENT_KIND: u16 = 30078;

/// `d` tag of a driver's availability event; one per driver key.
pub const AVAILABILITY_KEY: &str = "driver-availability";

/// Why an inbound payload was discarded.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("empty content")]
    Empty,

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// Outcome-level status of a ride request.
///
/// Liveness is carried separately by the event's `expiration` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Open,
    Taken,
    Cancelled,
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Open => "open",
            RideStatus::Taken => "taken",
            RideStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RideStatus::Open)
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RideStatus {
    type Err = MatchingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(RideStatus::Open),
            "taken" => Ok(RideStatus::Taken),
            "cancelled" => Ok(RideStatus::Cancelled),
            _ => Err(MatchingError::InvalidInput(format!("unknown ride status: {s}"))),
        }
    }
}

/// Transitions only the rider may publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiderAction {
    /// Re-publish unchanged content with a fresh expiration.
    Heartbeat,
    Confirm { driver_pubkey: String },
    Cancel,
}

/// Where a rider's own request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiderPhase {
    Idle,
    Open,
    Taken,
    Cancelled,
    /// The request outlived its expiration without a successful heartbeat.
    Expired,
}

impl From<RideStatus> for RiderPhase {
    fn from(status: RideStatus) -> Self {
        match status {
            RideStatus::Open => RiderPhase::Open,
            RideStatus::Taken => RiderPhase::Taken,
            RideStatus::Cancelled => RiderPhase::Cancelled,
        }
    }
}

/// Authoritative, publicly visible state of one ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequest {
    /// Stable for the lifetime of the request; doubles as the `d` tag.
    pub id: String,
    /// Overwritten with the event signer on receipt.
    #[serde(default)]
    pub pubkey: String,
    pub geohash: String,
    pub status: RideStatus,
    #[serde(default)]
    pub matched_driver_pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl RideRequest {
    /// New open request in `geohash`. The author key is filled in on publish.
    pub fn new(id: impl Into<String>, geohash: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pubkey: String::new(),
            geohash: geohash.into(),
            status: RideStatus::Open,
            matched_driver_pubkey: None,
            pickup: None,
            note: None,
        }
    }

    pub fn with_pickup(mut self, pickup: Coordinates) -> Self {
        self.pickup = Some(pickup);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Parse a request event. The signer replaces any `pubkey` in the content.
    pub fn from_event(event: &Event) -> Result<Self, PayloadError> {
        if event.content.trim().is_empty() {
            return Err(PayloadError::Empty);
        }
        let mut request: RideRequest = serde_json::from_str(&event.content)?;
        if request.id.is_empty() {
            return Err(PayloadError::MissingField("id"));
        }
        request.pubkey = event.pubkey.clone();
        Ok(request)
    }

    pub fn to_content(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Pure rider-side transition. Terminal requests accept no action.
    pub fn apply(&self, action: &RiderAction) -> Result<RideRequest, MatchingError> {
        if self.status.is_terminal() {
            return Err(MatchingError::InvalidTransition {
                request_id: self.id.clone(),
                status: self.status,
            });
        }

        match action {
            RiderAction::Heartbeat => Ok(self.clone()),
            RiderAction::Confirm { driver_pubkey } => {
                if driver_pubkey.trim().is_empty() {
                    return Err(MatchingError::InvalidInput(
                        "driver pubkey must not be empty".to_string(),
                    ));
                }
                Ok(RideRequest {
                    status: RideStatus::Taken,
                    matched_driver_pubkey: Some(driver_pubkey.clone()),
                    ..self.clone()
                })
            }
            RiderAction::Cancel => Ok(RideRequest {
                status: RideStatus::Cancelled,
                matched_driver_pubkey: None,
                ..self.clone()
            }),
        }
    }
}

/// A driver announcing presence in a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverAvailability {
    #[serde(default)]
    pub pubkey: String,
    pub geohash: String,
    pub location: Coordinates,
}

impl DriverAvailability {
    pub fn new(geohash: impl Into<String>, location: Coordinates) -> Self {
        Self {
            pubkey: String::new(),
            geohash: geohash.into(),
            location,
        }
    }

    /// `Ok(None)` for an empty (offline) body.
    pub fn from_event(event: &Event) -> Result<Option<Self>, PayloadError> {
        if event.content.trim().is_empty() {
            return Ok(None);
        }
        let mut availability: DriverAvailability = serde_json::from_str(&event.content)?;
        availability.pubkey = event.pubkey.clone();
        Ok(Some(availability))
    }

    pub fn to_content(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Body of the accept proposal a driver sends to a rider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptMessage {
    pub request_id: String,
    pub driver_pubkey: String,
}

/// The encrypted point-to-point messages of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DirectMessage {
    #[serde(rename = "accept")]
    Accept(AcceptMessage),
}

impl DirectMessage {
    pub fn accept(request_id: impl Into<String>, driver_pubkey: impl Into<String>) -> Self {
        DirectMessage::Accept(AcceptMessage {
            request_id: request_id.into(),
            driver_pubkey: driver_pubkey.into(),
        })
    }

    pub fn parse(payload: &str) -> Result<Self, PayloadError> {
        if payload.trim().is_empty() {
            return Err(PayloadError::Empty);
        }
        Ok(serde_json::from_str(payload)?)
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub fn create_geohash_tag(geohash: &str) -> Vec<String> {
    create_tag("g", geohash)
}

pub fn create_topic_tag(topic: &str) -> Vec<String> {
    create_tag("t", topic)
}
