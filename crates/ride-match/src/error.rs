//! Matching service error types.

use thiserror::Error;

use crate::model::RideStatus;

#[derive(Debug, Error)]
pub enum MatchingError {
    /// The relay network could not carry a publish, subscribe or direct message.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no active ride request")]
    NoActiveRequest,

    #[error("request {expected} is the active request, got {actual}")]
    NotActiveRequest { expected: String, actual: String },

    #[error("ride request must be open to start a session, got {0}")]
    RequestNotOpen(RideStatus),

    #[error("request {request_id} is already {status}")]
    InvalidTransition {
        request_id: String,
        status: RideStatus,
    },

    #[error("request {0} expired without a heartbeat")]
    RequestExpired(String),

    #[error("operation requires the {0} role")]
    WrongRole(&'static str),

    #[error("a session is already running as {0}")]
    AlreadyStarted(&'static str),

    #[error("session state lock poisoned")]
    StatePoisoned,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("signing error: {0}")]
    Signing(#[from] nostr::Nip01Error),

    #[error("encryption error: {0}")]
    Encryption(#[from] nostr::Nip04Error),
}

impl From<nostr_client::ClientError> for MatchingError {
    fn from(error: nostr_client::ClientError) -> Self {
        Self::Transport(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MatchingError>;
