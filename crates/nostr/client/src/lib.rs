//! Minimal Nostr relay client transport.
//!
//! This crate intentionally exposes a small surface:
//! - relay publish/subscribe over WebSocket, with `OK` acknowledgement
//! - multi-relay pool fanout and connected-relay counting
//! - subscription filters that can also be evaluated in-process

pub mod error;
pub mod pool;
pub mod relay;
pub mod subscription;

pub use error::{ClientError, Result};
pub use pool::{PoolConfig, RelayCountCallback, RelayPool};
pub use relay::{
    ConnectionState, PublishConfirmation, RelayConfig, RelayConnection, RelayMessage,
    StateCallback, parse_relay_message,
};
pub use subscription::{EventCallback, Filter, Subscription};
