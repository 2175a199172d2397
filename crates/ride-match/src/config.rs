//! Environment configuration.

use std::env;
use std::time::Duration;

use nostr::Keypair;
use thiserror::Error;

use crate::geohash::{DEFAULT_PRECISION, MAX_PRECISION};
use crate::model::DEFAULT_EVENT_KIND;

pub const DEFAULT_REQUEST_TOPIC: &str = "rideshare-request";
pub const DEFAULT_DRIVER_TOPIC: &str = "rideshare-driver";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid RIDE_MATCH_REQUEST_TTL_SECS: {0}")]
    InvalidRequestTtl(String),
    #[error("invalid RIDE_MATCH_HEARTBEAT_SECS: {0}")]
    InvalidHeartbeatInterval(String),
    #[error("invalid RIDE_MATCH_LOOKBACK_SECS: {0}")]
    InvalidLookback(String),
    #[error("invalid RIDE_MATCH_GEOHASH_PRECISION: {0}")]
    InvalidGeohashPrecision(String),
    #[error("invalid RIDE_MATCH_EVENT_KIND: {0}")]
    InvalidEventKind(String),
    #[error("invalid RIDE_MATCH_REQUEST_TOPIC: {0}")]
    InvalidRequestTopic(String),
    #[error("invalid RIDE_MATCH_DRIVER_TOPIC: {0}")]
    InvalidDriverTopic(String),
    #[error("invalid RIDE_MATCH_AUTO_HEARTBEAT: {0}")]
    InvalidAutoHeartbeat(String),
    #[error("invalid RIDE_MATCH_RELAYS: {0}")]
    InvalidRelays(String),
    #[error("invalid RIDE_MATCH_SECRET_KEY: {0}")]
    InvalidSecretKey(String),
}

/// Protocol timing and tagging parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchingConfig {
    /// Lifetime of a published ride request without a heartbeat.
    pub request_ttl: Duration,
    /// Interval between heartbeats; always shorter than `request_ttl`.
    pub heartbeat_interval: Duration,
    /// How far back a new driver subscription replays.
    pub lookback: Duration,
    pub geohash_precision: usize,
    pub event_kind: u16,
    pub request_topic: String,
    pub driver_topic: String,
    /// Run heartbeats from a background task while a request is open.
    pub auto_heartbeat: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            request_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(45),
            lookback: Duration::from_secs(300),
            geohash_precision: DEFAULT_PRECISION,
            event_kind: DEFAULT_EVENT_KIND,
            request_topic: DEFAULT_REQUEST_TOPIC.to_string(),
            driver_topic: DEFAULT_DRIVER_TOPIC.to_string(),
            auto_heartbeat: true,
        }
    }
}

impl MatchingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let request_ttl = parse_with_lookup(
            &lookup,
            "RIDE_MATCH_REQUEST_TTL_SECS",
            defaults.request_ttl,
            |raw| parse_secs(&raw, 1).map_err(ConfigError::InvalidRequestTtl),
        )?;
        let heartbeat_interval = parse_with_lookup(
            &lookup,
            "RIDE_MATCH_HEARTBEAT_SECS",
            defaults.heartbeat_interval,
            |raw| parse_secs(&raw, 1).map_err(ConfigError::InvalidHeartbeatInterval),
        )?;
        if heartbeat_interval >= request_ttl {
            return Err(ConfigError::InvalidHeartbeatInterval(format!(
                "{}s must be shorter than the {}s request ttl",
                heartbeat_interval.as_secs(),
                request_ttl.as_secs()
            )));
        }
        let lookback = parse_with_lookup(
            &lookup,
            "RIDE_MATCH_LOOKBACK_SECS",
            defaults.lookback,
            |raw| parse_secs(&raw, 0).map_err(ConfigError::InvalidLookback),
        )?;
        let geohash_precision = parse_with_lookup(
            &lookup,
            "RIDE_MATCH_GEOHASH_PRECISION",
            defaults.geohash_precision,
            |raw| {
                let precision = raw
                    .trim()
                    .parse::<usize>()
                    .map_err(|error| ConfigError::InvalidGeohashPrecision(error.to_string()))?;
                if !(1..=MAX_PRECISION).contains(&precision) {
                    return Err(ConfigError::InvalidGeohashPrecision(format!(
                        "{precision} is outside 1..={MAX_PRECISION}"
                    )));
                }
                Ok(precision)
            },
        )?;
        let event_kind = parse_with_lookup(
            &lookup,
            "RIDE_MATCH_EVENT_KIND",
            defaults.event_kind,
            |raw| {
                let kind = raw
                    .trim()
                    .parse::<u16>()
                    .map_err(|error| ConfigError::InvalidEventKind(error.to_string()))?;
                if !(30_000..40_000).contains(&kind) {
                    return Err(ConfigError::InvalidEventKind(format!(
                        "{kind} is not a parameterized replaceable kind"
                    )));
                }
                Ok(kind)
            },
        )?;
        let request_topic = parse_with_lookup(
            &lookup,
            "RIDE_MATCH_REQUEST_TOPIC",
            defaults.request_topic,
            |raw| parse_topic(&raw).map_err(ConfigError::InvalidRequestTopic),
        )?;
        let driver_topic = parse_with_lookup(
            &lookup,
            "RIDE_MATCH_DRIVER_TOPIC",
            defaults.driver_topic,
            |raw| parse_topic(&raw).map_err(ConfigError::InvalidDriverTopic),
        )?;
        let auto_heartbeat = parse_with_lookup(
            &lookup,
            "RIDE_MATCH_AUTO_HEARTBEAT",
            defaults.auto_heartbeat,
            |raw| parse_bool(&raw).map_err(ConfigError::InvalidAutoHeartbeat),
        )?;

        Ok(Self {
            request_ttl,
            heartbeat_interval,
            lookback,
            geohash_precision,
            event_kind,
            request_topic,
            driver_topic,
            auto_heartbeat,
        })
    }
}

/// Settings for a standalone node talking to real relays.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub relays: Vec<String>,
    pub keypair: Keypair,
    pub matching: MatchingConfig,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let relays = lookup("RIDE_MATCH_RELAYS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        if relays.is_empty() {
            return Err(ConfigError::InvalidRelays(
                "at least one relay url is required".to_string(),
            ));
        }
        if let Some(bad) = relays
            .iter()
            .find(|url| !(url.starts_with("ws://") || url.starts_with("wss://")))
        {
            return Err(ConfigError::InvalidRelays(format!(
                "{bad} is not a websocket url"
            )));
        }

        let secret = lookup("RIDE_MATCH_SECRET_KEY").unwrap_or_default();
        let keypair = if secret.trim().is_empty() {
            Keypair::generate()
        } else {
            Keypair::parse(&secret).map_err(|error| ConfigError::InvalidSecretKey(error.to_string()))?
        };

        Ok(Self {
            relays,
            keypair,
            matching: MatchingConfig::from_lookup(lookup)?,
        })
    }
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_secs(raw: &str, min: u64) -> Result<Duration, String> {
    let secs = raw.trim().parse::<u64>().map_err(|error| error.to_string())?;
    if secs < min {
        return Err(format!("must be at least {min}"));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_topic(raw: &str) -> Result<String, String> {
    let topic = raw.trim();
    if topic.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    Ok(topic.to_string())
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{ConfigError, MatchingConfig, NodeConfig};

    fn lookup<'a>(values: &'a HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + 'a {
        |key| values.get(key).map(ToString::to_string)
    }

    #[test]
    fn defaults_apply_when_unset() {
        let values = HashMap::new();
        let config = MatchingConfig::from_lookup(lookup(&values)).expect("defaults");
        assert_eq!(config, MatchingConfig::default());
        assert_eq!(config.request_ttl.as_secs(), 60);
        assert_eq!(config.heartbeat_interval.as_secs(), 45);
        assert_eq!(config.lookback.as_secs(), 300);
        assert_eq!(config.geohash_precision, 6);
        assert_eq!(config.event_kind, 30078);
        assert!(config.auto_heartbeat);
    }

    #[test]
    fn overrides_are_parsed() {
        let values = HashMap::from([
            ("RIDE_MATCH_REQUEST_TTL_SECS", "120"),
            ("RIDE_MATCH_HEARTBEAT_SECS", "90"),
            ("RIDE_MATCH_LOOKBACK_SECS", "0"),
            ("RIDE_MATCH_GEOHASH_PRECISION", "5"),
            ("RIDE_MATCH_EVENT_KIND", "30079"),
            ("RIDE_MATCH_REQUEST_TOPIC", " taxi-request "),
            ("RIDE_MATCH_AUTO_HEARTBEAT", "off"),
        ]);
        let config = MatchingConfig::from_lookup(lookup(&values)).expect("overrides");
        assert_eq!(config.request_ttl.as_secs(), 120);
        assert_eq!(config.heartbeat_interval.as_secs(), 90);
        assert_eq!(config.lookback.as_secs(), 0);
        assert_eq!(config.geohash_precision, 5);
        assert_eq!(config.event_kind, 30079);
        assert_eq!(config.request_topic, "taxi-request");
        assert_eq!(config.driver_topic, "rideshare-driver");
        assert!(!config.auto_heartbeat);
    }

    #[test]
    fn heartbeat_must_be_shorter_than_ttl() {
        let values = HashMap::from([("RIDE_MATCH_HEARTBEAT_SECS", "60")]);
        let error = MatchingConfig::from_lookup(lookup(&values)).expect_err("heartbeat == ttl");
        assert!(matches!(error, ConfigError::InvalidHeartbeatInterval(_)));
    }

    #[test]
    fn rejects_out_of_range_values() {
        for (key, value) in [
            ("RIDE_MATCH_GEOHASH_PRECISION", "13"),
            ("RIDE_MATCH_GEOHASH_PRECISION", "0"),
            ("RIDE_MATCH_EVENT_KIND", "1"),
            ("RIDE_MATCH_REQUEST_TTL_SECS", "sixty"),
            ("RIDE_MATCH_DRIVER_TOPIC", "  "),
            ("RIDE_MATCH_AUTO_HEARTBEAT", "maybe"),
        ] {
            let values = HashMap::from([(key, value)]);
            assert!(
                MatchingConfig::from_lookup(lookup(&values)).is_err(),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn node_config_requires_websocket_relays() {
        let values = HashMap::new();
        assert!(matches!(
            NodeConfig::from_lookup(lookup(&values)),
            Err(ConfigError::InvalidRelays(_))
        ));

        let values = HashMap::from([("RIDE_MATCH_RELAYS", "https://relay.example")]);
        assert!(matches!(
            NodeConfig::from_lookup(lookup(&values)),
            Err(ConfigError::InvalidRelays(_))
        ));
    }

    #[test]
    fn node_config_parses_relays_and_key() {
        let secret = "7f7ff03d123792d6ac594bfa67bf6d0c0ab55b6b1fdb6249303fe861f1ccba9a";
        let values = HashMap::from([
            ("RIDE_MATCH_RELAYS", "wss://relay.one, ,ws://localhost:7000"),
            ("RIDE_MATCH_SECRET_KEY", secret),
        ]);
        let config = NodeConfig::from_lookup(lookup(&values)).expect("node config");
        assert_eq!(config.relays, vec!["wss://relay.one", "ws://localhost:7000"]);
        assert_eq!(config.keypair.private_key_hex(), secret);

        let values = HashMap::from([
            ("RIDE_MATCH_RELAYS", "wss://relay.one"),
            ("RIDE_MATCH_SECRET_KEY", "not-a-key"),
        ]);
        assert!(matches!(
            NodeConfig::from_lookup(lookup(&values)),
            Err(ConfigError::InvalidSecretKey(_))
        ));
    }

    #[test]
    fn node_config_generates_key_when_absent() {
        let values = HashMap::from([("RIDE_MATCH_RELAYS", "wss://relay.one")]);
        let config = NodeConfig::from_lookup(lookup(&values)).expect("node config");
        assert_eq!(config.keypair.public_key_hex().len(), 64);
    }
}
