//! Connector Configuration Settings
//!
//! Configuration types for the connector binary, loaded from environment
//! variables. Unset or unparsable numeric values fall back to defaults.

use std::time::Duration;

use crate::domain::market_data::Instrument;
use crate::infrastructure::connector::ConnectorConfig;
use crate::infrastructure::connector::reconnect::ReconnectConfig;

/// Feed endpoint and subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSettings {
    /// WebSocket endpoint of the feed.
    pub endpoint: String,
    /// Instruments to subscribe on startup.
    pub instruments: Vec<Instrument>,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:3000/ws/".to_string(),
            instruments: vec![Instrument::UsdRub],
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketSettings {
    /// Time allowed for the connection to open.
    pub connect_timeout: Duration,
    /// Capacity of the connector event stream.
    pub event_capacity: usize,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            event_capacity: 1024,
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerSettings {
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

/// Complete connector configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuoteConnectorConfig {
    /// Feed endpoint and subscriptions.
    pub feed: FeedSettings,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl QuoteConnectorConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is empty or an instrument name is not
    /// recognised.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`QuoteConnectorConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let feed_defaults = FeedSettings::default();

        let endpoint = match lookup("QUOTE_CONNECTOR_ENDPOINT") {
            Some(value) if value.trim().is_empty() => {
                return Err(ConfigError::EmptyValue("QUOTE_CONNECTOR_ENDPOINT".to_string()));
            }
            Some(value) => value.trim().to_string(),
            None => feed_defaults.endpoint,
        };

        let instruments = match lookup("QUOTE_CONNECTOR_INSTRUMENTS") {
            Some(value) => parse_instruments(&value)?,
            None => feed_defaults.instruments,
        };

        let defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            connect_timeout: parse_env_duration_millis(
                &lookup,
                "QUOTE_CONNECTOR_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout,
            ),
            event_capacity: parse_env(
                &lookup,
                "QUOTE_CONNECTOR_EVENT_CAPACITY",
                defaults.event_capacity,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                &lookup,
                "QUOTE_CONNECTOR_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                &lookup,
                "QUOTE_CONNECTOR_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env(
                &lookup,
                "QUOTE_CONNECTOR_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_env(
                &lookup,
                "QUOTE_CONNECTOR_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
        };

        let server = ServerSettings {
            metrics_port: parse_env(
                &lookup,
                "QUOTE_CONNECTOR_METRICS_PORT",
                ServerSettings::default().metrics_port,
            ),
        };

        Ok(Self {
            feed: FeedSettings {
                endpoint,
                instruments,
            },
            websocket,
            server,
        })
    }

    /// Connector settings derived from this configuration.
    #[must_use]
    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            connect_timeout: self.websocket.connect_timeout,
            event_capacity: self.websocket.event_capacity,
        }
    }

    /// Backoff settings derived from this configuration.
    #[must_use]
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: self.websocket.reconnect_delay_initial,
            max_delay: self.websocket.reconnect_delay_max,
            multiplier: self.websocket.reconnect_delay_multiplier,
            max_attempts: self.websocket.max_reconnect_attempts,
            ..ReconnectConfig::default()
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Instrument list names an unknown instrument.
    #[error("unknown instrument in QUOTE_CONNECTOR_INSTRUMENTS: {0}")]
    InvalidInstrument(String),
}

fn parse_instruments(value: &str) -> Result<Vec<Instrument>, ConfigError> {
    let mut instruments = Vec::new();
    for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let instrument = name
            .parse::<Instrument>()
            .map_err(|_| ConfigError::InvalidInstrument(name.to_string()))?;
        if !instruments.contains(&instrument) {
            instruments.push(instrument);
        }
    }

    if instruments.is_empty() {
        return Err(ConfigError::EmptyValue("QUOTE_CONNECTOR_INSTRUMENTS".to_string()));
    }
    Ok(instruments)
}

fn parse_env<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
