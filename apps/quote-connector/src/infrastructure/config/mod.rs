//! Configuration Module
//!
//! Environment-driven configuration for the connector binary.

mod settings;

pub use settings::{
    ConfigError, FeedSettings, QuoteConnectorConfig, ServerSettings, WebSocketSettings,
};
