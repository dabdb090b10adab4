#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Quote Connector - Market Data Feed Client
//!
//! Client-side connector for a real-time quote feed carried over a
//! WebSocket. Every message travels in a `{ messageType, message }`
//! envelope; prices and amounts are exact decimals end to end.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Feed vocabulary and rules, no I/O
//!   - `market_data`: Instruments, quotes, order vocabulary
//!   - `connection`: Connection ids and the lifecycle state machine
//!   - `subscription`: Subscription coalescing and update correlation
//!
//! - **Application**: Port definitions
//!   - `ports`: The transport interface
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `protocol`: Message catalog and JSON envelope codec
//!   - `connector`: Connection lifecycle, observers, reconnect backoff
//!   - `feed`: Typed market data feed, reconnect supervisor
//!   - `websocket`: tokio-tungstenite transport
//!   - `memory`: In-process feed server for tests and simulations
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                  send                 Write(text)
//! MarketDataFeed ───────► Connector ───────────────► Transport ──► feed
//!       ▲                     │
//!       │  on_market_data     │ decode + dispatch    Frame(text)
//!  FeedHandler ◄──────────────┴◄──────────────────── Transport ◄── feed
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Feed types with no I/O.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionId, ConnectionState};
pub use domain::market_data::{Instrument, OrderSide, OrderStatus, Quote, SubscriptionId};
pub use domain::subscription::{Correlation, CorrelationError, SubscriptionRegistry};

// Transport port
pub use application::ports::{CloseReason, Transport, TransportError};

// Feed service
pub use infrastructure::feed::{
    FeedError, FeedHandler, MarketDataFeed, SubscribeOutcome, UnsubscribeOutcome,
    run_with_reconnect,
};

// Connector
pub use infrastructure::connector::reconnect::{ReconnectConfig, ReconnectPolicy};
pub use infrastructure::connector::{
    CloseEvent, ConnectError, Connector, ConnectorConfig, ConnectorEvent, ConnectorHandle,
    SendError,
};

// Protocol
pub use infrastructure::protocol::{ClientEnvelope, JsonCodec, MalformedEnvelope, ServerEnvelope};

// Transports
pub use infrastructure::memory::{MemoryFeedServer, MemoryTransport};
pub use infrastructure::websocket::WebSocketTransport;

// Configuration
pub use infrastructure::config::{ConfigError, QuoteConnectorConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
