//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the connector, the typed feed built on it, the wire
//! protocol, and the concrete implementations of the transport port.

/// Feed message catalog and JSON envelope codec.
pub mod protocol;

/// Connection lifecycle, observers and reconnect backoff.
pub mod connector;

/// Typed market data feed and reconnect supervisor.
pub mod feed;

/// WebSocket transport adapter.
pub mod websocket;

/// In-process feed server and transport.
pub mod memory;

/// Configuration loaded from the environment.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing subscriber and OpenTelemetry integration.
pub mod telemetry;
