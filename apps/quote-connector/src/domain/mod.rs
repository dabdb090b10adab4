//! Domain Layer - Core feed types and business rules.
//!
//! This layer contains the market data vocabulary, the connection lifecycle
//! state machine and subscription correlation. Nothing here performs I/O.

/// Instruments, quotes and order vocabulary.
pub mod market_data;

/// Connection lifecycle state machine.
pub mod connection;

/// Subscription tracking and update correlation.
pub mod subscription;
