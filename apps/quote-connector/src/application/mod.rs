//! Application Layer - Use cases and port definitions.
//!
//! This layer defines the transport port that infrastructure adapters
//! implement. It depends on nothing outside the domain.

/// Port interfaces for external systems (transport).
pub mod ports;
