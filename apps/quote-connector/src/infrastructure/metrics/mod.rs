//! Prometheus Metrics Module
//!
//! Connector instrumentation through the `metrics` facade. Recording is a
//! no-op until a recorder is installed, so the library records
//! unconditionally and the binary decides whether to export.
//!
//! # Metrics Categories
//!
//! - **Frames**: Frames sent and received, malformed frames dropped
//! - **Connections**: Open connections, closes by reason, reconnect attempts
//! - **Errors**: Transport errors, correlation failures

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

// =============================================================================
// Exporter
// =============================================================================

/// Error type for metrics setup.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to install the Prometheus exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

/// Install the Prometheus exporter with an HTTP listener on `addr`.
///
/// Metrics are served at `/metrics`.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or a recorder is already
/// installed.
pub fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    register_metrics();
    tracing::info!(addr = %addr, "Prometheus metrics exporter started");
    Ok(())
}

fn register_metrics() {
    describe_counter!(
        "quote_connector_frames_sent_total",
        "Envelopes written to the transport by message type"
    );
    describe_counter!(
        "quote_connector_frames_received_total",
        "Envelopes decoded from the transport by message type"
    );
    describe_counter!(
        "quote_connector_malformed_frames_total",
        "Inbound frames dropped because they were not valid envelopes"
    );
    describe_counter!(
        "quote_connector_transport_errors_total",
        "Transport errors by kind"
    );
    describe_counter!(
        "quote_connector_closes_total",
        "Connection closes by reason"
    );
    describe_counter!(
        "quote_connector_correlation_failures_total",
        "Market data updates that matched no subscription"
    );
    describe_counter!(
        "quote_connector_reconnects_total",
        "Reconnect attempts made by the supervisor"
    );
    describe_gauge!(
        "quote_connector_open_connections",
        "Connections currently open"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an envelope written to the transport.
pub fn record_frame_sent(message_type: &'static str) {
    counter!("quote_connector_frames_sent_total", "message_type" => message_type).increment(1);
}

/// Record an envelope received from the transport.
pub fn record_frame_received(message_type: &'static str) {
    counter!("quote_connector_frames_received_total", "message_type" => message_type)
        .increment(1);
}

/// Record a dropped malformed frame.
pub fn record_malformed_frame(kind: &'static str) {
    counter!("quote_connector_malformed_frames_total", "kind" => kind).increment(1);
}

/// Record a transport error.
pub fn record_transport_error(kind: &'static str) {
    counter!("quote_connector_transport_errors_total", "kind" => kind).increment(1);
}

/// Record a connection close.
pub fn record_close(reason: &'static str) {
    counter!("quote_connector_closes_total", "reason" => reason).increment(1);
}

/// Record an update that matched no subscription.
pub fn record_correlation_failure() {
    counter!("quote_connector_correlation_failures_total").increment(1);
}

/// Record a reconnect attempt.
pub fn record_reconnect() {
    counter!("quote_connector_reconnects_total").increment(1);
}

/// Adjust the open connection gauge.
pub fn connection_opened() {
    gauge!("quote_connector_open_connections").increment(1.0);
}

/// Adjust the open connection gauge.
pub fn connection_closed() {
    gauge!("quote_connector_open_connections").decrement(1.0);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_sent("subscribeMarketData");
        record_frame_received("marketDataUpdate");
        record_malformed_frame("invalid_json");
        record_transport_error("io");
        record_close("local");
        record_correlation_failure();
        record_reconnect();
        connection_opened();
        connection_closed();
    }
}
