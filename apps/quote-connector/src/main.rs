//! Quote Connector Binary
//!
//! Connects to a quote feed, subscribes the configured instruments and logs
//! every update until shut down.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin quote-connector
//! ```
//!
//! # Environment Variables
//!
//! - `QUOTE_CONNECTOR_ENDPOINT`: Feed endpoint (default: ws://127.0.0.1:3000/ws/)
//! - `QUOTE_CONNECTOR_INSTRUMENTS`: Comma separated instruments (default: usd_rub)
//! - `QUOTE_CONNECTOR_CONNECT_TIMEOUT_MS`: Connect timeout (default: 10000)
//! - `QUOTE_CONNECTOR_EVENT_CAPACITY`: Event stream capacity (default: 1024)
//! - `QUOTE_CONNECTOR_RECONNECT_DELAY_INITIAL_MS`: First backoff delay (default: 500)
//! - `QUOTE_CONNECTOR_RECONNECT_DELAY_MAX_SECS`: Backoff cap (default: 30)
//! - `QUOTE_CONNECTOR_RECONNECT_DELAY_MULTIPLIER`: Backoff growth (default: 2.0)
//! - `QUOTE_CONNECTOR_MAX_RECONNECT_ATTEMPTS`: 0 = unlimited (default: 0)
//! - `QUOTE_CONNECTOR_METRICS_PORT`: Prometheus port, 0 = disabled (default: 0)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: quote-connector)
//! - `RUST_LOG`: Log filter (default: info)

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use quote_connector::domain::subscription::Correlation;
use quote_connector::infrastructure::connector::CloseEvent;
use quote_connector::infrastructure::protocol::{
    ErrorInfo, ExecutionReport, MarketDataUpdate, SuccessInfo,
};
use quote_connector::{
    Connector, CorrelationError, FeedHandler, MarketDataFeed, QuoteConnectorConfig,
    WebSocketTransport, init_metrics, init_telemetry, run_with_reconnect,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Already installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    let _telemetry_guard = init_telemetry().context("failed to initialize telemetry")?;

    tracing::info!("Starting Quote Connector");

    let config = QuoteConnectorConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    if config.server.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.metrics_port));
        init_metrics(addr).context("failed to start metrics exporter")?;
    }

    let connector = Arc::new(Connector::new(
        Arc::new(WebSocketTransport::new()),
        config.connector_config(),
    ));
    let feed = MarketDataFeed::new(connector, Arc::new(LoggingHandler));

    for instrument in &config.feed.instruments {
        let outcome = feed
            .subscribe(*instrument)
            .with_context(|| format!("failed to subscribe {instrument}"))?;
        tracing::debug!(%instrument, ?outcome, "Subscription registered");
    }

    let shutdown_token = CancellationToken::new();
    tokio::spawn(await_shutdown(shutdown_token.clone()));

    run_with_reconnect(
        &feed,
        &config.feed.endpoint,
        config.reconnect_config(),
        shutdown_token,
    )
    .await
    .context("feed supervision failed")?;

    tracing::info!(stats = ?feed.connector().stats(), "Quote Connector stopped");
    Ok(())
}

/// Logs every feed callback.
struct LoggingHandler;

impl FeedHandler for LoggingHandler {
    fn on_market_data(&self, update: &MarketDataUpdate, correlation: &Correlation) {
        match update.best() {
            Some(best) => tracing::info!(
                instrument = %update.instrument,
                subscription_id = %correlation.subscription_id(),
                bid = %best.bid,
                offer = %best.offer,
                levels = update.quotes.len(),
                "Quote"
            ),
            None => tracing::info!(
                instrument = %update.instrument,
                subscription_id = %correlation.subscription_id(),
                "Empty quote update"
            ),
        }
    }

    fn on_execution_report(&self, report: &ExecutionReport) {
        tracing::info!(order_id = %report.order_id, status = ?report.order_status, "Order update");
    }

    fn on_success(&self, info: &SuccessInfo) {
        tracing::info!(message = %info.message, "Feed acknowledged");
    }

    fn on_feed_error(&self, info: &ErrorInfo) {
        tracing::error!(reason = %info.reason, "Feed error");
    }

    fn on_correlation_failure(&self, update: &MarketDataUpdate, error: &CorrelationError) {
        tracing::debug!(instrument = %update.instrument, error = %error, "Update ignored");
    }

    fn on_disconnected(&self, event: &CloseEvent) {
        tracing::warn!(connection = %event.connection, reason = %event.reason, "Feed disconnected");
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &QuoteConnectorConfig) {
    let instruments: Vec<_> = config.feed.instruments.iter().map(|i| i.as_str()).collect();
    tracing::info!(
        endpoint = %config.feed.endpoint,
        instruments = ?instruments,
        metrics_port = config.server.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(websocket = ?config.websocket, "Connection settings");
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }

    shutdown_token.cancel();
}
