//! Reconnect Supervisor
//!
//! Keeps a [`MarketDataFeed`] connected. The connector itself never
//! reconnects; this loop watches its event stream and, after any close that
//! was not requested locally, waits out the backoff delay and connects again.
//! Each reconnect creates a new connection entity, and the feed replays its
//! subscriptions when that entity opens.

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::market_data::MarketDataFeed;
use crate::application::ports::CloseReason;
use crate::infrastructure::connector::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::infrastructure::connector::{ConnectError, ConnectorEvent};
use crate::infrastructure::metrics;

/// Errors that end the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The connector refused to connect.
    #[error("failed to start connection: {0}")]
    Connect(#[from] ConnectError),

    /// The backoff policy ran out of attempts.
    #[error("gave up after {attempts} reconnect attempts")]
    MaxReconnectAttemptsExceeded {
        /// Attempts made.
        attempts: u32,
    },

    /// The connector's event stream ended.
    #[error("connector event stream closed")]
    EventStreamClosed,
}

/// Connect `feed` to `endpoint` and keep it connected until `cancel` fires
/// or the connection is closed locally.
///
/// # Errors
///
/// Returns [`FeedError::MaxReconnectAttemptsExceeded`] when the backoff
/// policy gives up, and [`FeedError::Connect`] if the connector already has
/// an active connection when supervision starts.
pub async fn run_with_reconnect(
    feed: &MarketDataFeed,
    endpoint: &str,
    config: ReconnectConfig,
    cancel: CancellationToken,
) -> Result<(), FeedError> {
    let connector = feed.connector();
    let mut events = connector.events();
    let mut policy = ReconnectPolicy::new(config);

    connector.connect(endpoint)?;

    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                connector.close();
                return Ok(());
            }
            event = events.recv() => event,
        };

        let reason = match event {
            Ok(ConnectorEvent::Opened(connection)) => {
                if policy.attempt_count() > 0 {
                    tracing::info!(
                        connection = %connection,
                        attempts = policy.attempt_count(),
                        "Reconnected"
                    );
                }
                policy.reset();
                continue;
            }
            Ok(ConnectorEvent::Closed(event)) => {
                // A close can surface late after a lag already triggered a reconnect.
                if connector
                    .connection_id()
                    .is_some_and(|current| current != event.connection)
                {
                    tracing::debug!(connection = %event.connection, "Ignoring stale close");
                    continue;
                }
                event.reason
            }
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Supervisor lagged behind connector events");
                if connector.state().is_active() {
                    continue;
                }
                CloseReason::Dropped
            }
            Err(RecvError::Closed) => return Err(FeedError::EventStreamClosed),
        };

        if reason.is_local() {
            tracing::info!("Connection closed locally, supervisor stopping");
            return Ok(());
        }

        let Some(delay) = policy.next_delay() else {
            tracing::error!(attempts = policy.attempt_count(), "Giving up on reconnecting");
            return Err(FeedError::MaxReconnectAttemptsExceeded {
                attempts: policy.attempt_count(),
            });
        };

        metrics::record_reconnect();
        #[allow(clippy::cast_possible_truncation)]
        let delay_ms = delay.as_millis() as u64;
        tracing::info!(
            attempt = policy.attempt_count(),
            delay_ms,
            reason = %reason,
            "Reconnecting"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(delay) => {}
        }

        match connector.connect(endpoint) {
            Ok(_) => {}
            Err(ConnectError::AlreadyActive(state)) => {
                tracing::debug!(%state, "Connection already active, skipping reconnect");
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::infrastructure::feed::{FeedHandler, SubscribeOutcome};
    use crate::domain::connection::ConnectionState;
    use crate::domain::market_data::Instrument;
    use crate::domain::subscription::Correlation;
    use crate::infrastructure::connector::{Connector, ConnectorConfig};
    use crate::infrastructure::memory::MemoryFeedServer;
    use crate::infrastructure::protocol::{
        ClientEnvelope, MarketDataUpdate, ServerEnvelope, SuccessInfo,
    };

    const ENDPOINT: &str = "memory://feed";

    struct Quiet;

    impl FeedHandler for Quiet {
        fn on_market_data(&self, _update: &MarketDataUpdate, _correlation: &Correlation) {}
    }

    fn fast_backoff(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    fn setup() -> (MemoryFeedServer, Arc<MarketDataFeed>) {
        setup_with(ConnectorConfig::default())
    }

    fn setup_with(config: ConnectorConfig) -> (MemoryFeedServer, Arc<MarketDataFeed>) {
        let server = MemoryFeedServer::new(ENDPOINT);
        let connector = Arc::new(Connector::new(Arc::new(server.transport()), config));
        let feed = Arc::new(MarketDataFeed::new(connector, Arc::new(Quiet)));
        (server, feed)
    }

    async fn within<F: std::future::Future>(future: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(2), future)
            .await
            .expect("timed out")
    }

    #[tokio::test]
    async fn reconnects_and_replays_after_drop() {
        let (server, feed) = setup();
        assert_eq!(
            feed.subscribe(Instrument::UsdRub).unwrap(),
            SubscribeOutcome::Deferred
        );

        let cancel = CancellationToken::new();
        let supervisor = {
            let feed = Arc::clone(&feed);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_with_reconnect(&feed, ENDPOINT, fast_backoff(0), cancel).await
            })
        };

        within(server.wait_for_frames(1)).await;
        let first = feed.connector().connection_id();

        server.drop_clients();
        let frames = within(server.wait_for_frames(2)).await;
        assert_eq!(frames[0], frames[1]);
        assert_eq!(
            server.received_envelopes()[1],
            ClientEnvelope::subscribe(Instrument::UsdRub)
        );
        assert_ne!(feed.connector().connection_id(), first);

        cancel.cancel();
        assert!(within(supervisor).await.unwrap().is_ok());
        assert_eq!(feed.connector().state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (server, feed) = setup();
        server.set_refuse_connections(true);

        let result = within(run_with_reconnect(
            &feed,
            ENDPOINT,
            fast_backoff(2),
            CancellationToken::new(),
        ))
        .await;

        assert!(matches!(
            result,
            Err(FeedError::MaxReconnectAttemptsExceeded { attempts: 2 })
        ));
        assert_eq!(feed.connector().stats().connections, 3);
    }

    #[tokio::test]
    async fn local_close_stops_supervision() {
        let (server, feed) = setup();
        let supervisor = {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move {
                run_with_reconnect(&feed, ENDPOINT, fast_backoff(0), CancellationToken::new()).await
            })
        };

        within(server.wait_for_clients(1)).await;
        while !feed.connector().is_open() {
            tokio::task::yield_now().await;
        }
        assert!(feed.connector().close());

        assert!(within(supervisor).await.unwrap().is_ok());
        assert_eq!(feed.connector().stats().connections, 1);
    }

    #[tokio::test]
    async fn lagged_events_after_drop_still_reconnect() {
        let (server, feed) = setup_with(ConnectorConfig {
            event_capacity: 1,
            ..ConnectorConfig::default()
        });
        let cancel = CancellationToken::new();
        let supervisor = {
            let feed = Arc::clone(&feed);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_with_reconnect(&feed, ENDPOINT, fast_backoff(0), cancel).await
            })
        };

        within(server.wait_for_clients(1)).await;
        while !feed.connector().is_open() {
            tokio::task::yield_now().await;
        }
        let first = feed.connector().connection_id();

        // Far more events than the supervisor's channel holds, then the drop.
        let ack = ServerEnvelope::Success(SuccessInfo {
            message: "ok".to_string(),
        });
        for _ in 0..32 {
            server.push(&ack).unwrap();
        }
        server.drop_clients();

        within(async {
            while feed.connector().stats().connections < 2 || !feed.connector().is_open() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert_ne!(feed.connector().connection_id(), first);

        // The late close of the first connection must not trigger another attempt.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(feed.connector().stats().connections, 2);
        assert!(feed.connector().is_open());

        cancel.cancel();
        assert!(within(supervisor).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn refuses_to_supervise_an_active_connector() {
        let (_server, feed) = setup();
        feed.connector().connect(ENDPOINT).unwrap();

        let result =
            run_with_reconnect(&feed, ENDPOINT, fast_backoff(0), CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(FeedError::Connect(ConnectError::AlreadyActive(_)))
        ));
    }
}
