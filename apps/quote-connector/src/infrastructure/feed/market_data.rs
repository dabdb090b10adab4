//! Market Data Feed
//!
//! Typed layer over a [`Connector`]. Inbound envelopes are dispatched by
//! variant to a [`FeedHandler`]; market data updates are correlated through a
//! [`SubscriptionRegistry`] first.
//!
//! # Subscription Flow
//!
//! 1. `subscribe` registers interest. The first subscriber sends the request
//!    if the connection is open, otherwise the request is deferred.
//! 2. Whenever a connection opens, stale ids are forgotten and every deferred
//!    request is sent.
//! 3. The first update for the instrument assigns the subscription id.
//! 4. The last `unsubscribe` sends the upstream unsubscribe. If the id is not
//!    known yet, it is sent as soon as the first update reveals it.

use std::sync::Arc;

use crate::domain::connection::ConnectionId;
use crate::domain::market_data::Instrument;
use crate::domain::subscription::{
    Correlation, CorrelationError, ReleaseDecision, SubscribeDecision, SubscriptionRegistry,
};
use crate::infrastructure::connector::{
    CloseEvent, Connector, ConnectorHandle, ObserverId, SendError,
};
use crate::infrastructure::metrics;
use crate::infrastructure::protocol::{
    ClientEnvelope, ErrorInfo, ExecutionReport, MarketDataUpdate, PlaceOrder, ServerEnvelope,
    SuccessInfo,
};

// =============================================================================
// Handler Trait
// =============================================================================

/// Application callbacks for feed traffic.
///
/// Called on the connection task; implementations should return quickly.
#[cfg_attr(test, mockall::automock)]
pub trait FeedHandler: Send + Sync {
    /// A correlated market data update.
    fn on_market_data(&self, update: &MarketDataUpdate, correlation: &Correlation);

    /// An order status change.
    fn on_execution_report(&self, _report: &ExecutionReport) {}

    /// A server acknowledgement.
    fn on_success(&self, _info: &SuccessInfo) {}

    /// A feed-level error push. The connection stays open.
    fn on_feed_error(&self, _info: &ErrorInfo) {}

    /// An update that matched no subscription.
    fn on_correlation_failure(&self, _update: &MarketDataUpdate, _error: &CorrelationError) {}

    /// The connection closed.
    fn on_disconnected(&self, _event: &CloseEvent) {}
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of [`MarketDataFeed::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The subscribe request was queued on the open connection.
    Sent,
    /// Not connected; the request goes out when a connection opens.
    Deferred,
    /// Joined an existing subscription; nothing was sent.
    Coalesced,
}

/// Result of [`MarketDataFeed::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// The unsubscribe request was queued.
    Sent,
    /// Other subscribers remain.
    Retained,
    /// Nothing needs to go upstream.
    Cancelled,
    /// The unsubscribe goes out once the subscription id is known.
    AwaitingId,
    /// The instrument was not subscribed.
    NotSubscribed,
}

// =============================================================================
// Feed
// =============================================================================

/// Typed market data feed over one connector.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use quote_connector::infrastructure::feed::{FeedHandler, MarketDataFeed};
/// use quote_connector::domain::market_data::Instrument;
/// use quote_connector::domain::subscription::Correlation;
/// use quote_connector::infrastructure::connector::{Connector, ConnectorConfig};
/// use quote_connector::infrastructure::protocol::MarketDataUpdate;
/// use quote_connector::infrastructure::websocket::WebSocketTransport;
///
/// struct Printer;
///
/// impl FeedHandler for Printer {
///     fn on_market_data(&self, update: &MarketDataUpdate, _: &Correlation) {
///         println!("{}: {:?}", update.instrument, update.best());
///     }
/// }
///
/// # async fn run() {
/// let connector = Arc::new(Connector::new(
///     Arc::new(WebSocketTransport::new()),
///     ConnectorConfig::default(),
/// ));
/// let feed = MarketDataFeed::new(Arc::clone(&connector), Arc::new(Printer));
///
/// feed.subscribe(Instrument::UsdRub).unwrap();
/// connector.connect("ws://127.0.0.1:3000/ws/").unwrap();
/// # }
/// ```
pub struct MarketDataFeed {
    connector: Arc<Connector>,
    registry: Arc<SubscriptionRegistry>,
    observers: Vec<ObserverId>,
}

impl MarketDataFeed {
    /// Attach a feed to `connector`, delivering traffic to `handler`.
    #[must_use]
    pub fn new(connector: Arc<Connector>, handler: Arc<dyn FeedHandler>) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handle = connector.clone_handle();

        let open = {
            let registry = Arc::clone(&registry);
            let handle = handle.clone();
            connector.add_open_observer(move |connection| {
                replay(&registry, &handle, connection);
            })
        };

        let message = {
            let registry = Arc::clone(&registry);
            let handler = Arc::clone(&handler);
            connector.add_message_observer(move |connection, envelope| {
                dispatch(&registry, handler.as_ref(), &handle, connection, envelope);
            })
        };

        let close = connector.add_close_observer(move |event| handler.on_disconnected(event));

        Self {
            connector,
            registry,
            observers: vec![open, message, close],
        }
    }

    /// Subscribe to market data for `instrument`.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Codec`] if the request cannot be encoded. Not
    /// being connected is not an error: the request is deferred.
    pub fn subscribe(&self, instrument: Instrument) -> Result<SubscribeOutcome, SendError> {
        match self.registry.request(instrument) {
            SubscribeDecision::AlreadyPending | SubscribeDecision::AlreadyActive(_) => {
                tracing::debug!(%instrument, "Joined existing subscription");
                return Ok(SubscribeOutcome::Coalesced);
            }
            SubscribeDecision::Send => {}
        }

        let Some(connection) = self.open_connection() else {
            tracing::debug!(%instrument, "Not connected, subscription deferred");
            return Ok(SubscribeOutcome::Deferred);
        };

        // An open observer replaying on this connection may have sent it.
        if !self.registry.try_claim(instrument, connection) {
            return Ok(SubscribeOutcome::Sent);
        }

        match self.connector.send(&ClientEnvelope::subscribe(instrument)) {
            Ok(()) => {
                tracing::info!(%instrument, connection = %connection, "Subscription requested");
                Ok(SubscribeOutcome::Sent)
            }
            Err(SendError::NotConnected) => {
                self.registry.unclaim(instrument, connection);
                Ok(SubscribeOutcome::Deferred)
            }
            Err(err) => {
                self.registry.unclaim(instrument, connection);
                self.registry.release(instrument);
                Err(err)
            }
        }
    }

    /// Release one subscription to `instrument`.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Codec`] if the unsubscribe cannot be encoded.
    pub fn unsubscribe(&self, instrument: Instrument) -> Result<UnsubscribeOutcome, SendError> {
        let subscription_id = match self.registry.release(instrument) {
            ReleaseDecision::Retained => return Ok(UnsubscribeOutcome::Retained),
            ReleaseDecision::CancelPending => return Ok(UnsubscribeOutcome::Cancelled),
            ReleaseDecision::AwaitingId => return Ok(UnsubscribeOutcome::AwaitingId),
            ReleaseDecision::NotSubscribed => return Ok(UnsubscribeOutcome::NotSubscribed),
            ReleaseDecision::Unsubscribe(subscription_id) => subscription_id,
        };

        match self
            .connector
            .send(&ClientEnvelope::unsubscribe(subscription_id.clone()))
        {
            Ok(()) => {
                tracing::info!(%instrument, subscription_id = %subscription_id, "Unsubscribed");
                Ok(UnsubscribeOutcome::Sent)
            }
            // The server forgets subscriptions with the connection.
            Err(SendError::NotConnected) => Ok(UnsubscribeOutcome::Cancelled),
            Err(err) => Err(err),
        }
    }

    /// Submit an order.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotConnected`] unless the connection is open.
    pub fn place_order(&self, order: PlaceOrder) -> Result<(), SendError> {
        tracing::info!(
            instrument = %order.instrument,
            side = ?order.side,
            amount = %order.amount,
            price = %order.price,
            "Placing order"
        );
        self.connector.send(&ClientEnvelope::PlaceOrder(order))
    }

    /// Send every subscribe request not yet sent on the open connection.
    ///
    /// Runs automatically whenever a connection opens. Returns the number of
    /// requests sent.
    pub fn replay_subscriptions(&self) -> usize {
        self.open_connection().map_or(0, |connection| {
            replay(&self.registry, &self.connector.clone_handle(), connection)
        })
    }

    /// The underlying connector.
    #[must_use]
    pub const fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// The subscription registry.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    fn open_connection(&self) -> Option<ConnectionId> {
        self.connector
            .connection_id()
            .filter(|_| self.connector.is_open())
    }
}

impl Drop for MarketDataFeed {
    fn drop(&mut self) {
        for id in self.observers.drain(..) {
            self.connector.remove_observer(id);
        }
    }
}

impl std::fmt::Debug for MarketDataFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataFeed")
            .field("connector", &self.connector)
            .field("subscriptions", &self.registry.stats())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Observer Bodies
// =============================================================================

fn replay(
    registry: &SubscriptionRegistry,
    handle: &ConnectorHandle,
    connection: ConnectionId,
) -> usize {
    let demoted = registry.demote_stale(connection);
    if demoted > 0 {
        tracing::info!(
            connection = %connection,
            demoted,
            "Subscriptions reset for new connection"
        );
    }

    let mut sent = 0;
    for instrument in registry.unsent(connection) {
        if !registry.try_claim(instrument, connection) {
            continue;
        }
        match handle.send(&ClientEnvelope::subscribe(instrument)) {
            Ok(()) => sent += 1,
            Err(err) => {
                registry.unclaim(instrument, connection);
                tracing::warn!(%instrument, error = %err, "Failed to replay subscription");
                break;
            }
        }
    }

    if sent > 0 {
        tracing::info!(connection = %connection, sent, "Subscriptions replayed");
    }
    sent
}

fn dispatch(
    registry: &SubscriptionRegistry,
    handler: &dyn FeedHandler,
    handle: &ConnectorHandle,
    connection: ConnectionId,
    envelope: &ServerEnvelope,
) {
    match envelope {
        ServerEnvelope::MarketDataUpdate(update) => {
            on_update(registry, handler, handle, connection, update);
        }
        ServerEnvelope::ExecutionReport(report) => {
            tracing::info!(
                order_id = %report.order_id,
                status = ?report.order_status,
                "Execution report"
            );
            handler.on_execution_report(report);
        }
        ServerEnvelope::Success(info) => handler.on_success(info),
        ServerEnvelope::Error(info) => {
            tracing::warn!(reason = %info.reason, "Feed reported an error");
            handler.on_feed_error(info);
        }
    }
}

fn on_update(
    registry: &SubscriptionRegistry,
    handler: &dyn FeedHandler,
    handle: &ConnectorHandle,
    connection: ConnectionId,
    update: &MarketDataUpdate,
) {
    let correlation =
        match registry.correlate(&update.subscription_id, update.instrument, connection) {
            Ok(correlation) => correlation,
            Err(err) => {
                metrics::record_correlation_failure();
                tracing::warn!(
                    connection = %connection,
                    error = %err,
                    "Uncorrelated market data update"
                );
                handler.on_correlation_failure(update, &err);
                return;
            }
        };

    match &correlation {
        Correlation::Orphaned {
            instrument,
            subscription_id,
        } => {
            tracing::info!(
                %instrument,
                subscription_id = %subscription_id,
                "Subscription released before confirmation, unsubscribing"
            );
            if let Err(err) = handle.send(&ClientEnvelope::unsubscribe(subscription_id.clone())) {
                tracing::debug!(error = %err, "Orphan unsubscribe not sent");
            }
            return;
        }
        Correlation::Confirmed {
            instrument,
            subscription_id,
        } => {
            tracing::info!(%instrument, %subscription_id, "Subscription confirmed");
        }
        Correlation::Active { .. } => {}
    }

    for (level, quote) in update.quotes.iter().enumerate() {
        if let Err(err) = quote.validate() {
            tracing::warn!(
                instrument = %update.instrument,
                level,
                error = %err,
                "Invalid quote in update"
            );
        }
    }

    handler.on_market_data(update, &correlation);
}

// =============================================================================
// Tests
// =============================================================================
