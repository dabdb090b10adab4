//! Feed Connector
//!
//! Owns at most one live connection to a feed endpoint and surfaces its
//! lifecycle to registered observers and to an async event stream.
//!
//! # Lifecycle
//!
//! `connect` returns immediately after spawning the connection task; the
//! outcome arrives as events. Each successful `connect` creates a new
//! connection entity with a fresh [`ConnectionId`]. A closed entity is never
//! reused.
//!
//! # Delivery Guarantees
//!
//! - Envelopes passed to `send` are written to the transport in call order.
//! - Every inbound envelope reaches each message observer once, in the order
//!   the transport produced it.
//! - Malformed frames are dropped and logged. The connection stays open.
//! - A transport error is always followed by close.
//! - Close observers fire exactly once per connection entity, whether the
//!   close was local, remote or caused by an error.
//! - After `close`, no further message is delivered. Frames queued before
//!   `close` are still written before the link is closed.
//!
//! # Concurrency
//!
//! Observers run on the connection task. Observer lists are snapshotted per
//! dispatch, so observers may register, remove, send or close from inside a
//! callback. The task only holds a weak reference to the connector; dropping
//! the connector cancels the connection.

pub mod reconnect;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    CloseReason, Transport, TransportCommand, TransportError, TransportEvent, TransportLink,
};
use crate::domain::connection::{ConnectionId, ConnectionState, Transition};
use crate::infrastructure::metrics;
use crate::infrastructure::protocol::{ClientEnvelope, CodecError, JsonCodec, ServerEnvelope};

// =============================================================================
// Configuration
// =============================================================================

/// Connector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// Time allowed for the transport to open.
    pub connect_timeout: Duration,
    /// Capacity of the [`ConnectorEvent`] broadcast channel.
    pub event_capacity: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            event_capacity: 1024,
        }
    }
}

// =============================================================================
// Error Types
// =============================================================================

/// `connect` precondition failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// A connection entity is already connecting, open or erroring.
    #[error("connector already has an active connection ({0})")]
    AlreadyActive(ConnectionState),

    /// Called outside a tokio runtime.
    #[error("connect must be called from within a tokio runtime")]
    NoRuntime,
}

/// `send` failures.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The connection is not open.
    #[error("not connected")]
    NotConnected,

    /// The envelope could not be encoded.
    #[error("failed to encode envelope: {0}")]
    Codec(#[from] CodecError),
}

impl SendError {
    /// Check if the send failed only because the connection is not open.
    #[must_use]
    pub const fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }
}

// =============================================================================
// Events and Observers
// =============================================================================

/// A connection entity closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// The connection that closed.
    pub connection: ConnectionId,
    /// Why it closed.
    pub reason: CloseReason,
}

/// Lifecycle events, as published on [`Connector::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// The connection opened.
    Opened(ConnectionId),
    /// An envelope was received.
    Message {
        /// Receiving connection.
        connection: ConnectionId,
        /// Decoded envelope.
        envelope: ServerEnvelope,
    },
    /// The transport reported an error. `Closed` follows.
    Error {
        /// Failing connection.
        connection: ConnectionId,
        /// Transport error.
        error: TransportError,
    },
    /// The connection closed.
    Closed(CloseEvent),
}

/// Handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type OpenObserver = Arc<dyn Fn(ConnectionId) + Send + Sync>;
type MessageObserver = Arc<dyn Fn(ConnectionId, &ServerEnvelope) + Send + Sync>;
type ErrorObserver = Arc<dyn Fn(ConnectionId, &TransportError) + Send + Sync>;
type CloseObserver = Arc<dyn Fn(&CloseEvent) + Send + Sync>;

#[derive(Default)]
struct Observers {
    open: Vec<(ObserverId, OpenObserver)>,
    message: Vec<(ObserverId, MessageObserver)>,
    error: Vec<(ObserverId, ErrorObserver)>,
    close: Vec<(ObserverId, CloseObserver)>,
}

impl Observers {
    fn len(&self) -> usize {
        self.open.len() + self.message.len() + self.error.len() + self.close.len()
    }
}

fn snapshot<T: ?Sized>(list: &[(ObserverId, Arc<T>)]) -> Vec<Arc<T>> {
    list.iter().map(|(_, observer)| Arc::clone(observer)).collect()
}

/// Connector statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectorStats {
    /// Connection entities created.
    pub connections: u64,
    /// Envelopes queued for sending.
    pub frames_sent: u64,
    /// Envelopes decoded and delivered.
    pub frames_received: u64,
    /// Inbound frames dropped as malformed.
    pub malformed_frames: u64,
    /// Transport errors reported.
    pub transport_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    malformed_frames: AtomicU64,
    transport_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConnectorStats {
        ConnectorStats {
            connections: self.connections.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Connection Slot
// =============================================================================

struct OutboundFrame {
    message_type: &'static str,
    text: String,
}

struct LiveConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    cancel: CancellationToken,
    opened: bool,
}

#[derive(Default)]
struct Slot {
    state: ConnectionState,
    live: Option<LiveConnection>,
}

impl Slot {
    fn live_id(&self) -> Option<ConnectionId> {
        self.live.as_ref().map(|live| live.id)
    }

    /// Move the live entity to `Closed` and hand it back.
    fn retire(&mut self) -> Option<LiveConnection> {
        self.state = self.state.apply(Transition::Closed).ok()?;
        let live = self.live.take()?;
        if live.opened {
            metrics::connection_closed();
        }
        Some(live)
    }
}

// =============================================================================
// Shared State
// =============================================================================

struct Shared {
    transport: Arc<dyn Transport>,
    config: ConnectorConfig,
    codec: JsonCodec,
    slot: Mutex<Slot>,
    observers: RwLock<Observers>,
    events: broadcast::Sender<ConnectorEvent>,
    next_connection: AtomicU64,
    next_observer: AtomicU64,
    counters: Counters,
}

impl Shared {
    fn is_open(&self, id: ConnectionId) -> bool {
        let slot = self.slot.lock();
        slot.state.is_usable() && slot.live_id() == Some(id)
    }

    fn is_current(&self, id: ConnectionId) -> bool {
        self.slot.lock().live_id() == Some(id)
    }

    /// Apply a lifecycle transition to connection `id`.
    ///
    /// Returns `false` when `id` is no longer the live entity or the
    /// transition is not allowed from the current state.
    fn advance(&self, id: ConnectionId, transition: Transition) -> bool {
        let mut slot = self.slot.lock();
        if slot.live_id() != Some(id) {
            return false;
        }

        if transition == Transition::Closed {
            return slot.retire().is_some();
        }

        match slot.state.apply(transition) {
            Ok(next) => {
                slot.state = next;
                if next == ConnectionState::Open
                    && let Some(live) = slot.live.as_mut()
                {
                    live.opened = true;
                    metrics::connection_opened();
                }
                true
            }
            Err(invalid) => {
                tracing::debug!(connection = %id, error = %invalid, "Ignoring lifecycle event");
                false
            }
        }
    }

    fn publish(&self, event: ConnectorEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    fn on_open(&self, id: ConnectionId) -> bool {
        if !self.advance(id, Transition::Opened) {
            return false;
        }
        tracing::info!(connection = %id, "Connection open");

        let observers = snapshot(&self.observers.read().open);
        for observer in observers {
            if !self.is_open(id) {
                return false;
            }
            observer(id);
        }
        self.publish(ConnectorEvent::Opened(id));
        true
    }

    fn on_frame(&self, id: ConnectionId, text: &str) {
        if !self.is_open(id) {
            return;
        }

        let envelope = match self.codec.decode_server(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                metrics::record_malformed_frame(err.kind());
                if err.is_unknown_type() {
                    tracing::debug!(
                        connection = %id,
                        error = %err,
                        "Ignoring unknown message type"
                    );
                } else {
                    tracing::warn!(
                        connection = %id,
                        kind = err.kind(),
                        error = %err,
                        "Dropping malformed frame"
                    );
                }
                return;
            }
        };

        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        metrics::record_frame_received(envelope.message_type().as_str());
        tracing::trace!(
            connection = %id,
            message_type = %envelope.message_type(),
            "Envelope received"
        );

        let observers = snapshot(&self.observers.read().message);
        for observer in observers {
            if !self.is_open(id) {
                return;
            }
            observer(id, &envelope);
        }

        if self.is_open(id) {
            self.publish(ConnectorEvent::Message {
                connection: id,
                envelope,
            });
        }
    }

    fn on_error(&self, id: ConnectionId, error: TransportError) {
        if !self.advance(id, Transition::Errored) {
            return;
        }
        self.counters.transport_errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_transport_error(transport_error_kind(&error));
        tracing::warn!(connection = %id, error = %error, "Transport error");

        let observers = snapshot(&self.observers.read().error);
        for observer in observers {
            if !self.is_current(id) {
                break;
            }
            observer(id, &error);
        }
        self.publish(ConnectorEvent::Error {
            connection: id,
            error,
        });
    }

    fn on_closed(&self, id: ConnectionId, reason: CloseReason) {
        if !self.advance(id, Transition::Closed) {
            return;
        }
        self.emit_close(CloseEvent {
            connection: id,
            reason,
        });
    }

    fn emit_close(&self, event: CloseEvent) {
        metrics::record_close(event.reason.as_str());
        tracing::info!(connection = %event.connection, reason = %event.reason, "Connection closed");

        let observers = snapshot(&self.observers.read().close);
        for observer in observers {
            observer(&event);
        }
        self.publish(ConnectorEvent::Closed(event));
    }
}

const fn transport_error_kind(error: &TransportError) -> &'static str {
    match error {
        TransportError::ConnectFailed(_) => "connect_failed",
        TransportError::Timeout(_) => "timeout",
        TransportError::Protocol(_) => "protocol",
        TransportError::Io(_) => "io",
        TransportError::ConnectionLost => "connection_lost",
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Client connector for one logical feed connection.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use quote_connector::domain::market_data::Instrument;
/// use quote_connector::infrastructure::connector::{Connector, ConnectorConfig};
/// use quote_connector::infrastructure::protocol::ClientEnvelope;
/// use quote_connector::infrastructure::websocket::WebSocketTransport;
///
/// # async fn run() {
/// let connector = Connector::new(Arc::new(WebSocketTransport::new()), ConnectorConfig::default());
/// connector.add_message_observer(|_, envelope| println!("{envelope:?}"));
///
/// let handle = connector.clone_handle();
/// connector.add_open_observer(move |_| {
///     let _ = handle.send(&ClientEnvelope::subscribe(Instrument::UsdRub));
/// });
///
/// connector.connect("ws://127.0.0.1:3000/ws/").unwrap();
/// # }
/// ```
pub struct Connector {
    shared: Arc<Shared>,
}

impl Connector {
    /// Create an idle connector.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: ConnectorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                codec: JsonCodec::new(),
                slot: Mutex::new(Slot::default()),
                observers: RwLock::new(Observers::default()),
                events,
                next_connection: AtomicU64::new(0),
                next_observer: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// A non-owning handle to the same connector.
    ///
    /// Handles can send, close and observe, so they can be captured by
    /// observers. Dropping a handle does not cancel the connection.
    #[must_use]
    pub fn clone_handle(&self) -> ConnectorHandle {
        ConnectorHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Begin opening a connection to `endpoint`.
    ///
    /// Returns as soon as the connection task is spawned. Completion is
    /// reported through open, error and close events.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::AlreadyActive`] if a connection is connecting,
    /// open or erroring, and [`ConnectError::NoRuntime`] outside a tokio
    /// runtime.
    pub fn connect(&self, endpoint: &str) -> Result<ConnectionId, ConnectError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConnectError::NoRuntime)?;

        let (id, outbound, cancel) = {
            let mut slot = self.shared.slot.lock();
            let next = slot
                .state
                .apply(Transition::Connect)
                .map_err(|_| ConnectError::AlreadyActive(slot.state))?;

            let raw = self.shared.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
            let id = ConnectionId::new(raw);
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();

            slot.state = next;
            slot.live = Some(LiveConnection {
                id,
                outbound: outbound_tx,
                cancel: cancel.clone(),
                opened: false,
            });
            (id, outbound_rx, cancel)
        };

        self.shared.counters.connections.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection = %id, endpoint, "Connecting to feed");

        runtime.spawn(run_connection(
            Arc::downgrade(&self.shared),
            id,
            endpoint.to_string(),
            outbound,
            cancel,
        ));
        Ok(id)
    }

    /// Queue an envelope for sending.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotConnected`] unless the connection is open, and
    /// [`SendError::Codec`] if the envelope cannot be encoded.
    pub fn send(&self, envelope: &ClientEnvelope) -> Result<(), SendError> {
        send_on(&self.shared, envelope)
    }

    /// Close the live connection.
    ///
    /// Returns `true` if a connection was active. Close observers fire with
    /// [`CloseReason::Local`] before this returns.
    pub fn close(&self) -> bool {
        close_on(&self.shared)
    }

    /// Register an observer for connection open.
    pub fn add_open_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ConnectionId) + Send + Sync + 'static,
    {
        let id = self.next_observer_id();
        self.shared.observers.write().open.push((id, Arc::new(observer)));
        id
    }

    /// Register an observer for inbound envelopes.
    pub fn add_message_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ConnectionId, &ServerEnvelope) + Send + Sync + 'static,
    {
        let id = self.next_observer_id();
        self.shared
            .observers
            .write()
            .message
            .push((id, Arc::new(observer)));
        id
    }

    /// Register an observer for transport errors.
    pub fn add_error_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ConnectionId, &TransportError) + Send + Sync + 'static,
    {
        let id = self.next_observer_id();
        self.shared.observers.write().error.push((id, Arc::new(observer)));
        id
    }

    /// Register an observer for connection close.
    pub fn add_close_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&CloseEvent) + Send + Sync + 'static,
    {
        let id = self.next_observer_id();
        self.shared.observers.write().close.push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.shared.observers.write();
        let before = observers.len();
        observers.open.retain(|(oid, _)| *oid != id);
        observers.message.retain(|(oid, _)| *oid != id);
        observers.error.retain(|(oid, _)| *oid != id);
        observers.close.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    /// Subscribe to lifecycle events as a stream.
    ///
    /// Events published before the call are not replayed.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.shared.events.subscribe()
    }

    /// State of the current connection entity.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.slot.lock().state
    }

    /// Id of the live connection entity, if any.
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.shared.slot.lock().live_id()
    }

    /// Check if envelopes can be sent.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_usable()
    }

    /// Get connector statistics.
    #[must_use]
    pub fn stats(&self) -> ConnectorStats {
        self.shared.counters.snapshot()
    }

    /// Connector configuration.
    #[must_use]
    pub fn config(&self) -> &ConnectorConfig {
        &self.shared.config
    }

    fn next_observer_id(&self) -> ObserverId {
        ObserverId(self.shared.next_observer.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        let retired = self.shared.slot.lock().retire();
        if let Some(live) = retired {
            tracing::debug!(connection = %live.id, "Connector dropped, cancelling connection");
            live.cancel.cancel();
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.shared.slot.lock();
        f.debug_struct("Connector")
            .field("state", &slot.state)
            .field("connection", &slot.live_id())
            .finish_non_exhaustive()
    }
}

/// Weak handle to a [`Connector`], safe to capture inside its own observers.
#[derive(Clone)]
pub struct ConnectorHandle {
    shared: Weak<Shared>,
}

impl ConnectorHandle {
    /// Queue an envelope for sending.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotConnected`] if the connection is not open or
    /// the connector is gone.
    pub fn send(&self, envelope: &ClientEnvelope) -> Result<(), SendError> {
        let shared = self.shared.upgrade().ok_or(SendError::NotConnected)?;
        send_on(&shared, envelope)
    }

    /// Close the live connection. Returns `false` if nothing was active.
    pub fn close(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| close_on(&shared))
    }

    /// State of the current connection entity, if the connector still exists.
    #[must_use]
    pub fn state(&self) -> Option<ConnectionState> {
        self.shared.upgrade().map(|shared| shared.slot.lock().state)
    }
}

impl fmt::Debug for ConnectorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorHandle").finish_non_exhaustive()
    }
}

fn send_on(shared: &Shared, envelope: &ClientEnvelope) -> Result<(), SendError> {
    let message_type = envelope.message_type().as_str();

    let id = {
        let slot = shared.slot.lock();
        let Some(live) = slot.live.as_ref().filter(|_| slot.state.is_usable()) else {
            return Err(SendError::NotConnected);
        };

        let text = shared.codec.encode_client(envelope)?;
        live.outbound
            .send(OutboundFrame { message_type, text })
            .map_err(|_| SendError::NotConnected)?;
        live.id
    };

    shared.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
    metrics::record_frame_sent(message_type);
    tracing::debug!(connection = %id, message_type, "Envelope queued");
    Ok(())
}

fn close_on(shared: &Shared) -> bool {
    let Some(live) = shared.slot.lock().retire() else {
        return false;
    };
    live.cancel.cancel();
    shared.emit_close(CloseEvent {
        connection: live.id,
        reason: CloseReason::Local,
    });
    true
}

// =============================================================================
// Connection Task
// =============================================================================

async fn run_connection(
    shared: Weak<Shared>,
    id: ConnectionId,
    endpoint: String,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    cancel: CancellationToken,
) {
    let Some((transport, timeout)) = shared
        .upgrade()
        .map(|s| (Arc::clone(&s.transport), s.config.connect_timeout))
    else {
        return;
    };

    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        result = tokio::time::timeout(timeout, transport.open(&endpoint)) => result,
    };
    drop(transport);

    let link = match opened {
        Ok(Ok(link)) => link,
        Ok(Err(error)) => return connect_failed(&shared, id, error),
        Err(_) => return connect_failed(&shared, id, TransportError::Timeout(timeout)),
    };

    if !shared.upgrade().is_some_and(|s| s.on_open(id)) {
        let _ = link.outbound.send(TransportCommand::Close);
        return;
    }

    pump(&shared, id, link, outbound, &cancel).await;
}

fn connect_failed(shared: &Weak<Shared>, id: ConnectionId, error: TransportError) {
    if let Some(shared) = shared.upgrade() {
        shared.on_error(id, error);
        shared.on_closed(id, CloseReason::ConnectFailed);
    }
}

async fn pump(
    shared: &Weak<Shared>,
    id: ConnectionId,
    mut link: TransportLink,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                while let Ok(frame) = outbound.try_recv() {
                    write_frame(&link, id, frame);
                }
                let _ = link.outbound.send(TransportCommand::Close);
                return;
            }
            Some(frame) = outbound.recv() => write_frame(&link, id, frame),
            event = link.inbound.recv() => {
                let Some(shared) = shared.upgrade() else {
                    let _ = link.outbound.send(TransportCommand::Close);
                    return;
                };
                match event {
                    Some(TransportEvent::Frame(text)) => shared.on_frame(id, &text),
                    Some(TransportEvent::Error(error)) => {
                        shared.on_error(id, error);
                        let _ = link.outbound.send(TransportCommand::Close);
                        shared.on_closed(id, CloseReason::Error);
                        return;
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        shared.on_closed(id, reason);
                        return;
                    }
                    None => {
                        shared.on_closed(id, CloseReason::Dropped);
                        return;
                    }
                }
            }
        }
    }
}

fn write_frame(link: &TransportLink, id: ConnectionId, frame: OutboundFrame) {
    if link
        .outbound
        .send(TransportCommand::Write(frame.text))
        .is_err()
    {
        tracing::debug!(
            connection = %id,
            message_type = frame.message_type,
            "Transport link gone, frame not written"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use metrics_exporter_prometheus::PrometheusBuilder;

    use super::*;
    use crate::application::ports::MockTransport;
    use crate::domain::market_data::Instrument;
    use crate::infrastructure::protocol::{ErrorInfo, ServerMessageType, SuccessInfo};

    type Log = Arc<Mutex<Vec<String>>>;

    /// Hands out prepared links in order; refuses once they run out.
    struct QueueTransport {
        links: Mutex<VecDeque<TransportLink>>,
    }

    #[async_trait]
    impl Transport for QueueTransport {
        async fn open(&self, _endpoint: &str) -> Result<TransportLink, TransportError> {
            self.links
                .lock()
                .pop_front()
                .ok_or_else(|| TransportError::ConnectFailed("no link".to_string()))
        }
    }

    /// Never finishes opening.
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn open(&self, _endpoint: &str) -> Result<TransportLink, TransportError> {
            std::future::pending().await
        }
    }

    struct Remote {
        commands: mpsc::UnboundedReceiver<TransportCommand>,
        events: mpsc::UnboundedSender<TransportEvent>,
    }

    impl Remote {
        fn push(&self, envelope: &ServerEnvelope) {
            let text = JsonCodec::new().encode_server(envelope).unwrap();
            self.events.send(TransportEvent::Frame(text)).unwrap();
        }

        fn push_raw(&self, text: &str) {
            self.events
                .send(TransportEvent::Frame(text.to_string()))
                .unwrap();
        }

        async fn command(&mut self) -> Option<TransportCommand> {
            tokio::time::timeout(Duration::from_secs(2), self.commands.recv())
                .await
                .expect("timed out waiting for transport command")
        }
    }

    fn connector_with_links(count: usize) -> (Connector, Vec<Remote>) {
        let mut links = VecDeque::new();
        let mut remotes = Vec::new();
        for _ in 0..count {
            let (link, commands, events) = TransportLink::channel();
            links.push_back(link);
            remotes.push(Remote { commands, events });
        }
        let transport = QueueTransport {
            links: Mutex::new(links),
        };
        (
            Connector::new(Arc::new(transport), ConnectorConfig::default()),
            remotes,
        )
    }

    fn record(connector: &Connector) -> Log {
        let log: Log = Arc::default();

        let l = Arc::clone(&log);
        connector.add_open_observer(move |id| l.lock().push(format!("open {id}")));
        let l = Arc::clone(&log);
        connector.add_message_observer(move |_, envelope| {
            l.lock().push(format!("message {}", envelope.message_type()));
        });
        let l = Arc::clone(&log);
        connector.add_error_observer(move |_, error| l.lock().push(format!("error {error}")));
        let l = Arc::clone(&log);
        connector.add_close_observer(move |event| l.lock().push(format!("close {}", event.reason)));

        log
    }

    async fn next_event(events: &mut broadcast::Receiver<ConnectorEvent>) -> ConnectorEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for connector event")
            .expect("event stream ended")
    }

    async fn wait_opened(events: &mut broadcast::Receiver<ConnectorEvent>) -> ConnectionId {
        loop {
            if let ConnectorEvent::Opened(id) = next_event(events).await {
                return id;
            }
        }
    }

    async fn wait_closed(events: &mut broadcast::Receiver<ConnectorEvent>) -> CloseEvent {
        loop {
            if let ConnectorEvent::Closed(event) = next_event(events).await {
                return event;
            }
        }
    }

    async fn wait_messages(
        events: &mut broadcast::Receiver<ConnectorEvent>,
        count: usize,
    ) -> Vec<ServerEnvelope> {
        let mut messages = Vec::new();
        while messages.len() < count {
            if let ConnectorEvent::Message { envelope, .. } = next_event(events).await {
                messages.push(envelope);
            }
        }
        messages
    }

    fn success(text: &str) -> ServerEnvelope {
        ServerEnvelope::Success(SuccessInfo {
            message: text.to_string(),
        })
    }

    #[test]
    fn connect_outside_runtime_fails() {
        let (connector, _remotes) = connector_with_links(1);
        assert_eq!(connector.connect("ws://feed"), Err(ConnectError::NoRuntime));
        assert_eq!(connector.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn send_before_connect_is_not_connected() {
        let (connector, _remotes) = connector_with_links(1);
        let err = connector
            .send(&ClientEnvelope::subscribe(Instrument::UsdRub))
            .unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(connector.stats().frames_sent, 0);
    }

    #[tokio::test]
    async fn second_connect_is_rejected_while_active() {
        let (connector, _remotes) = connector_with_links(2);
        let mut events = connector.events();

        connector.connect("ws://feed").unwrap();
        assert!(matches!(
            connector.connect("ws://feed"),
            Err(ConnectError::AlreadyActive(_))
        ));

        wait_opened(&mut events).await;
        assert_eq!(
            connector.connect("ws://feed"),
            Err(ConnectError::AlreadyActive(ConnectionState::Open))
        );
    }

    #[tokio::test]
    async fn open_enables_send() {
        let (connector, mut remotes) = connector_with_links(1);
        let log = record(&connector);
        let mut events = connector.events();

        let id = connector.connect("ws://feed").unwrap();
        assert_eq!(wait_opened(&mut events).await, id);
        assert!(connector.is_open());
        assert_eq!(connector.connection_id(), Some(id));

        connector
            .send(&ClientEnvelope::subscribe(Instrument::UsdRub))
            .unwrap();

        let command = remotes[0].command().await;
        assert_eq!(
            command,
            Some(TransportCommand::Write(
                r#"{"messageType":"subscribeMarketData","message":{"instrument":"usd_rub"}}"#
                    .to_string()
            ))
        );
        assert_eq!(*log.lock(), vec![format!("open {id}")]);
    }

    #[tokio::test]
    async fn frames_are_written_in_call_order() {
        let (connector, mut remotes) = connector_with_links(1);
        let mut events = connector.events();
        connector.connect("ws://feed").unwrap();
        wait_opened(&mut events).await;

        let instruments = [Instrument::UsdRub, Instrument::EurUsd, Instrument::EurRub];
        for _ in 0..5 {
            for instrument in instruments {
                connector
                    .send(&ClientEnvelope::subscribe(instrument))
                    .unwrap();
            }
        }

        let codec = JsonCodec::new();
        for _ in 0..5 {
            for instrument in instruments {
                let Some(TransportCommand::Write(text)) = remotes[0].command().await else {
                    panic!("expected a write");
                };
                assert_eq!(
                    codec.decode_client(&text).unwrap(),
                    ClientEnvelope::subscribe(instrument)
                );
            }
        }
        assert_eq!(connector.stats().frames_sent, 15);
    }

    #[tokio::test]
    async fn inbound_envelopes_reach_every_observer_in_order() {
        let (connector, remotes) = connector_with_links(1);
        let mut events = connector.events();

        let first: Arc<Mutex<Vec<ServerEnvelope>>> = Arc::default();
        let second: Arc<Mutex<Vec<ServerEnvelope>>> = Arc::default();
        let f = Arc::clone(&first);
        connector.add_message_observer(move |_, envelope| f.lock().push(envelope.clone()));
        let s = Arc::clone(&second);
        connector.add_message_observer(move |_, envelope| s.lock().push(envelope.clone()));

        connector.connect("ws://feed").unwrap();
        wait_opened(&mut events).await;

        let sent: Vec<_> = (0..20).map(|i| success(&format!("m{i}"))).collect();
        for envelope in &sent {
            remotes[0].push(envelope);
        }

        assert_eq!(wait_messages(&mut events, 20).await, sent);
        assert_eq!(*first.lock(), sent);
        assert_eq!(*second.lock(), sent);
        assert_eq!(connector.stats().frames_received, 20);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_and_connection_stays_open() {
        let (connector, remotes) = connector_with_links(1);
        let log = record(&connector);
        let mut events = connector.events();
        connector.connect("ws://feed").unwrap();
        wait_opened(&mut events).await;

        remotes[0].push_raw("not json");
        remotes[0].push_raw(
            r#"{"messageType":"marketDataUpdate","message":{"subscriptionId":"s1","instrument":"usd_rub"}}"#,
        );
        remotes[0].push_raw(r#"{"messageType":"heartbeat","message":{}}"#);
        remotes[0].push(&ServerEnvelope::Error(ErrorInfo {
            reason: "halted".to_string(),
        }));

        let messages = wait_messages(&mut events, 1).await;
        assert_eq!(messages[0].message_type(), ServerMessageType::Error);
        assert!(connector.is_open());
        assert_eq!(connector.stats().malformed_frames, 3);
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn transport_error_is_followed_by_close() {
        let (connector, mut remotes) = connector_with_links(1);
        let log = record(&connector);
        let mut events = connector.events();
        let id = connector.connect("ws://feed").unwrap();
        wait_opened(&mut events).await;

        remotes[0]
            .events
            .send(TransportEvent::Error(TransportError::Io("reset".to_string())))
            .unwrap();

        let closed = wait_closed(&mut events).await;
        assert_eq!(
            closed,
            CloseEvent {
                connection: id,
                reason: CloseReason::Error
            }
        );
        assert_eq!(
            *log.lock(),
            vec![
                format!("open {id}"),
                "error I/O error: reset".to_string(),
                "close error".to_string(),
            ]
        );
        assert_eq!(remotes[0].command().await, Some(TransportCommand::Close));

        assert_eq!(connector.state(), ConnectionState::Closed);
        let err = connector
            .send(&ClientEnvelope::subscribe(Instrument::UsdRub))
            .unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(connector.stats().transport_errors, 1);
    }

    #[tokio::test]
    async fn remote_close_reports_code_and_reason() {
        let (connector, remotes) = connector_with_links(1);
        let mut events = connector.events();
        connector.connect("ws://feed").unwrap();
        wait_opened(&mut events).await;

        let reason = CloseReason::Remote {
            code: Some(1001),
            reason: "going away".to_string(),
        };
        remotes[0]
            .events
            .send(TransportEvent::Closed(reason.clone()))
            .unwrap();

        assert_eq!(wait_closed(&mut events).await.reason, reason);
        assert_eq!(connector.connection_id(), None);
    }

    #[tokio::test]
    async fn link_ending_without_close_is_dropped() {
        let (connector, mut remotes) = connector_with_links(1);
        let mut events = connector.events();
        connector.connect("ws://feed").unwrap();
        wait_opened(&mut events).await;

        let remote = remotes.remove(0);
        drop(remote.events);

        assert_eq!(wait_closed(&mut events).await.reason, CloseReason::Dropped);
    }

    #[tokio::test]
    async fn local_close_flushes_and_fires_once() {
        let (connector, mut remotes) = connector_with_links(1);
        let log = record(&connector);
        let mut events = connector.events();
        let id = connector.connect("ws://feed").unwrap();
        wait_opened(&mut events).await;

        for instrument in Instrument::all() {
            connector
                .send(&ClientEnvelope::subscribe(*instrument))
                .unwrap();
        }
        assert!(connector.close());
        assert!(!connector.close());
        assert_eq!(connector.state(), ConnectionState::Closed);

        for _ in Instrument::all() {
            assert!(matches!(
                remotes[0].command().await,
                Some(TransportCommand::Write(_))
            ));
        }
        assert_eq!(remotes[0].command().await, Some(TransportCommand::Close));

        // A late remote close must not fire a second close.
        let _ = remotes[0].events.send(TransportEvent::Closed(CloseReason::Remote {
            code: Some(1000),
            reason: String::new(),
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closes: Vec<_> = log
            .lock()
            .iter()
            .filter(|entry| entry.starts_with("close"))
            .cloned()
            .collect();
        assert_eq!(closes, vec!["close local".to_string()]);
        assert_eq!(
            wait_closed(&mut events).await,
            CloseEvent {
                connection: id,
                reason: CloseReason::Local
            }
        );
    }

    #[tokio::test]
    async fn close_from_observer_stops_delivery() {
        let (connector, remotes) = connector_with_links(1);
        let mut events = connector.events();

        let handle = connector.clone_handle();
        connector.add_message_observer(move |_, _| {
            handle.close();
        });
        let delivered: Arc<Mutex<Vec<ServerEnvelope>>> = Arc::default();
        let d = Arc::clone(&delivered);
        connector.add_message_observer(move |_, envelope| d.lock().push(envelope.clone()));

        connector.connect("ws://feed").unwrap();
        wait_opened(&mut events).await;

        remotes[0].push(&success("first"));
        remotes[0].push(&success("second"));

        assert_eq!(wait_closed(&mut events).await.reason, CloseReason::Local);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(delivered.lock().is_empty());
    }

    #[tokio::test]
    async fn observer_registered_during_dispatch_sees_later_messages() {
        let (connector, remotes) = connector_with_links(1);
        let connector = Arc::new(connector);
        let mut events = connector.events();

        let late: Arc<Mutex<Vec<ServerEnvelope>>> = Arc::default();
        let registered = AtomicBool::new(false);
        let weak = Arc::downgrade(&connector);
        let l = Arc::clone(&late);
        connector.add_message_observer(move |_, _| {
            if registered.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(connector) = weak.upgrade() {
                let l = Arc::clone(&l);
                connector.add_message_observer(move |_, envelope| l.lock().push(envelope.clone()));
            }
        });

        connector.connect("ws://feed").unwrap();
        wait_opened(&mut events).await;
        remotes[0].push(&success("first"));
        remotes[0].push(&success("second"));
        wait_messages(&mut events, 2).await;

        assert_eq!(*late.lock(), vec![success("second")]);
    }

    #[tokio::test]
    async fn removed_observer_stops_receiving() {
        let (connector, remotes) = connector_with_links(1);
        let mut events = connector.events();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let id = connector.add_message_observer(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        connector.connect("ws://feed").unwrap();
        wait_opened(&mut events).await;
        remotes[0].push(&success("one"));
        wait_messages(&mut events, 1).await;

        assert!(connector.remove_observer(id));
        assert!(!connector.remove_observer(id));
        remotes[0].push(&success("two"));
        wait_messages(&mut events, 1).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_failure_fires_error_then_close() {
        let mut transport = MockTransport::new();
        transport
            .expect_open()
            .times(1)
            .returning(|_| Err(TransportError::ConnectFailed("refused".to_string())));
        let connector = Connector::new(Arc::new(transport), ConnectorConfig::default());
        let log = record(&connector);
        let mut events = connector.events();

        connector.connect("ws://feed").unwrap();

        assert_eq!(
            wait_closed(&mut events).await.reason,
            CloseReason::ConnectFailed
        );
        assert_eq!(
            *log.lock(),
            vec![
                "error connection failed: refused".to_string(),
                "close connect_failed".to_string(),
            ]
        );
        assert_eq!(connector.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn open_timeout_fires_error_then_close() {
        let config = ConnectorConfig {
            connect_timeout: Duration::from_millis(20),
            ..ConnectorConfig::default()
        };
        let connector = Connector::new(Arc::new(StalledTransport), config);
        let mut events = connector.events();

        connector.connect("ws://feed").unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            ConnectorEvent::Error {
                error: TransportError::Timeout(_),
                ..
            }
        ));
        assert_eq!(
            wait_closed(&mut events).await.reason,
            CloseReason::ConnectFailed
        );
    }

    #[tokio::test]
    async fn close_while_connecting_cancels_open() {
        let connector = Connector::new(Arc::new(StalledTransport), ConnectorConfig::default());
        let log = record(&connector);

        connector.connect("ws://feed").unwrap();
        assert_eq!(connector.state(), ConnectionState::Connecting);
        assert!(connector.close());

        assert_eq!(*log.lock(), vec!["close local".to_string()]);
        assert_eq!(connector.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn reconnect_creates_new_connection_entity() {
        let (connector, remotes) = connector_with_links(2);
        let mut events = connector.events();

        let first = connector.connect("ws://feed").unwrap();
        wait_opened(&mut events).await;
        remotes[0]
            .events
            .send(TransportEvent::Closed(CloseReason::Dropped))
            .unwrap();
        wait_closed(&mut events).await;

        let second = connector.connect("ws://feed").unwrap();
        assert_ne!(first, second);
        assert_eq!(wait_opened(&mut events).await, second);

        // Frames on the old link are no longer delivered.
        let _ = remotes[0].events.send(TransportEvent::Frame(
            JsonCodec::new().encode_server(&success("stale")).unwrap(),
        ));
        remotes[1].push(&success("fresh"));
        assert_eq!(wait_messages(&mut events, 1).await, vec![success("fresh")]);
        assert_eq!(connector.stats().connections, 2);
    }

    #[tokio::test]
    async fn dropping_connector_closes_link() {
        let (connector, mut remotes) = connector_with_links(1);
        let mut events = connector.events();
        connector.connect("ws://feed").unwrap();
        wait_opened(&mut events).await;

        drop(connector);

        assert_eq!(remotes[0].command().await, Some(TransportCommand::Close));
        assert_eq!(remotes[0].command().await, None);
    }

    fn open_connections_gauge(rendered: &str) -> Option<f64> {
        rendered
            .lines()
            .find_map(|line| line.strip_prefix("quote_connector_open_connections "))
            .and_then(|value| value.trim().parse().ok())
    }

    #[test]
    fn dropping_open_connector_releases_gauge() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        ::metrics::with_local_recorder(&recorder, || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let (connector, mut remotes) = connector_with_links(1);
                let mut events = connector.events();
                connector.connect("ws://feed").unwrap();
                wait_opened(&mut events).await;
                assert_eq!(open_connections_gauge(&handle.render()), Some(1.0));

                drop(connector);
                assert_eq!(remotes[0].command().await, Some(TransportCommand::Close));
            });
        });

        assert_eq!(open_connections_gauge(&handle.render()), Some(0.0));
    }

    #[test]
    fn retire_is_idempotent() {
        let (outbound, _frames) = mpsc::unbounded_channel();
        let mut slot = Slot {
            state: ConnectionState::Open,
            live: Some(LiveConnection {
                id: ConnectionId::new(1),
                outbound,
                cancel: CancellationToken::new(),
                opened: true,
            }),
        };

        assert!(slot.retire().is_some());
        assert_eq!(slot.state, ConnectionState::Closed);
        assert!(slot.retire().is_none());
    }

    #[tokio::test]
    async fn handle_outlives_connector_safely() {
        let (connector, _remotes) = connector_with_links(1);
        let handle = connector.clone_handle();
        drop(connector);

        assert!(handle.send(&ClientEnvelope::subscribe(Instrument::UsdRub)).is_err());
        assert!(!handle.close());
        assert_eq!(handle.state(), None);
    }
}
