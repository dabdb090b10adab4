//! In-Memory Feed Server
//!
//! A feed endpoint that lives in the same process. [`MemoryTransport`]
//! connects to it through channels instead of sockets, so tests can drive
//! a [`Connector`](crate::infrastructure::connector::Connector) end to end:
//! inspect the frames it wrote, push envelopes to it, and inject errors or
//! remote closes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::application::ports::{
    CloseReason, Transport, TransportCommand, TransportError, TransportEvent, TransportLink,
};
use crate::infrastructure::protocol::{ClientEnvelope, CodecError, JsonCodec, ServerEnvelope};

struct Client {
    id: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

struct ServerInner {
    endpoint: String,
    codec: JsonCodec,
    clients: Mutex<Vec<Client>>,
    received: Mutex<Vec<String>>,
    refuse: AtomicBool,
    next_client: AtomicU64,
    client_count: watch::Sender<usize>,
    frame_count: watch::Sender<usize>,
}

impl ServerInner {
    fn attach(&self) -> (u64, mpsc::UnboundedReceiver<TransportCommand>, TransportLink) {
        let (link, commands, events) = TransportLink::channel();
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);

        let mut clients = self.clients.lock();
        clients.push(Client { id, events });
        self.client_count.send_replace(clients.len());
        (id, commands, link)
    }

    fn detach(&self, id: u64) {
        let mut clients = self.clients.lock();
        clients.retain(|client| client.id != id);
        self.client_count.send_replace(clients.len());
    }

    fn record(&self, text: String) {
        let mut received = self.received.lock();
        received.push(text);
        self.frame_count.send_replace(received.len());
    }

    /// Send `events` to every client, in order. Returns the number reached.
    fn broadcast(&self, events: &[TransportEvent]) -> usize {
        self.clients
            .lock()
            .iter()
            .filter(|client| {
                events
                    .iter()
                    .all(|event| client.events.send(event.clone()).is_ok())
            })
            .count()
    }

    /// Send a terminal event sequence and forget every client.
    fn disconnect_all(&self, events: &[TransportEvent]) -> usize {
        let reached = self.broadcast(events);
        let mut clients = self.clients.lock();
        clients.clear();
        self.client_count.send_replace(0);
        reached
    }
}

/// In-process feed endpoint.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use quote_connector::infrastructure::connector::{Connector, ConnectorConfig};
/// use quote_connector::infrastructure::memory::MemoryFeedServer;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let server = MemoryFeedServer::new("memory://feed");
/// let connector = Connector::new(Arc::new(server.transport()), ConnectorConfig::default());
///
/// connector.connect(server.endpoint()).unwrap();
/// server.wait_for_clients(1).await;
/// assert_eq!(server.client_count(), 1);
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryFeedServer {
    inner: Arc<ServerInner>,
}

impl MemoryFeedServer {
    /// Create a server reachable at `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                endpoint: endpoint.into(),
                codec: JsonCodec::new(),
                clients: Mutex::new(Vec::new()),
                received: Mutex::new(Vec::new()),
                refuse: AtomicBool::new(false),
                next_client: AtomicU64::new(0),
                client_count: watch::channel(0).0,
                frame_count: watch::channel(0).0,
            }),
        }
    }

    /// Endpoint the transport must be opened with.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// A transport that connects to this server.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            server: Arc::clone(&self.inner),
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Wait until at least `count` clients are connected.
    pub async fn wait_for_clients(&self, count: usize) {
        let mut rx = self.inner.client_count.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|connected| *connected >= count).await;
    }

    /// Every frame received so far, across all clients, in arrival order.
    #[must_use]
    pub fn received_frames(&self) -> Vec<String> {
        self.inner.received.lock().clone()
    }

    /// Received frames decoded as client envelopes. Malformed frames are
    /// skipped.
    #[must_use]
    pub fn received_envelopes(&self) -> Vec<ClientEnvelope> {
        self.inner
            .received
            .lock()
            .iter()
            .filter_map(|frame| self.inner.codec.decode_client(frame).ok())
            .collect()
    }

    /// Wait until at least `count` frames have been received, then return
    /// all of them.
    pub async fn wait_for_frames(&self, count: usize) -> Vec<String> {
        let mut rx = self.inner.frame_count.subscribe();
        let _ = rx.wait_for(|received| *received >= count).await;
        self.received_frames()
    }

    /// Push an envelope to every connected client. Returns the number of
    /// clients reached.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded.
    pub fn push(&self, envelope: &ServerEnvelope) -> Result<usize, CodecError> {
        let text = self.inner.codec.encode_server(envelope)?;
        Ok(self.push_raw(text))
    }

    /// Push a raw text frame to every connected client.
    pub fn push_raw(&self, text: impl Into<String>) -> usize {
        self.inner
            .broadcast(&[TransportEvent::Frame(text.into())])
    }

    /// Fail every connection with `error`. Each client sees the error
    /// followed by close.
    pub fn fail_clients(&self, error: TransportError) -> usize {
        self.inner.disconnect_all(&[
            TransportEvent::Error(error),
            TransportEvent::Closed(CloseReason::Error),
        ])
    }

    /// Close every connection from the server side.
    pub fn close_clients(&self, code: u16, reason: &str) -> usize {
        self.inner
            .disconnect_all(&[TransportEvent::Closed(CloseReason::Remote {
                code: Some(code),
                reason: reason.to_string(),
            })])
    }

    /// Drop every connection without a close frame.
    pub fn drop_clients(&self) -> usize {
        self.inner.disconnect_all(&[])
    }
}

impl std::fmt::Debug for MemoryFeedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFeedServer")
            .field("endpoint", &self.inner.endpoint)
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

/// [`Transport`] that connects to a [`MemoryFeedServer`].
#[derive(Clone)]
pub struct MemoryTransport {
    server: Arc<ServerInner>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, endpoint: &str) -> Result<TransportLink, TransportError> {
        if endpoint != self.server.endpoint {
            return Err(TransportError::ConnectFailed(format!(
                "no feed listening at {endpoint}"
            )));
        }
        if self.server.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("connection refused".to_string()));
        }

        let (id, mut commands, link) = self.server.attach();
        let server = Arc::clone(&self.server);
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    TransportCommand::Write(text) => server.record(text),
                    TransportCommand::Close => break,
                }
            }
            server.detach(id);
        });

        tracing::debug!(endpoint, client = id, "Memory client attached");
        Ok(link)
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("endpoint", &self.server.endpoint)
            .finish()
    }
}
