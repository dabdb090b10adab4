//! WebSocket Transport
//!
//! [`Transport`] adapter over `tokio-tungstenite`. Each open spawns a pump
//! task that owns the socket and bridges it to a [`TransportLink`].
//!
//! # Frame Mapping
//!
//! - `Write(text)` is sent as one text frame
//! - text frames become `Frame` events; binary frames are accepted when they
//!   hold UTF-8
//! - pings are answered with pongs
//! - a close frame becomes `Closed(Remote)`, a socket error becomes `Error`
//!   followed by `Closed(Error)`, and a stream that simply ends becomes
//!   `Closed(Dropped)`

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{
    CloseReason, Transport, TransportCommand, TransportError, TransportEvent, TransportLink,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport for `ws://` and `wss://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create a new transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, endpoint: &str) -> Result<TransportLink, TransportError> {
        let (socket, response) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        tracing::debug!(endpoint, status = %response.status(), "WebSocket handshake complete");

        let (link, commands, events) = TransportLink::channel();
        tokio::spawn(pump(socket, commands, events));
        Ok(link)
    }
}

async fn pump(
    socket: Socket,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TransportCommand::Write(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        fail(&events, &e);
                        return;
                    }
                }
                Some(TransportCommand::Close) | None => {
                    if let Err(e) = write.close().await {
                        tracing::debug!(error = %e, "WebSocket close handshake failed");
                    }
                    return;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Frame(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(TransportEvent::Frame(text));
                    }
                    Err(_) => {
                        tracing::warn!(len = data.len(), "Dropping binary frame that is not UTF-8");
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        fail(&events, &e);
                        return;
                    }
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map_or(
                        CloseReason::Remote {
                            code: None,
                            reason: String::new(),
                        },
                        |frame| CloseReason::Remote {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.as_str().to_owned(),
                        },
                    );
                    let _ = events.send(TransportEvent::Closed(reason));
                    return;
                }
                Some(Err(e)) => {
                    fail(&events, &e);
                    return;
                }
                None => {
                    let _ = events.send(TransportEvent::Closed(CloseReason::Dropped));
                    return;
                }
            },
        }
    }
}

fn fail(events: &mpsc::UnboundedSender<TransportEvent>, error: &tungstenite::Error) {
    let _ = events.send(TransportEvent::Error(map_error(error)));
    let _ = events.send(TransportEvent::Closed(CloseReason::Error));
}

fn map_error(error: &tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::ConnectionLost
        }
        tungstenite::Error::Io(e) => TransportError::Io(e.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}
