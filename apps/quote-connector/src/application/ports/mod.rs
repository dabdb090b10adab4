//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: opens a bidirectional text-frame link to a feed endpoint
//!
//! A link is a pair of channels. The connector writes [`TransportCommand`]s
//! and reads [`TransportEvent`]s; the adapter owns the socket. One `Write`
//! is one frame on the wire and one `Frame` event is one received frame.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

// =============================================================================
// Errors and Close Reasons
// =============================================================================

/// Transport-level failure.
///
/// Cloneable so that it can be fanned out to every error observer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The endpoint could not be reached or refused the handshake.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Opening the link did not complete in time.
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    /// Protocol violation reported by the socket library.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The link went away while in use.
    #[error("connection lost")]
    ConnectionLost,
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the application.
    Local,
    /// Closed by the server with a close frame.
    Remote {
        /// Close code, if the frame carried one.
        code: Option<u16>,
        /// Close reason text (may be empty).
        reason: String,
    },
    /// Closed after a transport error.
    Error,
    /// The link never opened.
    ConnectFailed,
    /// The link ended without a close frame.
    Dropped,
}

impl CloseReason {
    /// Check if the application asked for the close.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote { .. } => "remote",
            Self::Error => "error",
            Self::ConnectFailed => "connect_failed",
            Self::Dropped => "dropped",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote {
                code: Some(code),
                reason,
            } => write!(f, "remote ({code}: {reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

// =============================================================================
// Link
// =============================================================================

/// Command from the connector to the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Write one text frame.
    Write(String),
    /// Close the link gracefully.
    Close,
}

/// Event from the adapter to the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame received.
    Frame(String),
    /// The link failed. The adapter should follow with `Closed` or end the
    /// channel.
    Error(TransportError),
    /// The link closed.
    Closed(CloseReason),
}

/// An open link returned by [`Transport::open`].
#[derive(Debug)]
pub struct TransportLink {
    /// Outbound commands, processed in order.
    pub outbound: mpsc::UnboundedSender<TransportCommand>,
    /// Inbound events, in receive order.
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    /// Create a link from its channel ends.
    #[must_use]
    pub const fn new(
        outbound: mpsc::UnboundedSender<TransportCommand>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// Create a link plus the adapter-side channel ends.
    ///
    /// The adapter reads commands from the returned receiver and publishes
    /// events through the returned sender.
    #[must_use]
    pub fn channel() -> (
        Self,
        mpsc::UnboundedReceiver<TransportCommand>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self::new(command_tx, event_rx), command_rx, event_tx)
    }
}

// =============================================================================
// Transport Port
// =============================================================================

/// Port for opening feed connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link to `endpoint`.
    ///
    /// Resolves once the link is open and ready for writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be reached or the handshake
    /// fails.
    async fn open(&self, endpoint: &str) -> Result<TransportLink, TransportError>;
}
