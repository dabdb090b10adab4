//! Connection Lifecycle
//!
//! The lifecycle of one connection entity as an explicit state machine:
//!
//! ```text
//! Idle ─connect─► Connecting ─opened─► Open ─close─► Closed
//!                     │                  │             ▲
//!                     └──────error──────►Erroring──close┘
//! ```
//!
//! `Closed` is terminal for an entity. A later `connect` starts a new entity
//! with a new [`ConnectionId`]; it never resurrects the closed one.

use std::fmt;

/// Identifier of one connection entity owned by a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create an identifier from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State of the connection entity currently owned by a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection has been requested yet.
    #[default]
    Idle,
    /// Transport open in progress.
    Connecting,
    /// Transport open; frames may be sent and received.
    Open,
    /// Transport reported an error; close follows.
    Erroring,
    /// Terminal state of the entity.
    Closed,
}

/// Events that drive the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Application requested a connection.
    Connect,
    /// Transport reported the connection open.
    Opened,
    /// Transport reported an error.
    Errored,
    /// Connection closed (local request, remote close, or after an error).
    Closed,
}

/// A transition that the lifecycle does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid connection transition {transition:?} from {from:?}")]
pub struct InvalidTransition {
    /// State the transition was attempted from.
    pub from: ConnectionState,
    /// The rejected transition.
    pub transition: Transition,
}

impl ConnectionState {
    /// Check if a connection entity is alive (connecting, open or erroring).
    ///
    /// Only one active entity may exist per connector.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Erroring)
    }

    /// Check if frames can be sent.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Apply a transition, returning the next state.
    pub const fn apply(self, transition: Transition) -> Result<Self, InvalidTransition> {
        let next = match (self, transition) {
            (Self::Idle | Self::Closed, Transition::Connect) => Self::Connecting,
            (Self::Connecting, Transition::Opened) => Self::Open,
            (Self::Connecting | Self::Open, Transition::Errored) => Self::Erroring,
            (Self::Connecting | Self::Open | Self::Erroring, Transition::Closed) => Self::Closed,
            (from, transition) => return Err(InvalidTransition { from, transition }),
        };
        Ok(next)
    }

    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Erroring => "erroring",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(ConnectionState::Idle, Transition::Connect => Ok(ConnectionState::Connecting))]
    #[test_case(ConnectionState::Closed, Transition::Connect => Ok(ConnectionState::Connecting))]
    #[test_case(ConnectionState::Connecting, Transition::Opened => Ok(ConnectionState::Open))]
    #[test_case(ConnectionState::Connecting, Transition::Errored => Ok(ConnectionState::Erroring))]
    #[test_case(ConnectionState::Connecting, Transition::Closed => Ok(ConnectionState::Closed))]
    #[test_case(ConnectionState::Open, Transition::Errored => Ok(ConnectionState::Erroring))]
    #[test_case(ConnectionState::Open, Transition::Closed => Ok(ConnectionState::Closed))]
    #[test_case(ConnectionState::Erroring, Transition::Closed => Ok(ConnectionState::Closed))]
    fn allowed_transitions(
        from: ConnectionState,
        transition: Transition,
    ) -> Result<ConnectionState, InvalidTransition> {
        from.apply(transition)
    }

    #[test_case(ConnectionState::Idle, Transition::Opened)]
    #[test_case(ConnectionState::Idle, Transition::Closed)]
    #[test_case(ConnectionState::Connecting, Transition::Connect)]
    #[test_case(ConnectionState::Open, Transition::Connect)]
    #[test_case(ConnectionState::Open, Transition::Opened)]
    #[test_case(ConnectionState::Erroring, Transition::Errored)]
    #[test_case(ConnectionState::Erroring, Transition::Connect)]
    #[test_case(ConnectionState::Closed, Transition::Closed)]
    #[test_case(ConnectionState::Closed, Transition::Opened)]
    fn rejected_transitions(from: ConnectionState, transition: Transition) {
        assert_eq!(
            from.apply(transition),
            Err(InvalidTransition { from, transition })
        );
    }

    #[test]
    fn only_open_is_usable() {
        assert!(ConnectionState::Open.is_usable());
        assert!(!ConnectionState::Connecting.is_usable());
        assert!(!ConnectionState::Erroring.is_usable());
        assert!(!ConnectionState::Closed.is_usable());
        assert!(!ConnectionState::Idle.is_usable());
    }

    #[test]
    fn active_states() {
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Open.is_active());
        assert!(ConnectionState::Erroring.is_active());
        assert!(!ConnectionState::Idle.is_active());
        assert!(!ConnectionState::Closed.is_active());
    }

    #[test]
    fn connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
    }
}
