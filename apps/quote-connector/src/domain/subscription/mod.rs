//! Subscription Correlation
//!
//! Tracks market data subscriptions per instrument so that inbound updates
//! can be matched to the request that opened them.
//!
//! # Design
//!
//! The client never chooses a subscription id. A subscribe request leaves the
//! instrument `Pending`; the first update for that instrument carries the
//! server-assigned id and promotes the entry to `Active`. From then on the id
//! alone is the correlation key.
//!
//! Subscriptions are coalesced: any number of subscribers for one instrument
//! share a single upstream subscription, reference counted the same way the
//! upstream stream subscriptions are. Releasing the last interest yields the
//! upstream unsubscribe.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::connection::ConnectionId;
use super::market_data::{Instrument, SubscriptionId};

// =============================================================================
// Public Types
// =============================================================================

/// Where a subscription stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Requested, no update seen yet.
    Pending {
        /// Connection the request was written to, if it has been sent.
        sent_on: Option<ConnectionId>,
    },
    /// Confirmed by the first update.
    Active {
        /// Server-assigned id.
        subscription_id: SubscriptionId,
        /// Connection the id was assigned on.
        connection: ConnectionId,
    },
}

/// Outcome of registering interest in an instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeDecision {
    /// First interest: a subscribe request must be sent.
    Send,
    /// A request is already outstanding.
    AlreadyPending,
    /// Already subscribed under this id.
    AlreadyActive(SubscriptionId),
}

/// Outcome of releasing interest in an instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseDecision {
    /// Other subscribers remain; nothing to send.
    Retained,
    /// The pending request was never sent and is dropped.
    CancelPending,
    /// The request was sent but no id is known yet. The unsubscribe goes out
    /// once the first update reveals the id.
    AwaitingId,
    /// Last interest released: send an unsubscribe for this id.
    Unsubscribe(SubscriptionId),
    /// Nothing was subscribed.
    NotSubscribed,
}

/// Successful correlation of an inbound update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// First update for a pending subscription; the id is now authoritative.
    Confirmed {
        /// Instrument of the subscription.
        instrument: Instrument,
        /// Newly assigned id.
        subscription_id: SubscriptionId,
    },
    /// Update for an already active subscription.
    Active {
        /// Instrument of the subscription.
        instrument: Instrument,
        /// Correlating id.
        subscription_id: SubscriptionId,
    },
    /// First update for a subscription released while pending. The update
    /// should not be delivered; an unsubscribe for the id should be sent.
    Orphaned {
        /// Instrument of the subscription.
        instrument: Instrument,
        /// Id to unsubscribe.
        subscription_id: SubscriptionId,
    },
}

impl Correlation {
    /// Subscription id of the correlated update.
    #[must_use]
    pub const fn subscription_id(&self) -> &SubscriptionId {
        match self {
            Self::Confirmed {
                subscription_id, ..
            }
            | Self::Active {
                subscription_id, ..
            }
            | Self::Orphaned {
                subscription_id, ..
            } => subscription_id,
        }
    }
}

/// An update that matches no known subscription.
///
/// Non-fatal: the feed is push based, so late or duplicate updates after an
/// unsubscribe or reconnect are expected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    /// Neither the id nor a pending request for the instrument is known.
    #[error("no subscription for id {subscription_id} ({instrument})")]
    UnknownSubscription {
        /// Id carried by the update.
        subscription_id: SubscriptionId,
        /// Instrument carried by the update.
        instrument: Instrument,
    },

    /// The id is known but was assigned to a different instrument.
    #[error("subscription {subscription_id} belongs to {expected}, update is for {actual}")]
    InstrumentMismatch {
        /// Id carried by the update.
        subscription_id: SubscriptionId,
        /// Instrument the id was assigned to.
        expected: Instrument,
        /// Instrument carried by the update.
        actual: Instrument,
    },
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Instruments waiting for their first update.
    pub pending: usize,
    /// Instruments with an assigned id.
    pub active: usize,
    /// Released while pending, waiting for an id to unsubscribe.
    pub orphaned: usize,
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug)]
struct Entry {
    /// Number of subscribers. Zero only for orphaned pending entries.
    interest: usize,
    status: SubscriptionStatus,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<Instrument, Entry>,
    by_id: HashMap<SubscriptionId, Instrument>,
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe registry of market data subscriptions.
///
/// # Example
///
/// ```rust
/// use quote_connector::domain::connection::ConnectionId;
/// use quote_connector::domain::market_data::{Instrument, SubscriptionId};
/// use quote_connector::domain::subscription::{Correlation, SubscribeDecision, SubscriptionRegistry};
///
/// let registry = SubscriptionRegistry::new();
/// let conn = ConnectionId::new(1);
///
/// assert_eq!(registry.request(Instrument::UsdRub), SubscribeDecision::Send);
/// registry.mark_sent(Instrument::UsdRub, conn);
///
/// let id = SubscriptionId::new("s1");
/// let first = registry.correlate(&id, Instrument::UsdRub, conn).unwrap();
/// assert!(matches!(first, Correlation::Confirmed { .. }));
///
/// let next = registry.correlate(&id, Instrument::UsdRub, conn).unwrap();
/// assert!(matches!(next, Correlation::Active { .. }));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in an instrument.
    pub fn request(&self, instrument: Instrument) -> SubscribeDecision {
        let mut state = self.state.write();

        if let Some(entry) = state.entries.get_mut(&instrument) {
            entry.interest += 1;
            return match &entry.status {
                SubscriptionStatus::Pending { .. } => SubscribeDecision::AlreadyPending,
                SubscriptionStatus::Active {
                    subscription_id, ..
                } => SubscribeDecision::AlreadyActive(subscription_id.clone()),
            };
        }

        state.entries.insert(
            instrument,
            Entry {
                interest: 1,
                status: SubscriptionStatus::Pending { sent_on: None },
            },
        );
        SubscribeDecision::Send
    }

    /// Record that the subscribe request for `instrument` was written to
    /// `connection`.
    pub fn mark_sent(&self, instrument: Instrument, connection: ConnectionId) {
        if let Some(entry) = self.state.write().entries.get_mut(&instrument)
            && let SubscriptionStatus::Pending { sent_on } = &mut entry.status
        {
            *sent_on = Some(connection);
        }
    }

    /// Claim the right to send the subscribe request for `instrument` on
    /// `connection`.
    ///
    /// Marks the request as sent and returns `true` only for the first caller
    /// per connection, so concurrent senders never write it twice. A caller
    /// whose send then fails must [`unclaim`](Self::unclaim).
    pub fn try_claim(&self, instrument: Instrument, connection: ConnectionId) -> bool {
        let mut state = self.state.write();
        match state.entries.get_mut(&instrument) {
            Some(Entry {
                interest,
                status: SubscriptionStatus::Pending { sent_on },
            }) if *interest > 0 && *sent_on != Some(connection) => {
                *sent_on = Some(connection);
                true
            }
            _ => false,
        }
    }

    /// Undo a [`try_claim`](Self::try_claim) whose send failed.
    pub fn unclaim(&self, instrument: Instrument, connection: ConnectionId) {
        if let Some(entry) = self.state.write().entries.get_mut(&instrument)
            && let SubscriptionStatus::Pending { sent_on } = &mut entry.status
            && *sent_on == Some(connection)
        {
            *sent_on = None;
        }
    }

    /// Release one interest in an instrument.
    pub fn release(&self, instrument: Instrument) -> ReleaseDecision {
        let mut state = self.state.write();

        let Some(entry) = state.entries.get_mut(&instrument) else {
            return ReleaseDecision::NotSubscribed;
        };

        if entry.interest == 0 {
            return ReleaseDecision::NotSubscribed;
        }

        entry.interest -= 1;
        if entry.interest > 0 {
            return ReleaseDecision::Retained;
        }

        match &entry.status {
            SubscriptionStatus::Pending { sent_on: Some(_) } => ReleaseDecision::AwaitingId,
            SubscriptionStatus::Pending { sent_on: None } => {
                state.entries.remove(&instrument);
                ReleaseDecision::CancelPending
            }
            SubscriptionStatus::Active {
                subscription_id, ..
            } => {
                let subscription_id = subscription_id.clone();
                state.entries.remove(&instrument);
                state.by_id.remove(&subscription_id);
                ReleaseDecision::Unsubscribe(subscription_id)
            }
        }
    }

    /// Correlate an inbound market data update.
    ///
    /// A known id must carry the instrument it was assigned to. An unknown id
    /// is accepted only for an instrument whose request has been sent; it
    /// then becomes the subscription's id.
    pub fn correlate(
        &self,
        subscription_id: &SubscriptionId,
        instrument: Instrument,
        connection: ConnectionId,
    ) -> Result<Correlation, CorrelationError> {
        let mut state = self.state.write();

        if let Some(&expected) = state.by_id.get(subscription_id) {
            if expected != instrument {
                return Err(CorrelationError::InstrumentMismatch {
                    subscription_id: subscription_id.clone(),
                    expected,
                    actual: instrument,
                });
            }
            return Ok(Correlation::Active {
                instrument,
                subscription_id: subscription_id.clone(),
            });
        }

        let unknown = || CorrelationError::UnknownSubscription {
            subscription_id: subscription_id.clone(),
            instrument,
        };

        let Some(entry) = state.entries.get_mut(&instrument) else {
            return Err(unknown());
        };

        if !matches!(entry.status, SubscriptionStatus::Pending { sent_on: Some(_) }) {
            return Err(unknown());
        }

        if entry.interest == 0 {
            state.entries.remove(&instrument);
            return Ok(Correlation::Orphaned {
                instrument,
                subscription_id: subscription_id.clone(),
            });
        }

        entry.status = SubscriptionStatus::Active {
            subscription_id: subscription_id.clone(),
            connection,
        };
        state.by_id.insert(subscription_id.clone(), instrument);

        Ok(Correlation::Confirmed {
            instrument,
            subscription_id: subscription_id.clone(),
        })
    }

    /// Instruments with subscribers whose request has not been sent on
    /// `connection`.
    #[must_use]
    pub fn unsent(&self, connection: ConnectionId) -> Vec<Instrument> {
        let state = self.state.read();
        let mut instruments: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.interest > 0
                    && matches!(
                        entry.status,
                        SubscriptionStatus::Pending { sent_on } if sent_on != Some(connection)
                    )
            })
            .map(|(instrument, _)| *instrument)
            .collect();
        instruments.sort_unstable();
        instruments
    }

    /// Forget everything tied to connections other than `connection`.
    ///
    /// Server-assigned ids do not survive a reconnect: active subscriptions
    /// from older connections return to pending, requests sent on older
    /// connections are marked unsent, and orphans are dropped. Returns the
    /// number of entries that were reset.
    pub fn demote_stale(&self, connection: ConnectionId) -> usize {
        let mut state = self.state.write();
        let RegistryState { entries, by_id } = &mut *state;

        entries.retain(|_, entry| {
            let sent_elsewhere = matches!(
                entry.status,
                SubscriptionStatus::Pending { sent_on: Some(c) } if c != connection
            );
            entry.interest > 0 || !sent_elsewhere
        });

        let mut demoted = 0;
        for entry in entries.values_mut() {
            match &entry.status {
                SubscriptionStatus::Active {
                    subscription_id,
                    connection: assigned_on,
                } if *assigned_on != connection => {
                    by_id.remove(subscription_id);
                    entry.status = SubscriptionStatus::Pending { sent_on: None };
                    demoted += 1;
                }
                SubscriptionStatus::Pending {
                    sent_on: Some(sent_on),
                } if *sent_on != connection => {
                    entry.status = SubscriptionStatus::Pending { sent_on: None };
                    demoted += 1;
                }
                _ => {}
            }
        }

        demoted
    }

    /// Current status of an instrument's subscription.
    #[must_use]
    pub fn status(&self, instrument: Instrument) -> Option<SubscriptionStatus> {
        self.state
            .read()
            .entries
            .get(&instrument)
            .map(|entry| entry.status.clone())
    }

    /// Assigned id for an instrument, if active.
    #[must_use]
    pub fn subscription_id(&self, instrument: Instrument) -> Option<SubscriptionId> {
        match self.status(instrument)? {
            SubscriptionStatus::Active {
                subscription_id, ..
            } => Some(subscription_id),
            SubscriptionStatus::Pending { .. } => None,
        }
    }

    /// Instrument an id was assigned to.
    #[must_use]
    pub fn instrument_of(&self, subscription_id: &SubscriptionId) -> Option<Instrument> {
        self.state.read().by_id.get(subscription_id).copied()
    }

    /// Number of subscribers for an instrument.
    #[must_use]
    pub fn interest(&self, instrument: Instrument) -> usize {
        self.state
            .read()
            .entries
            .get(&instrument)
            .map_or(0, |entry| entry.interest)
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        let mut stats = RegistryStats::default();
        for entry in state.entries.values() {
            match entry.status {
                SubscriptionStatus::Pending { .. } if entry.interest == 0 => stats.orphaned += 1,
                SubscriptionStatus::Pending { .. } => stats.pending += 1,
                SubscriptionStatus::Active { .. } => stats.active += 1,
            }
        }
        stats
    }
}

// =============================================================================
// Tests
// =============================================================================
