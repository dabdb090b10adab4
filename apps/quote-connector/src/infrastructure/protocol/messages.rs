//! Feed Message Catalog
//!
//! Wire format types for every message exchanged with the quote feed.
//! Every frame is an envelope pairing a tag with its payload:
//!
//! ```json
//! {"messageType": "subscribeMarketData", "message": {"instrument": "usd_rub"}}
//! ```
//!
//! # Message Types
//!
//! ## Client → Server
//! - `subscribeMarketData`: Start receiving updates for an instrument
//! - `unsubscribeMarketData`: Stop a subscription by id
//! - `placeOrder`: Submit an order at a price
//!
//! ## Server → Client
//! - `success`: Acknowledgement with a text message
//! - `error`: Feed-level error push (the connection stays open)
//! - `executionReport`: Order status change
//! - `marketDataUpdate`: Quotes for a subscription
//!
//! Client and server tags are separate enumerations. The pairing of tag and
//! payload is carried by the enum variant, so a mismatched envelope cannot be
//! constructed.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::market_data::{
    Instrument, OrderSide, OrderStatus, Quote, SubscriptionId, decimal_str,
};

// =============================================================================
// Message Type Tags
// =============================================================================

/// Tag of a client-originated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessageType {
    /// Subscribe to market data.
    SubscribeMarketData,
    /// Unsubscribe from market data.
    UnsubscribeMarketData,
    /// Place an order.
    PlaceOrder,
}

impl ClientMessageType {
    /// All client tags.
    pub const ALL: [Self; 3] = [
        Self::SubscribeMarketData,
        Self::UnsubscribeMarketData,
        Self::PlaceOrder,
    ];

    /// Wire tag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SubscribeMarketData => "subscribeMarketData",
            Self::UnsubscribeMarketData => "unsubscribeMarketData",
            Self::PlaceOrder => "placeOrder",
        }
    }

    /// Look up a wire tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for ClientMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag of a server-originated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerMessageType {
    /// Acknowledgement.
    Success,
    /// Feed-level error.
    Error,
    /// Order status change.
    ExecutionReport,
    /// Quotes for a subscription.
    MarketDataUpdate,
}

impl ServerMessageType {
    /// All server tags.
    pub const ALL: [Self; 4] = [
        Self::Success,
        Self::Error,
        Self::ExecutionReport,
        Self::MarketDataUpdate,
    ];

    /// Wire tag.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::ExecutionReport => "executionReport",
            Self::MarketDataUpdate => "marketDataUpdate",
        }
    }

    /// Look up a wire tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for ServerMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Client Payloads
// =============================================================================

/// Request to start receiving updates for one instrument.
///
/// The server assigns the subscription id; it arrives with the first update.
///
/// # Wire Format (JSON)
/// ```json
/// {"instrument": "usd_rub"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeMarketData {
    /// Instrument to subscribe to.
    pub instrument: Instrument,
}

/// Request to stop a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeMarketData {
    /// Server-assigned subscription id.
    pub subscription_id: SubscriptionId,
}

/// Order submission.
///
/// # Wire Format (JSON)
/// ```json
/// {"instrument": "eur_usd", "side": "buy", "amount": "1000", "price": "1.0850"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrder {
    /// Instrument to trade.
    pub instrument: Instrument,
    /// Buy or sell.
    pub side: OrderSide,
    /// Amount of the base currency.
    #[serde(with = "decimal_str")]
    pub amount: Decimal,
    /// Limit price.
    #[serde(with = "decimal_str")]
    pub price: Decimal,
}

// =============================================================================
// Server Payloads
// =============================================================================

/// Quotes for a subscription.
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "subscriptionId": "s1",
///   "instrument": "usd_rub",
///   "quotes": [{"bid": "10", "offer": "10", "minAmount": "10", "maxAmount": "10"}]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataUpdate {
    /// Correlates the update to a subscription.
    pub subscription_id: SubscriptionId,
    /// Instrument quoted.
    pub instrument: Instrument,
    /// Quote levels, most relevant first. May be empty but must be present.
    pub quotes: Vec<Quote>,
}

impl MarketDataUpdate {
    /// Most relevant quote, if any.
    #[must_use]
    pub fn best(&self) -> Option<&Quote> {
        self.quotes.first()
    }
}

/// Acknowledgement from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessInfo {
    /// Human-readable text.
    pub message: String,
}

/// Feed-level error pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human-readable reason.
    pub reason: String,
}

/// Order status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    /// Server-assigned order id.
    pub order_id: String,
    /// New status.
    pub order_status: OrderStatus,
}

// =============================================================================
// Envelopes
// =============================================================================

/// Client-originated envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "message", rename_all = "camelCase")]
pub enum ClientEnvelope {
    /// Subscribe to market data.
    SubscribeMarketData(SubscribeMarketData),
    /// Unsubscribe from market data.
    UnsubscribeMarketData(UnsubscribeMarketData),
    /// Place an order.
    PlaceOrder(PlaceOrder),
}

impl ClientEnvelope {
    /// Subscribe envelope for an instrument.
    #[must_use]
    pub const fn subscribe(instrument: Instrument) -> Self {
        Self::SubscribeMarketData(SubscribeMarketData { instrument })
    }

    /// Unsubscribe envelope for a subscription id.
    #[must_use]
    pub const fn unsubscribe(subscription_id: SubscriptionId) -> Self {
        Self::UnsubscribeMarketData(UnsubscribeMarketData { subscription_id })
    }

    /// Tag of the envelope.
    #[must_use]
    pub const fn message_type(&self) -> ClientMessageType {
        match self {
            Self::SubscribeMarketData(_) => ClientMessageType::SubscribeMarketData,
            Self::UnsubscribeMarketData(_) => ClientMessageType::UnsubscribeMarketData,
            Self::PlaceOrder(_) => ClientMessageType::PlaceOrder,
        }
    }
}

/// Server-originated envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "message", rename_all = "camelCase")]
pub enum ServerEnvelope {
    /// Acknowledgement.
    Success(SuccessInfo),
    /// Feed-level error.
    Error(ErrorInfo),
    /// Order status change.
    ExecutionReport(ExecutionReport),
    /// Quotes for a subscription.
    MarketDataUpdate(MarketDataUpdate),
}

impl ServerEnvelope {
    /// Tag of the envelope.
    #[must_use]
    pub const fn message_type(&self) -> ServerMessageType {
        match self {
            Self::Success(_) => ServerMessageType::Success,
            Self::Error(_) => ServerMessageType::Error,
            Self::ExecutionReport(_) => ServerMessageType::ExecutionReport,
            Self::MarketDataUpdate(_) => ServerMessageType::MarketDataUpdate,
        }
    }
}
