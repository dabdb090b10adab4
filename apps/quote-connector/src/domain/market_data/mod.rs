//! Market Data Types
//!
//! Instruments, quotes and order vocabulary shared by both ends of the feed.
//!
//! # Numeric Fidelity
//!
//! Prices and amounts are `rust_decimal::Decimal` and travel on the wire as
//! JSON strings (`"10.00"`), never as JSON numbers. Decimals keep their scale,
//! so `"10.00"` decodes and re-encodes as `"10.00"`. A string that a
//! `Decimal` cannot hold exactly (too many digits) is rejected, never rounded,
//! and so is a signed zero such as `"-0.00"`. Leading zeros are accepted and
//! dropped on re-encode (`"010.5"` becomes `"10.5"`).

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Decimal Wire Format
// =============================================================================

/// Serde adapter for decimals carried as JSON strings.
///
/// Serialization delegates to `rust_decimal::serde::str`. Deserialization
/// only accepts strings and parses them exactly, so JSON numbers, scientific
/// notation and values beyond 28 significant digits are rejected.
pub mod decimal_str {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a decimal as a string, keeping its scale.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error.
    pub fn serialize<S: Serializer>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
        rust_decimal::serde::str::serialize(value, serializer)
    }

    /// Deserialize a decimal from a string without rounding.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a string, not an exact decimal,
    /// or a negative zero.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let value = Decimal::from_str_exact(&raw)
            .map_err(|e| serde::de::Error::custom(format!("invalid decimal {raw:?}: {e}")))?;
        // Zero carries no sign on re-encode.
        if value.is_zero() && raw.starts_with('-') {
            return Err(serde::de::Error::custom(format!(
                "invalid decimal {raw:?}: negative zero"
            )));
        }
        Ok(value)
    }
}

// =============================================================================
// Instrument
// =============================================================================

/// Tradable currency pair offered by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instrument {
    /// Euro / US dollar.
    EurUsd,
    /// Euro / Russian rouble.
    EurRub,
    /// US dollar / Russian rouble.
    UsdRub,
}

impl Instrument {
    /// Get all instruments in the catalog.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::EurUsd, Self::EurRub, Self::UsdRub]
    }

    /// Wire code of the instrument.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EurUsd => "eur_usd",
            Self::EurRub => "eur_rub",
            Self::UsdRub => "usd_rub",
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown instrument code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown instrument: {0}")]
pub struct UnknownInstrument(pub String);

impl FromStr for Instrument {
    type Err = UnknownInstrument;

    /// Parse an instrument code. Accepts `usd_rub`, `USD_RUB` and `USD/RUB`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('/', "_");
        Self::all()
            .iter()
            .copied()
            .find(|instrument| instrument.as_str() == normalized)
            .ok_or_else(|| UnknownInstrument(s.to_string()))
    }
}

// =============================================================================
// Subscription Identifier
// =============================================================================

/// Server-assigned identifier of a market data subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Wrap a server-assigned identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Quote
// =============================================================================

/// One priced market level with the tradable amount range.
///
/// # Wire Format (JSON)
/// ```json
/// {"bid": "10.05", "offer": "10.10", "minAmount": "1000", "maxAmount": "50000"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Bid price.
    #[serde(with = "decimal_str")]
    pub bid: Decimal,

    /// Offer (ask) price.
    #[serde(with = "decimal_str")]
    pub offer: Decimal,

    /// Minimum tradable amount at this level.
    #[serde(with = "decimal_str")]
    pub min_amount: Decimal,

    /// Maximum tradable amount at this level.
    #[serde(with = "decimal_str")]
    pub max_amount: Decimal,
}

impl Quote {
    /// Create a new quote.
    #[must_use]
    pub const fn new(
        bid: Decimal,
        offer: Decimal,
        min_amount: Decimal,
        max_amount: Decimal,
    ) -> Self {
        Self {
            bid,
            offer,
            min_amount,
            max_amount,
        }
    }

    /// Offer minus bid, or `None` if the difference overflows.
    #[must_use]
    pub fn spread(&self) -> Option<Decimal> {
        self.offer.checked_sub(self.bid)
    }

    /// Midpoint between bid and offer, or `None` if the sum overflows.
    #[must_use]
    pub fn mid(&self) -> Option<Decimal> {
        self.bid.checked_add(self.offer)?.checked_div(Decimal::TWO)
    }

    /// Check the quote invariants.
    ///
    /// Prices and amounts must be non-negative, `bid <= offer` and
    /// `min_amount <= max_amount`. Decoding never enforces these; consumers do.
    pub fn validate(&self) -> Result<(), QuoteError> {
        for (field, value) in [
            ("bid", self.bid),
            ("offer", self.offer),
            ("minAmount", self.min_amount),
            ("maxAmount", self.max_amount),
        ] {
            if value < Decimal::ZERO {
                return Err(QuoteError::Negative { field, value });
            }
        }

        if self.bid > self.offer {
            return Err(QuoteError::CrossedPrices {
                bid: self.bid,
                offer: self.offer,
            });
        }

        if self.min_amount > self.max_amount {
            return Err(QuoteError::InvertedAmounts {
                min_amount: self.min_amount,
                max_amount: self.max_amount,
            });
        }

        Ok(())
    }
}

/// Quote invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuoteError {
    /// A price or amount is below zero.
    #[error("{field} is negative: {value}")]
    Negative {
        /// Wire name of the offending field.
        field: &'static str,
        /// The offending value.
        value: Decimal,
    },

    /// Bid above offer.
    #[error("bid {bid} is above offer {offer}")]
    CrossedPrices {
        /// Bid price.
        bid: Decimal,
        /// Offer price.
        offer: Decimal,
    },

    /// Minimum amount above maximum amount.
    #[error("minAmount {min_amount} is above maxAmount {max_amount}")]
    InvertedAmounts {
        /// Minimum amount.
        min_amount: Decimal,
        /// Maximum amount.
        max_amount: Decimal,
    },
}

// =============================================================================
// Orders
// =============================================================================

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy the base currency.
    Buy,
    /// Sell the base currency.
    Sell,
}

/// Order lifecycle status reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Accepted and working.
    Active,
    /// Fully executed.
    Filled,
    /// Refused by the server.
    Rejected,
    /// Cancelled before execution.
    Cancelled,
}

impl OrderStatus {
    /// Check if no further reports are expected for the order.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}
