//! Envelope Codec
//!
//! JSON encoding and decoding of feed envelopes.
//!
//! Decoding inspects the frame before deserializing the payload so that each
//! way a frame can be malformed is reported precisely: not JSON, not an
//! object, no tag, a tag of the wrong type, an unknown tag, or a payload that
//! does not fit the tag. Unknown tags are distinguishable so that newer
//! message kinds can be skipped by older clients.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::messages::{
    ClientEnvelope, ClientMessageType, ServerEnvelope, ServerMessageType,
};

/// Name of the tag field.
pub const TAG_FIELD: &str = "messageType";

/// Name of the payload field.
pub const PAYLOAD_FIELD: &str = "message";

/// Encoding errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON serialization failed.
    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A frame that is not a valid envelope.
#[derive(Debug, thiserror::Error)]
pub enum MalformedEnvelope {
    /// Frame is not JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Frame is JSON but not an object.
    #[error("envelope is not a JSON object")]
    NotAnObject,

    /// No `messageType` field.
    #[error("envelope has no messageType")]
    MissingTag,

    /// `messageType` is not a string.
    #[error("messageType is not a string: {0}")]
    InvalidTag(Value),

    /// `messageType` is not a member of the expected enumeration.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Payload is missing or does not have the shape the tag requires.
    #[error("payload does not match {message_type}: {source}")]
    PayloadMismatch {
        /// Tag of the envelope.
        message_type: &'static str,
        /// Deserialization failure.
        #[source]
        source: serde_json::Error,
    },
}

impl MalformedEnvelope {
    /// Check if the frame was well formed but carried a tag this client does
    /// not know.
    #[must_use]
    pub const fn is_unknown_type(&self) -> bool {
        matches!(self, Self::UnknownMessageType(_))
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::NotAnObject => "not_an_object",
            Self::MissingTag => "missing_tag",
            Self::InvalidTag(_) => "invalid_tag",
            Self::UnknownMessageType(_) => "unknown_message_type",
            Self::PayloadMismatch { .. } => "payload_mismatch",
        }
    }
}

/// JSON codec for feed envelopes.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encode a client envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_client(&self, envelope: &ClientEnvelope) -> Result<String, CodecError> {
        Ok(serde_json::to_string(envelope)?)
    }

    /// Encode a server envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode_server(&self, envelope: &ServerEnvelope) -> Result<String, CodecError> {
        Ok(serde_json::to_string(envelope)?)
    }

    /// Decode a client envelope.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedEnvelope`] describing why the frame was rejected.
    pub fn decode_client(&self, text: &str) -> Result<ClientEnvelope, MalformedEnvelope> {
        let (tag, payload) = split_envelope(text)?;
        let message_type = ClientMessageType::from_tag(&tag)
            .ok_or(MalformedEnvelope::UnknownMessageType(tag))?;
        let name = message_type.as_str();

        Ok(match message_type {
            ClientMessageType::SubscribeMarketData => {
                ClientEnvelope::SubscribeMarketData(payload_as(name, payload)?)
            }
            ClientMessageType::UnsubscribeMarketData => {
                ClientEnvelope::UnsubscribeMarketData(payload_as(name, payload)?)
            }
            ClientMessageType::PlaceOrder => ClientEnvelope::PlaceOrder(payload_as(name, payload)?),
        })
    }

    /// Decode a server envelope.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedEnvelope`] describing why the frame was rejected.
    pub fn decode_server(&self, text: &str) -> Result<ServerEnvelope, MalformedEnvelope> {
        let (tag, payload) = split_envelope(text)?;
        let message_type = ServerMessageType::from_tag(&tag)
            .ok_or(MalformedEnvelope::UnknownMessageType(tag))?;
        let name = message_type.as_str();

        Ok(match message_type {
            ServerMessageType::Success => ServerEnvelope::Success(payload_as(name, payload)?),
            ServerMessageType::Error => ServerEnvelope::Error(payload_as(name, payload)?),
            ServerMessageType::ExecutionReport => {
                ServerEnvelope::ExecutionReport(payload_as(name, payload)?)
            }
            ServerMessageType::MarketDataUpdate => {
                ServerEnvelope::MarketDataUpdate(payload_as(name, payload)?)
            }
        })
    }
}

/// Split a frame into its tag and payload.
///
/// A missing payload is returned as `Value::Null` so that it fails as a
/// payload mismatch for the tag rather than defaulting.
fn split_envelope(text: &str) -> Result<(String, Value), MalformedEnvelope> {
    let value: Value = serde_json::from_str(text).map_err(MalformedEnvelope::InvalidJson)?;

    let Value::Object(mut object) = value else {
        return Err(MalformedEnvelope::NotAnObject);
    };

    let tag = match object.remove(TAG_FIELD) {
        None => return Err(MalformedEnvelope::MissingTag),
        Some(Value::String(tag)) => tag,
        Some(other) => return Err(MalformedEnvelope::InvalidTag(other)),
    };

    let payload = object.remove(PAYLOAD_FIELD).unwrap_or(Value::Null);
    Ok((tag, payload))
}

fn payload_as<T: DeserializeOwned>(
    message_type: &'static str,
    payload: Value,
) -> Result<T, MalformedEnvelope> {
    serde_json::from_value(payload).map_err(|source| MalformedEnvelope::PayloadMismatch {
        message_type,
        source,
    })
}
