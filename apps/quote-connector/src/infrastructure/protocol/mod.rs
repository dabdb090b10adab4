//! Feed Protocol
//!
//! The message catalog and the JSON envelope codec shared by the client and
//! the in-memory feed server.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, JsonCodec, MalformedEnvelope};
pub use messages::*;
