//! Pluggable serialization of wire envelopes.
//!
//! A [`Codec`] turns [`Request`]/[`Response`] envelopes into frame payloads
//! and back. Both ends of a pipe must agree on the codec; the pool and the
//! bundled worker binary default to [`Bincode`].
//!
//! Typed argument and return payloads are encoded at the submission boundary
//! with [`to_payload`]/[`from_payload`] and travel inside the envelope as
//! raw bytes, so the envelope codec never needs to know user types.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::proto::{Request, Response};

/// Errors from envelope or payload (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Bi-directional serialization of wire envelopes.
pub trait Codec: Send + Sync + 'static {
    fn encode_request(&self, req: &Request) -> Result<Vec<u8>, CodecError>;
    fn decode_request(&self, bytes: &[u8]) -> Result<Request, CodecError>;
    fn encode_response(&self, res: &Response) -> Result<Vec<u8>, CodecError>;
    fn decode_response(&self, bytes: &[u8]) -> Result<Response, CodecError>;
}

/// Default codec: compact, non-self-describing `bincode`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Bincode;

impl Codec for Bincode {
    fn encode_request(&self, req: &Request) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(req).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_request(&self, bytes: &[u8]) -> Result<Request, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode_response(&self, res: &Response) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(res).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<Response, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Encode a typed value into an argument/return payload.
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a typed value from an argument/return payload.
pub fn from_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
