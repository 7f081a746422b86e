//! JSON framing for [`Envelope`]s.
//!
//! One envelope per binary frame. The encoding is self-describing so either
//! side can log undecodable frames verbatim.

use bytes::Bytes;

use crate::envelope::Envelope;
use crate::errors::CodecError;

/// Serialize an envelope into a frame body.
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Parse a frame body into an envelope.
pub fn decode(frame: &[u8]) -> Result<Envelope, CodecError> {
    serde_json::from_slice(frame).map_err(|e| CodecError::Decode(e.to_string()))
}
