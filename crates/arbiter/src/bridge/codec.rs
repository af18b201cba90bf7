//! Framed codecs for client-arbiter communication.
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON body.
//! `JsonCodec` is strict: a body that does not parse ends the stream.
//! `ValidatingCodec` is what the server reads with: a well-framed body that
//! fails validation is yielded as a [`MalformedMessage`] so the connection
//! can stay open and the client gets an error response.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::RequestId;

/// Upper bound on a single frame. Control messages are tiny; anything near
/// this is a confused or hostile peer.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

fn framing() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: framing(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// A frame that was delimited correctly but is not a valid message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedMessage {
    /// Recovered from the body when it was at least a JSON object with a numeric `request_id`.
    pub request_id: Option<RequestId>,
    pub reason: String,
}

/// Decoder that reports shape errors per frame instead of failing the stream.
///
/// Framing errors (oversized frame, truncated stream) are still fatal: after
/// one of those there is no reliable frame boundary to resume from.
pub struct ValidatingCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for ValidatingCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ValidatingCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: framing(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for ValidatingCodec<T> {
    type Item = Result<T, MalformedMessage>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(bytes) = self.inner.decode(src)? else {
            return Ok(None);
        };

        let value: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                return Ok(Some(Err(MalformedMessage {
                    request_id: None,
                    reason: format!("invalid JSON: {e}"),
                })));
            }
        };

        let request_id = value
            .get("request_id")
            .and_then(serde_json::Value::as_u64)
            .map(RequestId::new);

        match serde_json::from_value(value) {
            Ok(item) => Ok(Some(Ok(item))),
            Err(e) => Ok(Some(Err(MalformedMessage {
                request_id,
                reason: e.to_string(),
            }))),
        }
    }
}
