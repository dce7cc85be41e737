//! Wire codec seam.
//!
//! The transport treats envelopes as opaque: it hands a request object to
//! [`Codec::serialize`] and raw socket bytes to [`Codec::read_response`].
//! The default [`RpcCodec`] speaks JSON in text mode and MsgPack in binary
//! mode.
//!
//! **CRITICAL** for the binary mode: always `to_vec_named`, never `to_vec`.
//! The store's decoder expects struct-as-map format; positional arrays will
//! not deserialize on the other end.

use bytes::Bytes;
use serde_json::Value;

use crate::error::Result;
use crate::protocol::Response;

/// Serializer/deserializer for wire envelopes.
///
/// `binary` selects the envelope encoding; the `hello` exchange is always
/// performed with `binary = false` and the ack decides the mode for the rest
/// of the session.
pub trait Codec: Send + Sync {
    /// Encode a request envelope (`{method, params, id, ...}`).
    fn serialize(&self, request: &Value, binary: bool) -> Result<Bytes>;

    /// Decode an inbound envelope.
    fn read_response(&self, data: &[u8], binary: bool) -> Result<Response>;
}

/// Default codec: JSON text envelopes, MsgPack (struct-as-map) binary
/// envelopes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RpcCodec;

impl Codec for RpcCodec {
    fn serialize(&self, request: &Value, binary: bool) -> Result<Bytes> {
        let bytes = if binary {
            // CRITICAL: to_vec_named, NOT to_vec!
            rmp_serde::to_vec_named(request)?
        } else {
            serde_json::to_vec(request)?
        };
        Ok(Bytes::from(bytes))
    }

    fn read_response(&self, data: &[u8], binary: bool) -> Result<Response> {
        if binary {
            Ok(rmp_serde::from_slice(data)?)
        } else {
            Ok(serde_json::from_slice(data)?)
        }
    }
}
