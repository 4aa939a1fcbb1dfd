//! The wire envelope exchanged over transport connections.
//!
//! Application payloads are opaque bytes. The envelope only carries what
//! the channel handler needs to correlate responses with requests.

use crate::*;
use prost::Message;

/// One message on a transport connection.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TransportMessage {
    /// The kind of message.
    #[prost(enumeration = "transport_message::Ty", tag = "1")]
    pub ty: i32,
    /// Correlates a response or failure with its request.
    /// Zero for one-way messages.
    #[prost(uint64, tag = "2")]
    pub request_id: u64,
    /// Request or response payload, or the failure description.
    #[prost(bytes = "bytes", tag = "3")]
    pub body: bytes::Bytes,
}

/// Nested types for [TransportMessage].
pub mod transport_message {
    /// Message kinds.
    #[derive(
        Clone,
        Copy,
        Debug,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Ty {
        /// Unknown kinds decode to this and are ignored.
        Unspecified = 0,
        /// A request expecting a response or failure.
        Request = 1,
        /// A successful response.
        Response = 2,
        /// A failed response, the body is a utf8 error description.
        Failure = 3,
        /// A message that expects no response.
        OneWay = 4,
    }
}

pub use transport_message::Ty;

impl TransportMessage {
    /// Construct a request.
    pub fn request(request_id: u64, body: bytes::Bytes) -> Self {
        Self {
            ty: Ty::Request as i32,
            request_id,
            body,
        }
    }

    /// Construct a response.
    pub fn response(request_id: u64, body: bytes::Bytes) -> Self {
        Self {
            ty: Ty::Response as i32,
            request_id,
            body,
        }
    }

    /// Construct a failure.
    pub fn failure(request_id: u64, err: &ShuffleError) -> Self {
        Self {
            ty: Ty::Failure as i32,
            request_id,
            body: bytes::Bytes::copy_from_slice(err.to_string().as_bytes()),
        }
    }

    /// Construct a one-way message.
    pub fn one_way(body: bytes::Bytes) -> Self {
        Self {
            ty: Ty::OneWay as i32,
            request_id: 0,
            body,
        }
    }

    /// Encode into a byte buffer.
    pub fn encode_to(&self, buf: &mut bytes::BytesMut) -> ShuffleResult<()> {
        self.encode(buf).map_err(|err| {
            ShuffleError::other_src("Failed to encode TransportMessage", err)
        })
    }

    /// Decode from bytes.
    pub fn decode_from(data: bytes::Bytes) -> ShuffleResult<Self> {
        Self::decode(data).map_err(|err| {
            ShuffleError::other_src("Failed to decode TransportMessage", err)
        })
    }
}
