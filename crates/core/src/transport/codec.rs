//! Message encoder, frame decoder and message decoder stages.
//!
//! Frames are a 4 byte big-endian length followed by a prost encoded
//! [TransportMessage]. The length does not include itself.

use bytes::{Bytes, BytesMut};
use shuffle_api::{protocol::TransportMessage, ShuffleError, ShuffleResult};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Outbound stage: turns a message into frame payload bytes.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MessageEncoder;

impl MessageEncoder {
    pub fn encode(&self, msg: &TransportMessage) -> ShuffleResult<Bytes> {
        let mut out = BytesMut::with_capacity(msg.body.len() + 16);
        msg.encode_to(&mut out)?;
        Ok(out.freeze())
    }
}

/// Inbound stage: turns one complete frame payload into a message.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MessageDecoder;

impl MessageDecoder {
    pub fn decode(&self, frame: Bytes) -> ShuffleResult<TransportMessage> {
        TransportMessage::decode_from(frame)
    }
}

/// Construct the frame decoder stage. Frames larger than `max_frame_bytes`
/// are rejected in both directions.
pub(crate) fn create_frame_decoder(
    max_frame_bytes: usize,
) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

/// The three byte-level stages of a connection pipeline, in order.
#[derive(Debug)]
pub(crate) struct TransportCodec {
    encoder: MessageEncoder,
    frame_decoder: LengthDelimitedCodec,
    decoder: MessageDecoder,
}

impl TransportCodec {
    pub fn new(
        encoder: MessageEncoder,
        frame_decoder: LengthDelimitedCodec,
        decoder: MessageDecoder,
    ) -> Self {
        Self {
            encoder,
            frame_decoder,
            decoder,
        }
    }
}

impl Decoder for TransportCodec {
    type Item = TransportMessage;
    type Error = ShuffleError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        let frame = self.frame_decoder.decode(src).map_err(|err| {
            ShuffleError::other(format!("inbound frame rejected: {err}"))
        })?;
        match frame {
            Some(frame) => self.decoder.decode(frame.freeze()).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<TransportMessage> for TransportCodec {
    type Error = ShuffleError;

    fn encode(
        &mut self,
        item: TransportMessage,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let payload = self.encoder.encode(&item)?;
        self.frame_decoder.encode(payload, dst).map_err(|err| {
            ShuffleError::other(format!("outbound frame rejected: {err}"))
        })
    }
}
