//! Wire framing: `<u32 opcode><u32 length><payload[length]>`.
//!
//! `WireCodec` is a tokio-util codec so the connection manager can run
//! it through `Framed` and split the stream into independent reader and
//! writer halves. Decoding keeps the opcode raw — an unknown opcode is
//! a per-message problem for the dispatcher (warn and drop), not a
//! stream-poisoning decode error.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::PrismError;
use crate::opcode::Opcode;
use crate::{FRAME_HEADER_LENGTH, MAX_PAYLOAD_SIZE};

/// One framed protocol message.
#[derive(Debug, Clone)]
pub struct Message {
    opcode: u32,
    payload: Bytes,
}

impl Message {
    /// Build an outbound message with a typed opcode.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: opcode as u32,
            payload: payload.into(),
        }
    }

    /// Raw opcode as carried on the wire.
    pub fn raw_opcode(&self) -> u32 {
        self.opcode
    }

    /// Typed opcode, failing on values outside the protocol table.
    pub fn opcode(&self) -> Result<Opcode, PrismError> {
        Opcode::try_from(self.opcode)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Length-delimited frame codec for the bridge protocol.
#[derive(Debug, Default)]
pub struct WireCodec;

impl tokio_util::codec::Decoder for WireCodec {
    type Item = Message;
    type Error = PrismError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LENGTH {
            return Ok(None);
        }

        let opcode = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let length = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;

        // A corrupt length field is unrecoverable: there is no resync
        // marker in the framing, so the session must end.
        if length > MAX_PAYLOAD_SIZE {
            return Err(PrismError::FrameTooLarge {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < FRAME_HEADER_LENGTH + length {
            // Reserve to avoid repeated reallocation while the rest of
            // a large frame trickles in.
            src.reserve(FRAME_HEADER_LENGTH + length - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LENGTH);
        let payload = src.split_to(length).freeze();

        Ok(Some(Message { opcode, payload }))
    }
}

impl tokio_util::codec::Encoder<Message> for WireCodec {
    type Error = PrismError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), PrismError> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PrismError::FrameTooLarge {
                size: item.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        dst.reserve(FRAME_HEADER_LENGTH + item.payload.len());
        dst.put_u32_le(item.opcode);
        dst.put_u32_le(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
