//! Encoder and buffered decoder for relay frames.

use crate::error::ProtocolError;
use crate::frame::{
    InboundFrame, InboundHeader, OutboundFrame, SessionId, INBOUND_HEADER_SIZE,
    OUTBOUND_HEADER_SIZE,
};
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Bytes, BytesMut};

/// Encodes frames for the wire.
pub struct Encoder;

impl Encoder {
    /// Encodes a client-side inbound frame.
    pub fn encode_inbound(session: SessionId, payload: &[u8]) -> Result<BytesMut, ProtocolError> {
        InboundFrame::new(session, Bytes::copy_from_slice(payload)).encode()
    }

    /// Encodes every payload as its own outbound frame, in order, into a
    /// single contiguous buffer.
    pub fn encode_batch(payloads: &[Bytes]) -> Result<Bytes, ProtocolError> {
        let total: usize = payloads
            .iter()
            .map(|p| OUTBOUND_HEADER_SIZE + p.len())
            .sum();
        let mut buf = BytesMut::with_capacity(total);
        for payload in payloads {
            OutboundFrame::new(payload.clone()).encode_into(&mut buf)?;
        }
        Ok(buf.freeze())
    }
}

/// Accumulates bytes read from a socket and yields complete frames.
pub struct Decoder {
    buffer: BytesMut,
    max_payload: u32,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Creates a decoder that rejects frames announcing more than
    /// `max_payload` bytes.
    pub fn with_max_payload(max_payload: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_payload,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next inbound frame.
    pub fn decode_inbound(&mut self) -> Result<Option<InboundFrame>, ProtocolError> {
        InboundFrame::decode(&mut self.buffer, self.max_payload)
    }

    /// Attempts to decode the next outbound frame.
    pub fn decode_outbound(&mut self) -> Result<Option<OutboundFrame>, ProtocolError> {
        OutboundFrame::decode(&mut self.buffer, self.max_payload)
    }

    /// Checks the buffer at end of stream: leftover bytes mean the peer
    /// closed in the middle of an inbound frame.
    pub fn finish_inbound(&self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let wanted = match InboundHeader::parse(&self.buffer) {
            Some(header) => INBOUND_HEADER_SIZE + header.payload_len as usize,
            None => INBOUND_HEADER_SIZE,
        };
        Err(ProtocolError::IncompleteFrame {
            needed: wanted.saturating_sub(self.buffer.len()),
        })
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
