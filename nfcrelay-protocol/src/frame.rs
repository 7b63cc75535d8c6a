//! Binary frame formats.
//!
//! Inbound frames (client -> server) carry the session the sender wants to
//! publish on:
//!
//! ```text
//! +-------------+------------+-------------------+
//! | payload_len | session_id | payload           |
//! |   4 bytes   |   1 byte   | payload_len bytes |
//! +-------------+------------+-------------------+
//! ```
//!
//! Outbound frames (server -> client) omit the session byte; the receiver
//! already knows which session it belongs to:
//!
//! ```text
//! +-------------+-------------------+
//! | payload_len | payload           |
//! |   4 bytes   | payload_len bytes |
//! +-------------+-------------------+
//! ```
//!
//! All lengths are unsigned big-endian.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the inbound frame header in bytes (4 + 1).
pub const INBOUND_HEADER_SIZE: usize = 5;

/// Size of the outbound frame header in bytes.
pub const OUTBOUND_HEADER_SIZE: usize = 4;

/// Rendezvous key shared by the members of one relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u8);

impl SessionId {
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Session 0 cannot be used to establish a first association.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u8> for SessionId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed inbound header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundHeader {
    pub payload_len: u32,
    pub session: SessionId,
}

impl InboundHeader {
    /// Parses the header from the first [`INBOUND_HEADER_SIZE`] bytes of `buf`.
    ///
    /// Returns `None` if fewer bytes are available.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < INBOUND_HEADER_SIZE {
            return None;
        }
        Some(Self {
            payload_len: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            session: SessionId(buf[4]),
        })
    }

    pub fn to_bytes(&self) -> [u8; INBOUND_HEADER_SIZE] {
        let len = self.payload_len.to_be_bytes();
        [len[0], len[1], len[2], len[3], self.session.0]
    }
}

fn checked_len(payload: &[u8]) -> Result<u32, ProtocolError> {
    u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })
}

/// A frame sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Session the sender publishes on.
    pub session: SessionId,
    /// Opaque payload.
    pub payload: Bytes,
}

impl InboundFrame {
    pub fn new(session: impl Into<SessionId>, payload: impl Into<Bytes>) -> Self {
        Self {
            session: session.into(),
            payload: payload.into(),
        }
    }

    /// A zero-length frame asks the relay to drop the connection.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let payload_len = checked_len(&self.payload)?;
        let mut buf = BytesMut::with_capacity(INBOUND_HEADER_SIZE + self.payload.len());
        buf.put_u32(payload_len);
        buf.put_u8(self.session.0);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was consumed, `Ok(None)`
    /// if more data is needed, or `Err` if the announced payload exceeds
    /// `max_payload`. Nothing is consumed unless a full frame is available.
    pub fn decode(buf: &mut BytesMut, max_payload: u32) -> Result<Option<Self>, ProtocolError> {
        let header = match InboundHeader::parse(buf) {
            Some(header) => header,
            None => return Ok(None),
        };

        if header.payload_len > max_payload {
            return Err(ProtocolError::FrameTooLarge {
                size: header.payload_len as usize,
                max: max_payload as usize,
            });
        }

        let total_len = INBOUND_HEADER_SIZE + header.payload_len as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(INBOUND_HEADER_SIZE);
        let payload = buf.split_to(header.payload_len as usize).freeze();

        Ok(Some(Self {
            session: header.session,
            payload,
        }))
    }
}

/// A frame sent by the relay to a session member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub payload: Bytes,
}

impl OutboundFrame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload_len = checked_len(&self.payload)?;
        buf.reserve(OUTBOUND_HEADER_SIZE + self.payload.len());
        buf.put_u32(payload_len);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a frame from the front of `buf`. Same contract as
    /// [`InboundFrame::decode`].
    pub fn decode(buf: &mut BytesMut, max_payload: u32) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < OUTBOUND_HEADER_SIZE {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if payload_len > max_payload {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len as usize,
                max: max_payload as usize,
            });
        }

        let total_len = OUTBOUND_HEADER_SIZE + payload_len as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(OUTBOUND_HEADER_SIZE);
        let payload = buf.split_to(payload_len as usize).freeze();
        Ok(Some(Self { payload }))
    }
}
