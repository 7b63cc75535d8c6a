//! # nfcrelay-protocol
//!
//! Wire protocol for the nfcrelay session relay.
//!
//! This crate provides:
//! - Inbound framing: 4-byte big-endian length, 1-byte session id, payload
//! - Outbound framing: 4-byte big-endian length, payload
//! - An incremental buffered decoder for both directions
//! - Protocol errors and constants

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;
pub use frame::{
    InboundFrame, InboundHeader, OutboundFrame, SessionId, INBOUND_HEADER_SIZE,
    OUTBOUND_HEADER_SIZE,
};

/// Default port for the relay server.
pub const DEFAULT_PORT: u16 = 5566;

/// Default maximum accepted payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
