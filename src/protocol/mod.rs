//! BitTorrent protocol module
//!
//! Implements the peer wire protocol: handshake, messages and stream framing.

pub mod handshake;
pub mod message;
pub mod wire;

pub use handshake::{Handshake, HANDSHAKE_LENGTH, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{build_message, Message, MessageId};
pub use wire::{decode_bitfield, encode_bitfield, parse_stream, Frame, StreamDecoder, MAX_MESSAGE_LENGTH};
