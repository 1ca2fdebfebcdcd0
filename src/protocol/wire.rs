//! Wire protocol utilities
//!
//! Splits a raw byte stream into handshakes and messages. TCP gives no
//! message boundaries, so a read may end in the middle of a unit; the
//! unconsumed tail is handed back to be prepended to the next read.

use anyhow::Result;
use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use super::handshake::{Handshake, HANDSHAKE_LENGTH};
use super::message::Message;
use crate::error::TorrentError;

/// Largest message body accepted: a 1 MiB block plus the piece header
pub const MAX_MESSAGE_LENGTH: usize = (1 << 20) + 13;

/// One unit decoded from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Handshake(Handshake),
    Message(Message),
}

/// Decode every complete unit at the front of `data`.
///
/// Returns the decoded frames and the trailing bytes that do not yet form a
/// complete unit.
pub fn parse_stream(data: &[u8]) -> Result<(Vec<Frame>, Vec<u8>)> {
    let mut frames = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let rest = &data[pos..];

        if Handshake::is_prefix(rest) {
            if rest.len() < HANDSHAKE_LENGTH {
                break;
            }
            frames.push(Frame::Handshake(Handshake::deserialize(&rest[..HANDSHAKE_LENGTH])?));
            pos += HANDSHAKE_LENGTH;
            continue;
        }

        match split_message(rest)? {
            Some((body, consumed)) => {
                frames.push(Frame::Message(Message::from_body(body)?));
                pos += consumed;
            }
            None => break,
        }
    }

    trace!("Parsed {} frames, {} bytes left over", frames.len(), data.len() - pos);
    Ok((frames, data[pos..].to_vec()))
}

/// Body of the first length-prefixed message and the bytes it spans, or
/// `None` if it is not complete yet.
fn split_message(data: &[u8]) -> Result<Option<(&[u8], usize)>> {
    if data.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length > MAX_MESSAGE_LENGTH {
        return Err(TorrentError::format_error_with_source(
            "Message length exceeds limit",
            format!("{} > {}", length, MAX_MESSAGE_LENGTH),
        )
        .into());
    }

    if data.len() < 4 + length {
        return Ok(None);
    }
    Ok(Some((&data[4..4 + length], 4 + length)))
}

/// Carries unconsumed bytes between reads of one connection
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: BytesMut,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes and decode whatever is now complete
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.pending.extend_from_slice(data);
        let (frames, rest) = parse_stream(&self.pending)?;
        let consumed = self.pending.len() - rest.len();
        self.pending.advance(consumed);
        if !self.pending.is_empty() {
            debug!("Holding {} bytes of an incomplete unit", self.pending.len());
        }
        Ok(frames)
    }

    /// Bytes waiting for the rest of their unit
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Piece indices set in a bitfield, most significant bit of byte 0 first
pub fn decode_bitfield(bitfield: &[u8]) -> Vec<u32> {
    let mut indices = Vec::new();
    for (byte_index, byte) in bitfield.iter().enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                indices.push((byte_index * 8 + bit) as u32);
            }
        }
    }
    indices
}

/// Pack piece indices into a bitfield of `piece_count` bits.
///
/// Spare bits in the last byte stay zero; out-of-range indices are dropped.
pub fn encode_bitfield<I: IntoIterator<Item = u32>>(indices: I, piece_count: usize) -> Vec<u8> {
    let mut bitfield = vec![0u8; piece_count.div_ceil(8)];
    for index in indices {
        let index = index as usize;
        if index < piece_count {
            bitfield[index / 8] |= 0x80 >> (index % 8);
        }
    }
    bitfield
}
