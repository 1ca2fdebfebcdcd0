//! BitTorrent protocol messages
//!
//! Defines the typed messages exchanged after the handshake and their
//! `[u32 length][u8 id][payload]` encoding.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{error, trace};

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            20 => Ok(MessageId::Extended),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(TorrentError::format_error_with_source("Unknown message ID", format!("value: {}", value)).into())
            }
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
    /// Extension protocol message, payload passed through untouched
    Extended { payload: Vec<u8> },
}

/// Build a raw length-prefixed message. `None` for `id` builds a keep-alive.
pub fn build_message(id: Option<MessageId>, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    match id {
        Some(id) => {
            buf.put_u32(1 + payload.len() as u32);
            buf.put_u8(id as u8);
            buf.put_slice(payload);
        }
        None => buf.put_u32(0),
    }
    buf.to_vec()
}

impl Message {
    /// Get the message ID (None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::Extended { .. } => Some(MessageId::Extended),
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            Message::Extended { payload } => buf.put_slice(payload),
        }
        buf.to_vec()
    }

    /// Serialize the message to bytes, including the length prefix
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing message: {:?}", self.message_id());
        build_message(self.message_id(), &self.payload())
    }

    /// Decode the body of a message: everything after the length prefix.
    ///
    /// An empty body is a keep-alive.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let message_id = MessageId::try_from(body[0])?;
        let mut payload = &body[1..];

        let message = match message_id {
            MessageId::Choke => {
                expect_len(message_id, payload, 0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect_len(message_id, payload, 0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect_len(message_id, payload, 0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect_len(message_id, payload, 0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect_len(message_id, payload, 4)?;
                Message::Have { piece_index: payload.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: payload.to_vec() },
            MessageId::Request | MessageId::Cancel => {
                expect_len(message_id, payload, 12)?;
                let index = payload.get_u32();
                let begin = payload.get_u32();
                let length = payload.get_u32();
                if message_id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(short_payload(message_id, payload.len(), 8));
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece { index, begin, block: payload.to_vec() }
            }
            MessageId::Port => {
                expect_len(message_id, payload, 2)?;
                Message::Port { listen_port: payload.get_u16() }
            }
            MessageId::Extended => Message::Extended { payload: payload.to_vec() },
        };

        trace!("Decoded message: {:?}", message.message_id());
        Ok(message)
    }

    /// Deserialize a complete message, including its length prefix
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(TorrentError::format_error("Message shorter than its length prefix").into());
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() - 4 != length {
            return Err(TorrentError::format_error_with_source(
                "Wrong message length",
                format!("prefix says {}, got {}", length, data.len() - 4),
            )
            .into());
        }
        Self::from_body(&data[4..])
    }
}

fn expect_len(id: MessageId, payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(short_payload(id, payload.len(), expected));
    }
    Ok(())
}

fn short_payload(id: MessageId, got: usize, expected: usize) -> anyhow::Error {
    TorrentError::format_error_with_source(
        format!("Malformed {:?} message", id),
        format!("expected {} payload bytes, got {}", expected, got),
    )
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_choke() {
        assert_eq!(Message::Choke.serialize(), vec![0, 0, 0, 1, 0]);
        assert_eq!(build_message(Some(MessageId::Choke), &[]), vec![0, 0, 0, 1, 0]);
    }

    #[test]
    fn test_build_keepalive() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&[0, 0, 0, 0]).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_request_layout() {
        let bytes = Message::Request { index: 1, begin: 16384, length: 16384 }.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]);
    }

    #[test]
    fn test_piece_message() {
        let message = Message::Piece { index: 10, begin: 0, block: vec![1, 2, 3, 4, 5] };
        let serialized = message.serialize();
        assert_eq!(&serialized[..5], &[0, 0, 0, 14, 7]);
        assert_eq!(Message::deserialize(&serialized).unwrap(), message);
    }

    #[test]
    fn test_extended_passes_through() {
        let message = Message::Extended { payload: vec![0, b'd', b'e'] };
        let serialized = message.serialize();
        assert_eq!(serialized[4], 20);
        assert_eq!(Message::deserialize(&serialized).unwrap(), message);
    }

    #[test]
    fn test_unknown_id_is_format_error() {
        let err = Message::from_body(&[42]).unwrap_err();
        let err = err.downcast_ref::<TorrentError>().unwrap();
        assert!(err.is_format());
    }

    #[test]
    fn test_short_payloads_rejected() {
        assert!(Message::from_body(&[4, 0, 0]).is_err());
        assert!(Message::from_body(&[6, 0, 0, 0, 1]).is_err());
        assert!(Message::from_body(&[7, 0, 0, 0, 1, 0, 0]).is_err());
        assert!(Message::from_body(&[9, 1]).is_err());
    }

    #[test]
    fn test_wrong_length_prefix() {
        assert!(Message::deserialize(&[0, 0, 0, 5, 0]).is_err());
    }

    #[test]
    fn test_message_id_from_u8() {
        assert_eq!(MessageId::try_from(0).unwrap(), MessageId::Choke);
        assert_eq!(MessageId::try_from(9).unwrap(), MessageId::Port);
        assert_eq!(MessageId::try_from(20).unwrap(), MessageId::Extended);
        assert!(MessageId::try_from(10).is_err());
    }
}
