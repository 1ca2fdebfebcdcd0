//! BitTorrent handshake protocol
//!
//! The 68-byte greeting both sides send before any other message.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total size of a handshake on the wire
pub const HANDSHAKE_LENGTH: usize = 68;

/// Client prefix of generated peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-PL0001-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved extension bytes, zero when we send
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a peer ID: the client prefix followed by 12 random ASCII digits
    pub fn generate_peer_id() -> [u8; 20] {
        let mut rng = rand::thread_rng();
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        for byte in &mut peer_id[8..] {
            *byte = b'0' + rng.gen_range(0..10u8);
        }
        info!("Generated new peer ID: {}", String::from_utf8_lossy(&peer_id));
        peer_id
    }

    /// Whether `data` could be the start of a handshake.
    ///
    /// True when every available byte agrees with the fixed
    /// length-and-protocol-name header, even if fewer than 20 bytes are
    /// present yet.
    pub fn is_prefix(data: &[u8]) -> bool {
        if data.is_empty() || data[0] != PROTOCOL_LENGTH {
            return false;
        }
        let available = data.len().min(20) - 1;
        data[1..1 + available] == PROTOCOL_STRING[..available]
    }

    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing handshake");
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from exactly its first 68 bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() < HANDSHAKE_LENGTH {
            return Err(TorrentError::format_error_with_source(
                "Handshake data too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len()),
            )
            .into());
        }

        if data[0] != PROTOCOL_LENGTH || &data[1..20] != PROTOCOL_STRING {
            return Err(TorrentError::format_error("Invalid protocol header in handshake").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!(
            "Handshake info_hash: {}, peer_id: {}",
            hex::encode(info_hash),
            String::from_utf8_lossy(&peer_id)
        );
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Check the handshake is for the expected torrent
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }
        true
    }
}
