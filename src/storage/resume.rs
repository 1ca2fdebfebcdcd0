//! Resume data module
//!
//! Persists which pieces of a download are already on disk.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::TorrentError;
use crate::protocol::{decode_bitfield, encode_bitfield};

/// Name of the resume file inside a download's root directory
pub const RESUME_FILE_NAME: &str = "bitfield.json";

/// Resume record for one torrent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    /// Info hash as hex string
    pub info_hash: String,
    /// Number of pieces in the torrent
    pub piece_count: usize,
    /// Presence bits packed MSB-first, hex encoded
    pub bitmap: String,
}

impl ResumeData {
    pub fn from_bitmap(info_hash: &[u8; 20], have: &[bool]) -> Self {
        let indices = have.iter().enumerate().filter(|(_, h)| **h).map(|(i, _)| i as u32);
        Self {
            info_hash: hex::encode(info_hash),
            piece_count: have.len(),
            bitmap: hex::encode(encode_bitfield(indices, have.len())),
        }
    }

    /// Unpack into one flag per piece
    pub fn to_bitmap(&self) -> Result<Vec<bool>> {
        let packed = hex::decode(&self.bitmap)
            .map_err(|e| TorrentError::format_error_with_source("Resume bitmap is not hex", e.to_string()))?;
        if packed.len() != self.piece_count.div_ceil(8) {
            return Err(TorrentError::format_error("Resume bitmap length does not match piece count").into());
        }

        let mut have = vec![false; self.piece_count];
        for index in decode_bitfield(&packed) {
            if let Some(slot) = have.get_mut(index as usize) {
                *slot = true;
            }
        }
        Ok(have)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec(self)?;
        fs::write(path, data).await.map_err(|e| {
            TorrentError::storage_error_full("Failed to write resume data", path.display().to_string(), e.to_string())
        })?;
        debug!("Saved resume data to {}", path.display());
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TorrentError::storage_error_full(
                    "Failed to read resume data",
                    path.display().to_string(),
                    e.to_string(),
                )
                .into())
            }
        };
        Ok(Some(serde_json::from_slice(&data).map_err(TorrentError::from)?))
    }

    /// Load the presence bitmap for a torrent, falling back to all-absent
    /// when the record is missing, unreadable, or belongs to another torrent.
    pub async fn restore(path: &Path, info_hash: &[u8; 20], piece_count: usize) -> Vec<bool> {
        let empty = vec![false; piece_count];
        let record = match Self::load(path).await {
            Ok(Some(record)) => record,
            Ok(None) => return empty,
            Err(e) => {
                warn!("Ignoring unreadable resume data {}: {}", path.display(), e);
                return empty;
            }
        };

        if record.info_hash != hex::encode(info_hash) || record.piece_count != piece_count {
            warn!("Resume data {} does not match this torrent, ignoring", path.display());
            return empty;
        }

        match record.to_bitmap() {
            Ok(have) => have,
            Err(e) => {
                warn!("Ignoring corrupt resume data {}: {}", path.display(), e);
                empty
            }
        }
    }
}
