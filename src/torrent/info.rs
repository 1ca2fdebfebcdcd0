//! Torrent information structures
//!
//! Typed view of a decoded metainfo file.

use anyhow::Result;
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// A file entry of a torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path segments relative to the download root (e.g. ["folder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

impl TorrentFile {
    /// Path segments joined with '/'
    pub fn display_path(&self) -> String {
        self.path.join("/")
    }
}

/// How the content is laid out on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLayout {
    /// One file named after the torrent
    Single { length: u64 },
    /// Several files, each under its own relative path
    Multiple { files: Vec<TorrentFile> },
}

/// Torrent metadata
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Tracker announce URL
    pub announce: String,
    /// SHA1 hash of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes (the last piece may be shorter)
    pub piece_length: u64,
    /// Expected SHA1 hash of every piece, in order
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name
    pub name: String,
    /// Single- or multi-file layout
    pub layout: FileLayout,
}

impl TorrentInfo {
    /// Total size of all files in the torrent
    pub fn total_length(&self) -> u64 {
        match &self.layout {
            FileLayout::Single { length } => *length,
            FileLayout::Multiple { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Files in torrent order. A single-file torrent yields one entry
    /// named after the torrent.
    pub fn files(&self) -> Vec<TorrentFile> {
        match &self.layout {
            FileLayout::Single { length } => vec![TorrentFile {
                path: vec![self.name.clone()],
                length: *length,
            }],
            FileLayout::Multiple { files } => files.clone(),
        }
    }

    pub fn is_multi_file(&self) -> bool {
        matches!(self.layout, FileLayout::Multiple { .. })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Generate the info hash from the encoded info dictionary
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Split the concatenated `pieces` field into 20-byte hashes
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::format_error(format!(
                "Pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            ))
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Byte range `[start, end)` of a piece within the concatenated content
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = (index as u64) * self.piece_length;
        let end = std::cmp::min(start + self.piece_length, self.total_length());
        Some((start, end))
    }

    /// Length in bytes of a piece
    pub fn piece_size(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }
}
