//! File storage module
//!
//! On-disk files of a download and the mapping from pieces to the file byte
//! ranges they cover.

use anyhow::Result;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, trace};

use crate::error::TorrentError;
use crate::torrent::TorrentFile;

/// One file of a download
#[derive(Debug)]
pub struct FileEntry {
    /// Open handle, `None` once the store is closed
    pub file: Option<fs::File>,
    /// Path relative to the download root
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Pieces touching a skipped file are not downloaded
    pub skip: bool,
}

impl FileEntry {
    /// Open (creating if needed) the file for `torrent_file` under `root_dir`.
    ///
    /// Existing content is kept so an interrupted download can resume; a file
    /// shorter than its declared length is extended.
    pub async fn open(root_dir: &Path, torrent_file: &TorrentFile) -> Result<Self> {
        let path: PathBuf = torrent_file.path.iter().collect();
        let full_path = root_dir.join(&path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                error!("Failed to create directory '{}': {}", parent.display(), e);
                TorrentError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
            })?;
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&full_path)
            .await
            .map_err(|e| {
                error!("Failed to open file '{}': {}", full_path.display(), e);
                TorrentError::storage_error_full("Failed to open file", full_path.display().to_string(), e.to_string())
            })?;

        let current = file.metadata().await?.len();
        if current < torrent_file.length {
            file.set_len(torrent_file.length).await.map_err(|e| {
                error!("Failed to set file length for '{}': {}", full_path.display(), e);
                TorrentError::storage_error_full("Failed to set file length", full_path.display().to_string(), e.to_string())
            })?;
        }

        debug!("Opened {} ({} bytes)", full_path.display(), torrent_file.length);
        Ok(Self {
            file: Some(file),
            path,
            length: torrent_file.length,
            skip: true,
        })
    }

    /// Write `data` at byte offset `pos` and flush
    pub async fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        let path = self.path.display().to_string();
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TorrentError::storage_error_full("File is closed", path.clone(), "write after close"))?;

        trace!("Writing {} bytes to {} at offset {}", data.len(), path, pos);
        file.seek(SeekFrom::Start(pos)).await.map_err(|e| {
            TorrentError::storage_error_full("Failed to seek in file", path.clone(), e.to_string())
        })?;
        file.write_all(data).await.map_err(|e| {
            TorrentError::storage_error_full("Failed to write to file", path.clone(), e.to_string())
        })?;
        file.flush().await.map_err(|e| {
            TorrentError::storage_error_full("Failed to flush file", path.clone(), e.to_string())
        })?;
        Ok(())
    }

    /// Flush to stable storage and release the handle
    pub async fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all().await.map_err(|e| {
                TorrentError::storage_error_full("Failed to sync file", self.path.display().to_string(), e.to_string())
            })?;
        }
        Ok(())
    }
}

/// Part of a piece that lands in one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSegment {
    /// Index into the file list
    pub file_index: usize,
    /// Offset within that file
    pub begin: u64,
    /// Number of bytes
    pub length: u64,
}

/// Map each piece onto the files it overlaps, in content order.
///
/// `piece_lengths` lists the length of every piece; the files are laid out
/// back to back in the order given. Zero-length files receive no segments.
pub fn map_pieces(file_lengths: &[u64], piece_lengths: &[u64]) -> Vec<Vec<FileSegment>> {
    let mut mapping = Vec::with_capacity(piece_lengths.len());
    let mut file_index = 0;
    let mut file_offset = 0u64;

    for &piece_length in piece_lengths {
        let mut segments = Vec::new();
        let mut left = piece_length;

        while left > 0 && file_index < file_lengths.len() {
            let available = file_lengths[file_index] - file_offset;
            if available == 0 {
                file_index += 1;
                file_offset = 0;
                continue;
            }

            let length = available.min(left);
            segments.push(FileSegment {
                file_index,
                begin: file_offset,
                length,
            });
            file_offset += length;
            left -= length;
        }

        mapping.push(segments);
    }

    mapping
}
