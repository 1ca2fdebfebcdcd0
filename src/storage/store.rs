//! Piece store
//!
//! Owns the files of one download, the state of every piece, and the
//! piece-to-file mapping. Verified pieces are committed here; the presence
//! bitmap is persisted next to the data so a restart resumes where it left
//! off.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::protocol::encode_bitfield;
use crate::storage::file::{map_pieces, FileEntry, FileSegment};
use crate::storage::piece::{Piece, PiecePlan};
use crate::storage::resume::{ResumeData, RESUME_FILE_NAME};
use crate::torrent::TorrentInfo;

/// On-disk state of one download
#[derive(Debug)]
pub struct PieceStore {
    info_hash: [u8; 20],
    root_dir: PathBuf,
    piece_length: u64,
    total_length: u64,
    pieces: Vec<Piece>,
    files: Vec<FileEntry>,
    mapping: Vec<Vec<FileSegment>>,
    plan: Arc<PiecePlan>,
    closed: bool,
}

impl PieceStore {
    /// Create or reopen the files of `info` under `root_dir` and restore the
    /// persisted presence bitmap.
    pub async fn open(info: &TorrentInfo, root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        info!("Opening piece store for '{}' in {}", info.name, root_dir.display());

        fs::create_dir_all(&root_dir).await.map_err(|e| {
            error!("Failed to create download directory '{}': {}", root_dir.display(), e);
            TorrentError::storage_error_full("Failed to create download directory", root_dir.display().to_string(), e.to_string())
        })?;

        let torrent_files = info.files();
        let mut files = Vec::with_capacity(torrent_files.len());
        for torrent_file in &torrent_files {
            files.push(FileEntry::open(&root_dir, torrent_file).await?);
        }

        let mut pieces = Vec::with_capacity(info.piece_count());
        for (index, hash) in info.pieces.iter().enumerate() {
            let size = info.piece_size(index).unwrap_or(0);
            let length = u32::try_from(size)
                .map_err(|_| TorrentError::format_error(format!("Piece {} is too large ({} bytes)", index, size)))?;
            pieces.push(Piece::new(index as u32, length, *hash));
        }

        let file_lengths: Vec<u64> = files.iter().map(|f| f.length).collect();
        let piece_lengths: Vec<u64> = pieces.iter().map(|p| p.length as u64).collect();
        let mapping = map_pieces(&file_lengths, &piece_lengths);
        let plan = Arc::new(PiecePlan::new(&pieces));

        let mut store = Self {
            info_hash: info.info_hash,
            root_dir,
            piece_length: info.piece_length,
            total_length: info.total_length(),
            pieces,
            files,
            mapping,
            plan,
            closed: false,
        };
        store.restore_bitmap().await;

        info!(
            "Piece store ready: {} files, {} pieces, {} already present",
            store.files.len(),
            store.pieces.len(),
            store.pieces.iter().filter(|p| p.have).count()
        );
        Ok(store)
    }

    /// Block layout shared with peer connections
    pub fn plan(&self) -> Arc<PiecePlan> {
        Arc::clone(&self.plan)
    }

    /// Select files to download: all of them for `None`, otherwise the
    /// listed 0-based indices. Out-of-range indices are ignored.
    pub fn mark_files_for_download(&mut self, selection: Option<&[usize]>) {
        match selection {
            None => self.files.iter_mut().for_each(|f| f.skip = false),
            Some(indices) => {
                for &index in indices {
                    match self.files.get_mut(index) {
                        Some(file) => file.skip = false,
                        None => warn!("Ignoring file index {} (only {} files)", index, self.files.len()),
                    }
                }
            }
        }
        debug!(
            "Selected files: {:?}",
            self.files.iter().enumerate().filter(|(_, f)| !f.skip).map(|(i, _)| i).collect::<Vec<_>>()
        );
    }

    /// True if any file the piece overlaps is skipped
    pub fn piece_is_skippable(&self, index: u32) -> bool {
        self.mapping
            .get(index as usize)
            .map_or(true, |segments| segments.iter().any(|s| self.files[s.file_index].skip))
    }

    /// Write verified piece data to its file segments.
    ///
    /// Returns `Ok(false)` without touching the disk if the piece is already
    /// present.
    pub async fn write_piece(&mut self, index: u32, data: &[u8]) -> Result<bool> {
        let piece = self
            .pieces
            .get(index as usize)
            .ok_or_else(|| TorrentError::verification_error("No such piece", index))?;
        if piece.have {
            trace!("Piece {} already present, not rewriting", index);
            return Ok(false);
        }
        if self.closed {
            return Err(TorrentError::storage_error_full(
                "Piece store is closed",
                self.root_dir.display().to_string(),
                format!("write of piece {}", index),
            )
            .into());
        }
        if data.len() != piece.length as usize {
            return Err(TorrentError::verification_error(
                format!("Expected {} bytes, got {}", piece.length, data.len()),
                index,
            )
            .into());
        }

        let mut written = 0usize;
        for segment in &self.mapping[index as usize] {
            let end = written + segment.length as usize;
            self.files[segment.file_index].write_at(segment.begin, &data[written..end]).await?;
            written = end;
        }

        self.pieces[index as usize].have = true;
        debug!("Piece {} written ({} bytes)", index, data.len());
        Ok(true)
    }

    /// Compare a computed digest with the expected hash of a piece
    pub fn hash_matches(&self, index: u32, hash: &[u8; 20]) -> bool {
        self.pieces.get(index as usize).map_or(false, |p| p.hash == *hash)
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.pieces.get(index as usize).map_or(false, |p| p.have)
    }

    /// One presence flag per piece
    pub fn bitmap(&self) -> Vec<bool> {
        self.pieces.iter().map(|p| p.have).collect()
    }

    /// Presence bitmap packed for the wire
    pub fn bitfield(&self) -> Vec<u8> {
        let present = self.pieces.iter().filter(|p| p.have).map(|p| p.index);
        encode_bitfield(present, self.pieces.len())
    }

    fn resume_path(&self) -> PathBuf {
        self.root_dir.join(RESUME_FILE_NAME)
    }

    pub async fn persist_bitmap(&self) -> Result<()> {
        ResumeData::from_bitmap(&self.info_hash, &self.bitmap())
            .save(&self.resume_path())
            .await
    }

    pub async fn restore_bitmap(&mut self) {
        let have = ResumeData::restore(&self.resume_path(), &self.info_hash, self.pieces.len()).await;
        for (piece, present) in self.pieces.iter_mut().zip(have) {
            piece.have = present;
        }
    }

    /// Total bytes of pieces present on disk
    pub fn downloaded_bytes(&self) -> u64 {
        self.pieces.iter().filter(|p| p.have).map(|p| p.length as u64).sum()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Stamp a piece as handed out to a peer
    pub fn mark_requested(&mut self, index: u32, at: Instant) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            piece.requested = Some(at);
        }
    }

    /// Pieces worth requesting at `now`: absent, in a selected file, and not
    /// requested within `timeout`
    pub fn wanted_pieces(&self, now: Instant, timeout: Duration) -> Vec<u32> {
        self.pieces
            .iter()
            .filter(|p| !p.have && p.request_due(now, timeout) && !self.piece_is_skippable(p.index))
            .map(|p| p.index)
            .collect()
    }

    /// Sync and close every file. Later writes fail.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for file in &mut self.files {
            file.close().await?;
        }
        self.closed = true;
        info!("Closed files in {}", self.root_dir.display());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
