//! Piece and block bookkeeping
//!
//! A piece is the unit of verification; a block is the unit requested from a
//! peer. Blocks are 16 KiB except possibly the final block of a piece.

use sha1::{Digest, Sha1};
use std::time::{Duration, Instant};

/// Size of a requested block
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// A byte range within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Offset within the piece
    pub begin: u32,
    /// Length of the block
    pub length: u32,
}

/// Decompose a piece of `piece_length` bytes into blocks that tile it exactly
pub fn split_blocks(piece_length: u32) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(piece_length.div_ceil(BLOCK_SIZE) as usize);
    let mut begin = 0;
    while begin < piece_length {
        let length = BLOCK_SIZE.min(piece_length - begin);
        blocks.push(Block { begin, length });
        begin += length;
    }
    blocks
}

/// SHA1 digest of piece data
pub fn piece_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Download state of one piece
#[derive(Debug, Clone)]
pub struct Piece {
    /// Piece index
    pub index: u32,
    /// Expected SHA1 hash
    pub hash: [u8; 20],
    /// Piece length in bytes
    pub length: u32,
    /// Blocks tiling the piece
    pub blocks: Vec<Block>,
    /// Whether verified data for this piece is on disk
    pub have: bool,
    /// When the piece was last handed to a peer
    pub requested: Option<Instant>,
}

impl Piece {
    pub fn new(index: u32, length: u32, hash: [u8; 20]) -> Self {
        Self {
            index,
            hash,
            length,
            blocks: split_blocks(length),
            have: false,
            requested: None,
        }
    }

    /// Whether the piece may be requested at `now`: never requested, or the
    /// previous request is older than `timeout`
    pub fn request_due(&self, now: Instant, timeout: Duration) -> bool {
        match self.requested {
            None => true,
            Some(at) => now.saturating_duration_since(at) > timeout,
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// Immutable block layout of every piece, shared with peer connections so
/// they can tell when a piece is complete without locking the store
#[derive(Debug, Clone)]
pub struct PiecePlan {
    blocks: Vec<Vec<Block>>,
}

impl PiecePlan {
    pub fn new(pieces: &[Piece]) -> Self {
        Self {
            blocks: pieces.iter().map(|p| p.blocks.clone()).collect(),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self, index: u32) -> Option<&[Block]> {
        self.blocks.get(index as usize).map(Vec::as_slice)
    }

    /// Number of blocks that make up a piece
    pub fn block_count(&self, index: u32) -> Option<usize> {
        self.blocks(index).map(<[Block]>::len)
    }

    pub fn piece_length(&self, index: u32) -> Option<u32> {
        self.blocks(index).map(|b| b.iter().map(|block| block.length).sum())
    }
}
