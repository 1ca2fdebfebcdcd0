//! Storage module
//!
//! Piece bookkeeping, file I/O, and resume data.

pub mod file;
pub mod piece;
pub mod resume;
pub mod store;

pub use file::{map_pieces, FileEntry, FileSegment};
pub use piece::{piece_digest, split_blocks, Block, Piece, PiecePlan, BLOCK_SIZE};
pub use resume::{ResumeData, RESUME_FILE_NAME};
pub use store::PieceStore;
