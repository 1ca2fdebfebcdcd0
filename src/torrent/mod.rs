//! Torrent file handling module
//!
//! Parsing of .torrent metainfo files into typed metadata.

pub mod info;
pub mod parser;

pub use info::{FileLayout, TorrentFile, TorrentInfo};
pub use parser::TorrentParser;
