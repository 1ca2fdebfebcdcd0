//! Session module
//!
//! Per-torrent download orchestration and the client that owns the sessions.

pub mod client;
pub mod config;
pub mod torrent;

pub use client::Client;
pub use config::{SessionConfig, DEFAULT_PORT};
pub use torrent::{TorrentSession, TorrentStatus};
