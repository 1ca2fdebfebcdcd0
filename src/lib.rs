//! peerload - a BitTorrent transfer engine
//!
//! Decodes metainfo, talks the peer wire protocol, verifies pieces and
//! writes them to disk, driven by a small interactive console.

pub mod bencode;
pub mod cli;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use bencode::{Dict, Value};
pub use cli::{parse_command, CliArgs, Command, Config, ProgressDisplay};
pub use peer::{ConnectionConfig, ConnectionState, PeerConnection, PeerHandle};
pub use protocol::{Handshake, Message, MessageId};
pub use session::{Client, SessionConfig, TorrentSession, TorrentStatus};
pub use storage::{PiecePlan, PieceStore};
pub use torrent::{TorrentInfo, TorrentParser};
pub use tracker::{AnnounceRequest, AnnounceResponse, PeerAddr, Tracker};
#[cfg(feature = "download")]
pub use tracker::HttpTracker;
