//! Peer module
//!
//! Connection tasks and the state they share with a torrent session.

pub mod connection;
pub mod state;

pub use connection::{ConnectionConfig, PeerConnection};
pub use state::{BlockRequest, ChokeState, ConnectionState, PeerHandle};
