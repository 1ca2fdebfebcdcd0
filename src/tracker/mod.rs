//! Tracker module
//!
//! Announce types, response decoding and the tracker client seam.

pub mod announce;
#[cfg(feature = "download")]
pub mod http;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use announce::{parse_compact_peers, AnnounceEvent, AnnounceRequest, AnnounceResponse, PeerAddr, TrackerState};
#[cfg(feature = "download")]
pub use http::HttpTracker;

/// Something a session can announce to
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Announce and return the peers the tracker knows about
    async fn announce(&mut self, request: &AnnounceRequest) -> Result<Vec<PeerAddr>>;

    /// Re-announce interval, once a response has carried one
    fn interval(&self) -> Option<Duration>;
}
