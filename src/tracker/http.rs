//! HTTP tracker client

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, info};
use url::Url;

use crate::error::TorrentError;
use crate::tracker::{AnnounceRequest, AnnounceResponse, PeerAddr, Tracker, TrackerState};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Announces to a single HTTP(S) tracker
pub struct HttpTracker {
    client: reqwest::Client,
    url: Url,
    state: TrackerState,
}

impl HttpTracker {
    pub fn new(announce: &str) -> Result<Self> {
        let url = Url::parse(announce).map_err(|e| {
            error!("Invalid announce URL '{}': {}", announce, e);
            TorrentError::tracker_error_with_source(format!("Invalid announce URL '{}'", announce), e.to_string())
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(TorrentError::tracker_error(format!("Unsupported tracker scheme '{}'", url.scheme())).into());
        }

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| TorrentError::tracker_error_with_source("Failed to build HTTP client", e.to_string()))?;

        Ok(Self {
            client,
            url,
            state: TrackerState::default(),
        })
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    /// Full announce URL for a request
    pub fn announce_url(&self, request: &AnnounceRequest) -> String {
        let separator = if self.url.query().is_some() { '&' } else { '?' };
        format!("{}{}{}", self.url, separator, build_query(request, self.state.tracker_id.as_deref()))
    }
}

/// Query string for an announce, binary fields percent-encoded
pub fn build_query(request: &AnnounceRequest, tracker_id: Option<&str>) -> String {
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        urlencoding::encode_binary(&request.info_hash),
        urlencoding::encode_binary(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
    );
    if let Some(event) = request.event {
        query.push_str("&event=");
        query.push_str(event.as_str());
    }
    if let Some(id) = tracker_id {
        query.push_str("&trackerid=");
        query.push_str(&urlencoding::encode(id));
    }
    query
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn announce(&mut self, request: &AnnounceRequest) -> Result<Vec<PeerAddr>> {
        let url = self.announce_url(request);
        debug!("Announcing to {}", self.url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            TorrentError::tracker_error_with_source(format!("Announce to {} failed", self.url), e.to_string())
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::tracker_error(format!("Tracker {} answered {}", self.url, status)).into());
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TorrentError::tracker_error_with_source("Failed to read tracker response", e.to_string()))?;

        let decoded = AnnounceResponse::from_bencode(&body)?;
        self.state.update(&decoded);
        info!("Tracker {} returned {} peers", self.url, decoded.peers.len());
        Ok(decoded.peers)
    }

    fn interval(&self) -> Option<Duration> {
        self.state.interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::AnnounceEvent;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0xAB; 20],
            peer_id: *b"-PL0001-123456789012",
            port: 57893,
            uploaded: 0,
            downloaded: 16384,
            left: 100,
            event: Some(AnnounceEvent::Started),
        }
    }

    #[test]
    fn test_build_query() {
        let query = build_query(&request(), None);
        assert!(query.starts_with(&format!("info_hash={}&", "%AB".repeat(20))));
        assert!(query.contains("peer_id=-PL0001-123456789012"));
        assert!(query.contains("port=57893"));
        assert!(query.contains("downloaded=16384"));
        assert!(query.contains("left=100"));
        assert!(query.contains("compact=1"));
        assert!(query.ends_with("&event=started"));
        assert!(!query.contains("trackerid"));
    }

    #[test]
    fn test_build_query_with_tracker_id() {
        let mut req = request();
        req.event = None;
        let query = build_query(&req, Some("abc 1"));
        assert!(!query.contains("event="));
        assert!(query.ends_with("&trackerid=abc%201"));
    }

    #[test]
    fn test_announce_url() {
        let tracker = HttpTracker::new("http://tracker.example.com:6969/announce").unwrap();
        let url = tracker.announce_url(&request());
        assert!(url.starts_with("http://tracker.example.com:6969/announce?info_hash="));

        let tracker = HttpTracker::new("http://tracker.example.com/announce?key=1").unwrap();
        assert!(tracker.announce_url(&request()).contains("announce?key=1&info_hash="));
        assert_eq!(tracker.interval(), None);
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(HttpTracker::new("not a url").is_err());
        assert!(HttpTracker::new("udp://tracker.example.com:80").is_err());
    }
}
