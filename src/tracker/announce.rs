//! Announce request and response types

use anyhow::Result;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};

use crate::bencode::{self, Dict, Value};
use crate::error::TorrentError;

/// Announce event sent with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
        }
    }
}

/// Parameters of one announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<AnnounceEvent>,
}

/// A peer address as reported by a tracker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    /// Dotted quad or whatever textual address the tracker gave
    pub ip: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.ip.parse().map_err(TorrentError::from)?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Decoded tracker response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Option<u64>,
    pub min_interval: Option<u64>,
    pub tracker_id: Option<String>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub peers: Vec<PeerAddr>,
}

impl AnnounceResponse {
    /// Decode a bencoded announce response.
    ///
    /// A `failure reason` is reported as a tracker error; a missing `peers`
    /// key yields an empty peer list.
    pub fn from_bencode(data: &[u8]) -> Result<Self> {
        let value = bencode::decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| TorrentError::format_error(format!("Tracker response is a {}, expected dict", value.kind())))?;

        if let Some(reason) = dict.get(b"failure reason") {
            let reason = reason.as_str().unwrap_or("unreadable reason");
            warn!("Tracker refused announce: {}", reason);
            return Err(TorrentError::tracker_error(format!("Tracker failure: {}", reason)).into());
        }

        let peers = match dict.get(b"peers") {
            Some(Value::Bytes(packed)) => parse_compact_peers(packed)?,
            Some(Value::List(list)) => parse_peer_list(list)?,
            Some(other) => {
                return Err(TorrentError::format_error(format!("Unsupported peer model: {}", other.kind())).into())
            }
            None => Vec::new(),
        };

        let response = Self {
            interval: non_negative(dict, b"interval"),
            min_interval: non_negative(dict, b"min interval"),
            tracker_id: dict.get(b"tracker id").and_then(Value::as_str).map(String::from),
            complete: non_negative(dict, b"complete"),
            incomplete: non_negative(dict, b"incomplete"),
            peers,
        };
        debug!("Tracker returned {} peers, interval {:?}", response.peers.len(), response.interval);
        Ok(response)
    }
}

fn non_negative(dict: &Dict, key: &[u8]) -> Option<u64> {
    dict.get(key).and_then(Value::as_int).and_then(|v| u64::try_from(v).ok())
}

/// Packed peers: 4 address bytes followed by a big-endian port
pub fn parse_compact_peers(packed: &[u8]) -> Result<Vec<PeerAddr>> {
    if packed.len() % 6 != 0 {
        return Err(TorrentError::format_error(format!(
            "Compact peer list length {} is not a multiple of 6",
            packed.len()
        ))
        .into());
    }

    Ok(packed
        .chunks_exact(6)
        .map(|chunk| {
            let ip = format!("{}.{}.{}.{}", chunk[0], chunk[1], chunk[2], chunk[3]);
            PeerAddr::new(ip, u16::from_be_bytes([chunk[4], chunk[5]]))
        })
        .collect())
}

/// Structured peers: a list of dicts with `ip` and `port` keys
fn parse_peer_list(list: &[Value]) -> Result<Vec<PeerAddr>> {
    let mut peers = Vec::with_capacity(list.len());
    for entry in list {
        let dict = entry
            .as_dict()
            .ok_or_else(|| TorrentError::format_error("Peer entry is not a dict"))?;

        let ip = match dict.get(b"ip").and_then(Value::as_bytes) {
            Some(raw) if raw.len() == 4 && std::str::from_utf8(raw).map_or(true, |s| s.parse::<IpAddr>().is_err()) => {
                format!("{}.{}.{}.{}", raw[0], raw[1], raw[2], raw[3])
            }
            Some(raw) => String::from_utf8(raw.to_vec())
                .map_err(|e| TorrentError::format_error_with_source("Peer ip is not text", e.to_string()))?,
            None => return Err(TorrentError::format_error("Peer entry without ip").into()),
        };
        let port = dict
            .get(b"port")
            .and_then(Value::as_int)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| TorrentError::format_error("Peer entry without valid port"))?;

        peers.push(PeerAddr::new(ip, port));
    }
    Ok(peers)
}

/// What a tracker has told us so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerState {
    pub interval: Option<u64>,
    pub min_interval: Option<u64>,
    /// Set by the first response carrying one, never replaced
    pub tracker_id: Option<String>,
    pub complete: u64,
    pub incomplete: u64,
}

impl TrackerState {
    pub fn update(&mut self, response: &AnnounceResponse) {
        if let Some(interval) = response.interval {
            self.interval = Some(interval);
        }
        if let Some(min_interval) = response.min_interval {
            self.min_interval = Some(min_interval);
        }
        if self.tracker_id.is_none() {
            self.tracker_id = response.tracker_id.clone();
        }
        if let Some(complete) = response.complete {
            self.complete = complete;
        }
        if let Some(incomplete) = response.incomplete {
            self.incomplete = incomplete;
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;

    #[test]
    fn test_compact_peers() {
        let body = encode(&Value::Dict(
            Dict::new()
                .with("interval", 1800i64)
                .with("peers", &[10u8, 0, 0, 1, 0x1A, 0xE1, 192, 168, 1, 20, 0x00, 0x50][..]),
        ));
        let response = AnnounceResponse::from_bencode(&body).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.peers, vec![PeerAddr::new("10.0.0.1", 6881), PeerAddr::new("192.168.1.20", 80)]);
        assert_eq!(response.peers[0].socket_addr().unwrap(), "10.0.0.1:6881".parse().unwrap());
    }

    #[test]
    fn test_dict_peers() {
        let peer = Dict::new().with("ip", "127.0.0.1").with("peer id", "-XX0000-000000000000").with("port", 51413i64);
        let body = encode(&Value::Dict(
            Dict::new()
                .with("complete", 3i64)
                .with("incomplete", 7i64)
                .with("peers", vec![Value::Dict(peer)]),
        ));
        let response = AnnounceResponse::from_bencode(&body).unwrap();
        assert_eq!(response.peers, vec![PeerAddr::new("127.0.0.1", 51413)]);
        assert_eq!(response.complete, Some(3));
        assert_eq!(response.incomplete, Some(7));
        assert_eq!(response.interval, None);
    }

    #[test]
    fn test_failure_reason() {
        let body = encode(&Value::Dict(Dict::new().with("failure reason", "unregistered torrent")));
        let err = AnnounceResponse::from_bencode(&body).unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::TrackerError { .. })));
        assert!(err.to_string().contains("unregistered torrent"));
    }

    #[test]
    fn test_bad_compact_length() {
        let body = encode(&Value::Dict(Dict::new().with("peers", &[1u8, 2, 3, 4, 5][..])));
        let err = AnnounceResponse::from_bencode(&body).unwrap_err();
        assert!(err.downcast_ref::<TorrentError>().is_some_and(TorrentError::is_format));
    }

    #[test]
    fn test_unsupported_peer_model() {
        let body = encode(&Value::Dict(Dict::new().with("peers", 5i64)));
        assert!(AnnounceResponse::from_bencode(&body).is_err());
        assert!(AnnounceResponse::from_bencode(b"le").is_err());
    }

    #[test]
    fn test_tracker_id_is_sticky() {
        let mut state = TrackerState::default();
        state.update(&AnnounceResponse { tracker_id: Some("first".into()), interval: Some(60), ..Default::default() });
        state.update(&AnnounceResponse {
            tracker_id: Some("second".into()),
            interval: Some(120),
            complete: Some(4),
            ..Default::default()
        });
        assert_eq!(state.tracker_id.as_deref(), Some("first"));
        assert_eq!(state.interval(), Some(Duration::from_secs(120)));
        assert_eq!(state.complete, 4);
    }
}
