//! Torrent session
//!
//! Runs the download of one torrent: keeps the peer set fresh from the
//! tracker, hands pieces out to connections and commits verified pieces to
//! the piece store.

use anyhow::Result;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::{PeerConnection, PeerHandle};
use crate::protocol::Handshake;
use crate::session::SessionConfig;
use crate::storage::{piece_digest, PieceStore};
use crate::torrent::TorrentInfo;
use crate::tracker::{AnnounceEvent, AnnounceRequest, Tracker};

/// Snapshot of a session for display
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentStatus {
    pub name: String,
    pub active: bool,
    pub completed: bool,
    pub total_length: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    /// Bytes per second over the last cycle
    pub speed: u64,
    /// Connections that are not broken
    pub peers: usize,
    /// Display path and length of each file
    pub files: Vec<(String, u64)>,
}

/// Download state of one torrent
pub struct TorrentSession {
    name: String,
    info: TorrentInfo,
    peer_id: [u8; 20],
    config: SessionConfig,
    store: Mutex<PieceStore>,
    tracker: Mutex<Box<dyn Tracker>>,
    connections: Mutex<HashMap<SocketAddr, PeerHandle>>,
    last_announce: Mutex<Option<Instant>>,
    shutdown: watch::Sender<bool>,
    total_length: u64,
    running: AtomicBool,
    active: AtomicBool,
    started: AtomicBool,
    completed: AtomicBool,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    speed: AtomicU64,
}

impl TorrentSession {
    /// Open the piece store under `root_dir` and prepare a session
    pub async fn open(
        name: impl Into<String>,
        info: TorrentInfo,
        root_dir: impl Into<PathBuf>,
        tracker: Box<dyn Tracker>,
        config: SessionConfig,
    ) -> Result<Self> {
        let store = PieceStore::open(&info, root_dir).await?;
        let downloaded = store.downloaded_bytes();
        let total_length = store.total_length();
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            name: name.into(),
            info,
            peer_id: Handshake::generate_peer_id(),
            config,
            store: Mutex::new(store),
            tracker: Mutex::new(tracker),
            connections: Mutex::new(HashMap::new()),
            last_announce: Mutex::new(None),
            shutdown,
            total_length,
            running: AtomicBool::new(false),
            active: AtomicBool::new(false),
            started: AtomicBool::new(false),
            completed: AtomicBool::new(downloaded == total_length),
            downloaded: AtomicU64::new(downloaded),
            uploaded: AtomicU64::new(0),
            speed: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether a download loop is currently driving this session
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn speed(&self) -> u64 {
        self.speed.load(Ordering::SeqCst)
    }

    /// Ask the download loop to stop after its current cycle
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Flip the active flag in one step and return the new value
    pub fn toggle_active(&self) -> bool {
        !self.active.fetch_xor(true, Ordering::SeqCst)
    }

    /// Download the selected files (all of them for `None`) until every byte
    /// of the torrent is present or the session is deactivated.
    pub async fn start(&self, selection: Option<Vec<usize>>) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        self.run_active(selection).await
    }

    /// Drive the session while it stays active.
    ///
    /// The caller sets the active flag beforehand. When a loop is already
    /// running it simply keeps going, so this only applies the selection.
    pub async fn run_active(&self, selection: Option<Vec<usize>>) -> Result<()> {
        {
            let mut store = self.store.lock().await;
            if store.is_closed() {
                self.deactivate();
                return Err(TorrentError::storage_error(format!("Session '{}' has been stopped", self.name)).into());
            }
            store.mark_files_for_download(selection.as_deref());
        }

        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Session '{}' is already running", self.name);
            return Ok(());
        }
        self.shutdown.send_replace(false);

        info!("Starting '{}' ({} of {} bytes present)", self.name, self.downloaded(), self.total_length);
        self.update_connections().await;
        self.started.store(true, Ordering::SeqCst);

        loop {
            while self.wants_more() {
                self.update_connections().await;
                self.distribute_requests().await;
                self.collect_pieces().await;
                tokio::time::sleep(self.config.loop_interval).await;
            }
            self.running.store(false, Ordering::SeqCst);

            // A resume may have arrived while `running` was still set
            if !self.wants_more() {
                break;
            }
            if self.running.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }

        self.speed.store(0, Ordering::SeqCst);
        if self.downloaded() == self.total_length {
            self.completed.store(true, Ordering::SeqCst);
            info!("Download of '{}' complete", self.name);
        } else {
            info!("Paused '{}' at {} of {} bytes", self.name, self.downloaded(), self.total_length);
        }
        Ok(())
    }

    fn wants_more(&self) -> bool {
        self.downloaded() < self.total_length && self.is_active()
    }

    /// Announce when due and connect to every peer not seen before
    async fn update_connections(&self) {
        let mut tracker = self.tracker.lock().await;
        let mut last_announce = self.last_announce.lock().await;
        if let Some(at) = *last_announce {
            let interval = tracker.interval().unwrap_or(self.config.fallback_announce_interval);
            if at.elapsed() < interval {
                return;
            }
        }

        let downloaded = self.downloaded();
        let request = AnnounceRequest {
            info_hash: self.info.info_hash,
            peer_id: self.peer_id,
            port: self.config.port,
            uploaded: self.uploaded.load(Ordering::SeqCst),
            downloaded,
            left: self.total_length.saturating_sub(downloaded),
            event: if self.is_started() { None } else { Some(AnnounceEvent::Started) },
        };

        let peers = match tracker.announce(&request).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Announce for '{}' failed: {}", self.name, e);
                return;
            }
        };
        *last_announce = Some(Instant::now());
        drop(last_announce);
        drop(tracker);

        let (plan, bitfield) = {
            let store = self.store.lock().await;
            (store.plan(), store.bitfield())
        };

        let mut connections = self.connections.lock().await;
        for peer in peers {
            let addr = match peer.socket_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Skipping peer {}: {}", peer, e);
                    continue;
                }
            };
            if connections.contains_key(&addr) {
                continue;
            }

            let connection = PeerConnection::new(
                addr,
                self.info.info_hash,
                self.peer_id,
                Arc::clone(&plan),
                bitfield.clone(),
                self.config.connection_config(),
                self.shutdown.subscribe(),
            );
            connections.insert(addr, connection.handle());
            tokio::spawn(connection.initiate());
            debug!("Spawned connection to {}", addr);
        }
        info!("'{}' knows {} peers", self.name, connections.len());
    }

    /// Hand absent, wanted pieces to random connections that have them
    async fn distribute_requests(&self) {
        let mut handles: Vec<PeerHandle> = self.connections.lock().await.values().cloned().collect();
        if handles.is_empty() {
            return;
        }

        let mut store = self.store.lock().await;
        let max_requests = std::cmp::max(2, 2 * self.speed() / store.piece_length().max(1));
        let now = Instant::now();
        let mut requested = 0u64;

        for index in store.wanted_pieces(now, self.config.request_timeout) {
            handles.shuffle(&mut rand::thread_rng());
            for handle in &handles {
                if !handle.is_broken().await && handle.has_piece(index).await {
                    handle.request_piece(index).await;
                    store.mark_requested(index, now);
                    requested += 1;
                    trace!("Piece {} assigned to {}", index, handle.addr());
                    break;
                }
            }
            if requested >= max_requests {
                break;
            }
        }
        if requested > 0 {
            debug!("Requested {} pieces for '{}'", requested, self.name);
        }
    }

    /// Verify completed pieces and commit the good ones
    async fn collect_pieces(&self) {
        let handles: Vec<PeerHandle> = self.connections.lock().await.values().cloned().collect();
        let mut written = 0u64;

        for handle in handles {
            let mut completed = handle.completed().lock().await;
            let pieces: Vec<(u32, Vec<u8>)> = completed.drain().collect();
            for (index, data) in pieces {
                let digest = piece_digest(&data);
                let mut store = self.store.lock().await;
                if !store.hash_matches(index, &digest) {
                    warn!("Piece {} from {} failed verification, discarding", index, handle.addr());
                    continue;
                }
                match store.write_piece(index, &data).await {
                    Ok(true) => written += data.len() as u64,
                    Ok(false) => trace!("Piece {} already present", index),
                    Err(e) => error!("Failed to write piece {}: {}", index, e),
                }
            }
        }

        self.downloaded.fetch_add(written, Ordering::SeqCst);
        let seconds = self.config.loop_interval.as_secs_f64();
        let speed = if seconds > 0.0 { (written as f64 / seconds) as u64 } else { written };
        self.speed.store(speed, Ordering::SeqCst);
        if written > 0 {
            debug!("'{}' wrote {} bytes this cycle", self.name, written);
        }
    }

    /// Stop all connections, close the files and persist the bitmap
    pub async fn stop(&self) -> Result<()> {
        self.deactivate();
        self.shutdown.send_replace(true);

        let mut store = self.store.lock().await;
        store.close().await?;
        store.persist_bitmap().await?;
        info!("Stopped '{}'", self.name);
        Ok(())
    }

    pub async fn active_peers(&self) -> usize {
        let handles: Vec<PeerHandle> = self.connections.lock().await.values().cloned().collect();
        let mut count = 0;
        for handle in handles {
            if !handle.is_broken().await {
                count += 1;
            }
        }
        count
    }

    pub async fn status(&self) -> TorrentStatus {
        TorrentStatus {
            name: self.name.clone(),
            active: self.is_active(),
            completed: self.is_completed(),
            total_length: self.total_length,
            downloaded: self.downloaded(),
            uploaded: self.uploaded.load(Ordering::SeqCst),
            speed: self.speed(),
            peers: self.active_peers().await,
            files: self.info.files().iter().map(|f| (f.display_path(), f.length)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encode, Dict, Value};
    use crate::protocol::{Frame, Message, StreamDecoder};
    use crate::torrent::TorrentParser;
    use crate::tracker::PeerAddr;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const PIECE_LENGTH: usize = 32768;

    struct MockTracker {
        peers: Vec<PeerAddr>,
        announces: Arc<AtomicU64>,
        interval: Option<Duration>,
    }

    #[async_trait]
    impl Tracker for MockTracker {
        async fn announce(&mut self, _request: &AnnounceRequest) -> Result<Vec<PeerAddr>> {
            self.announces.fetch_add(1, Ordering::SeqCst);
            Ok(self.peers.clone())
        }

        fn interval(&self) -> Option<Duration> {
            self.interval
        }
    }

    /// Answers with no peers after a fixed delay
    struct SlowTracker {
        delay: Duration,
    }

    #[async_trait]
    impl Tracker for SlowTracker {
        async fn announce(&mut self, _request: &AnnounceRequest) -> Result<Vec<PeerAddr>> {
            tokio::time::sleep(self.delay).await;
            Ok(Vec::new())
        }

        fn interval(&self) -> Option<Duration> {
            None
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            loop_interval: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(2),
            message_timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(2),
            max_idles: 100,
            fallback_announce_interval: Duration::from_secs(60),
            port: 6881,
        }
    }

    fn torrent_for(content: &[u8]) -> TorrentInfo {
        let pieces: Vec<u8> = content.chunks(PIECE_LENGTH).flat_map(piece_digest).collect();
        let info = Dict::new()
            .with("length", content.len() as i64)
            .with("name", "payload.bin")
            .with("piece length", PIECE_LENGTH as i64)
            .with("pieces", pieces);
        let meta = Dict::new().with("announce", "http://127.0.0.1/announce").with("info", Value::Dict(info));
        TorrentParser::parse_bytes(&encode(&Value::Dict(meta))).unwrap()
    }

    /// Serve every requested block of `content` to one downloader
    async fn seed(listener: TcpListener, info_hash: [u8; 20], content: Vec<u8>, corrupt_first: bool) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let piece_count = content.len().div_ceil(PIECE_LENGTH);
        let mut decoder = StreamDecoder::new();
        let mut queue: VecDeque<Frame> = VecDeque::new();
        let mut buffer = [0u8; 4096];
        let mut handshaken = false;
        let mut corrupt = corrupt_first;

        loop {
            while let Some(frame) = queue.pop_front() {
                match frame {
                    Frame::Handshake(_) if !handshaken => {
                        handshaken = true;
                        let bitfield = crate::protocol::encode_bitfield(0..piece_count as u32, piece_count);
                        stream.write_all(&Handshake::new(info_hash, [5u8; 20]).serialize()).await.unwrap();
                        stream.write_all(&Message::Bitfield { bitfield }.serialize()).await.unwrap();
                        stream.write_all(&Message::Unchoke.serialize()).await.unwrap();
                    }
                    Frame::Message(Message::Request { index, begin, length }) => {
                        let start = index as usize * PIECE_LENGTH + begin as usize;
                        let mut block = content[start..start + length as usize].to_vec();
                        if corrupt {
                            block[0] ^= 0xFF;
                            corrupt = false;
                        }
                        stream.write_all(&Message::Piece { index, begin, block }.serialize()).await.unwrap();
                    }
                    _ => {}
                }
            }
            match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => return,
                Ok(n) => queue.extend(decoder.feed(&buffer[..n]).unwrap()),
            }
        }
    }

    async fn session_with_seeder(
        content: &[u8],
        corrupt_first: bool,
        config: SessionConfig,
    ) -> (Arc<TorrentSession>, Arc<AtomicU64>, tempfile::TempDir) {
        let info = torrent_for(content);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(seed(listener, info.info_hash, content.to_vec(), corrupt_first));

        let announces = Arc::new(AtomicU64::new(0));
        let tracker = MockTracker {
            peers: vec![PeerAddr::new(addr.ip().to_string(), addr.port())],
            announces: Arc::clone(&announces),
            interval: Some(Duration::from_secs(60)),
        };
        let dir = tempfile::tempdir().unwrap();
        let session =
            TorrentSession::open("payload", info, dir.path().join("payload"), Box::new(tracker), config)
                .await
                .unwrap();
        (Arc::new(session), announces, dir)
    }

    #[tokio::test]
    async fn test_download_from_seeder() {
        let content: Vec<u8> = (0..80000u32).map(|i| (i * 7 % 256) as u8).collect();
        let (session, announces, dir) = session_with_seeder(&content, false, test_config()).await;
        assert!(!session.is_completed());

        tokio::time::timeout(Duration::from_secs(20), session.start(None)).await.unwrap().unwrap();

        assert!(session.is_completed());
        assert_eq!(session.downloaded(), content.len() as u64);
        assert_eq!(session.speed(), 0);
        assert_eq!(announces.load(Ordering::SeqCst), 1);

        session.stop().await.unwrap();
        let written = std::fs::read(dir.path().join("payload").join("payload.bin")).unwrap();
        assert_eq!(written, content);

        let resume = std::fs::read_to_string(dir.path().join("payload").join("bitfield.json")).unwrap();
        assert!(resume.contains("\"piece_count\":3"));
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_requested_again() {
        let content: Vec<u8> = (0..40000u32).map(|i| (i % 13) as u8).collect();
        let mut config = test_config();
        config.request_timeout = Duration::from_millis(300);
        let (session, _announces, dir) = session_with_seeder(&content, true, config).await;

        tokio::time::timeout(Duration::from_secs(20), session.start(None)).await.unwrap().unwrap();
        assert!(session.is_completed());
        session.stop().await.unwrap();

        let written = std::fs::read(dir.path().join("payload").join("payload.bin")).unwrap();
        assert_eq!(written, content);
    }

    #[tokio::test]
    async fn test_deactivate_pauses_loop() {
        let content = vec![1u8; 1000];
        let info = torrent_for(&content);
        let dir = tempfile::tempdir().unwrap();
        let tracker = MockTracker {
            peers: Vec::new(),
            announces: Arc::new(AtomicU64::new(0)),
            interval: None,
        };
        let session = Arc::new(
            TorrentSession::open("idle", info, dir.path().join("idle"), Box::new(tracker), test_config())
                .await
                .unwrap(),
        );

        let runner = Arc::clone(&session);
        let task = tokio::spawn(async move { runner.start(None).await });
        for _ in 0..50 {
            if session.is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(session.is_started());
        session.deactivate();

        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert!(!session.is_completed());
        assert_eq!(session.status().await.peers, 0);
    }

    #[tokio::test]
    async fn test_start_after_stop_fails() {
        let info = torrent_for(&[2u8; 100]);
        let dir = tempfile::tempdir().unwrap();
        let tracker = MockTracker {
            peers: Vec::new(),
            announces: Arc::new(AtomicU64::new(0)),
            interval: None,
        };
        let session = TorrentSession::open("s", info, dir.path().join("s"), Box::new(tracker), test_config())
            .await
            .unwrap();
        session.stop().await.unwrap();
        assert!(session.start(None).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_not_counted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let info = torrent_for(&[3u8; 100]);
        let dir = tempfile::tempdir().unwrap();
        let tracker = MockTracker {
            peers: vec![PeerAddr::new("127.0.0.1", addr.port()), PeerAddr::new("not-an-ip", 1)],
            announces: Arc::new(AtomicU64::new(0)),
            interval: None,
        };
        let session = TorrentSession::open("s", info, dir.path().join("s"), Box::new(tracker), test_config())
            .await
            .unwrap();
        session.update_connections().await;
        assert_eq!(session.connections.lock().await.len(), 1);

        for _ in 0..100 {
            if session.active_peers().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(session.active_peers().await, 0);
    }

    #[tokio::test]
    async fn test_pause_during_first_announce_is_kept() {
        let info = torrent_for(&[4u8; 100]);
        let dir = tempfile::tempdir().unwrap();
        let tracker = SlowTracker { delay: Duration::from_millis(300) };
        let session = Arc::new(
            TorrentSession::open("slow", info, dir.path().join("slow"), Box::new(tracker), test_config())
                .await
                .unwrap(),
        );

        let runner = Arc::clone(&session);
        let task = tokio::spawn(async move { runner.start(None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.is_active());
        assert!(!session.toggle_active());

        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert!(session.is_started());
        assert!(!session.is_active());
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_second_start_joins_running_loop() {
        let info = torrent_for(&[5u8; 100]);
        let dir = tempfile::tempdir().unwrap();
        let tracker = SlowTracker { delay: Duration::ZERO };
        let mut config = test_config();
        config.loop_interval = Duration::from_millis(500);
        let session = Arc::new(
            TorrentSession::open("join", info, dir.path().join("join"), Box::new(tracker), config)
                .await
                .unwrap(),
        );

        let runner = Arc::clone(&session);
        tokio::spawn(async move { runner.start(None).await });
        for _ in 0..50 {
            if session.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Paused and resumed while the loop sleeps between cycles
        session.deactivate();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(1), session.start(None)).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(session.is_active());
        assert!(session.is_running());
        session.stop().await.unwrap();
    }
}
