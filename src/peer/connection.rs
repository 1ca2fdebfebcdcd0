//! Peer connection module
//!
//! Drives one peer connection: handshake, message dispatch, block requests
//! and reassembly of completed pieces.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::{ChokeState, ConnectionState, PeerHandle};
use crate::protocol::{decode_bitfield, Frame, Handshake, Message, StreamDecoder};
use crate::storage::PiecePlan;

/// Size of a single socket read
const READ_CHUNK: usize = 4096;

/// Timeouts and limits for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub message_timeout: Duration,
    /// Consecutive empty waits before the peer is dropped
    pub max_idles: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            message_timeout: Duration::from_secs(5),
            max_idles: 24,
        }
    }
}

/// Outcome of one wait on the socket
enum Received {
    Data,
    Idle,
    Shutdown,
}

/// A single peer connection task
pub struct PeerConnection {
    handle: PeerHandle,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    /// Our wire bitfield, sent after the handshake when any bit is set
    bitfield: Vec<u8>,
    config: ConnectionConfig,
    shutdown: watch::Receiver<bool>,
    stream: Option<TcpStream>,
    flags: ChokeState,
    decoder: StreamDecoder,
    frames: VecDeque<Frame>,
    /// Received blocks per piece, keyed by offset
    partial: HashMap<u32, BTreeMap<u32, Vec<u8>>>,
    idles: u32,
}

impl PeerConnection {
    pub fn new(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        plan: Arc<PiecePlan>,
        bitfield: Vec<u8>,
        config: ConnectionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            handle: PeerHandle::new(addr, plan),
            info_hash,
            our_peer_id,
            bitfield,
            config,
            shutdown,
            stream: None,
            flags: ChokeState::default(),
            decoder: StreamDecoder::new(),
            frames: VecDeque::new(),
            partial: HashMap::new(),
            idles: 0,
        }
    }

    /// Handle for the session side of this connection
    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    /// Connect out to the peer and run until the connection ends.
    ///
    /// Failures are logged and leave the handle in [`ConnectionState::Broken`].
    pub async fn initiate(mut self) {
        let addr = self.handle.addr();
        if let Err(e) = self.run_initiator().await {
            debug!("Connection to {} ended: {}", addr, e);
        }
        self.finish().await;
    }

    /// Run an inbound connection on an already accepted socket
    pub async fn accept(mut self, stream: TcpStream) {
        let addr = self.handle.addr();
        if let Err(e) = self.run_acceptor(stream).await {
            debug!("Connection from {} ended: {}", addr, e);
        }
        self.finish().await;
    }

    async fn run_initiator(&mut self) -> Result<()> {
        let addr = self.handle.addr();
        self.handle.set_state(ConnectionState::Connecting).await;
        debug!("Connecting to peer: {}", addr);

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                debug!("Connection timeout to {}", addr);
                TorrentError::connection_error("Connection timeout", addr.to_string())
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", addr, e);
                TorrentError::connection_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;
        self.stream = Some(stream);

        self.handle.set_state(ConnectionState::AwaitingHandshake).await;
        self.send_handshake().await?;
        self.receive_handshake().await?;
        self.handle.set_state(ConnectionState::Established).await;
        self.send_bitfield().await?;

        info!("Established connection with peer: {}", addr);
        self.run().await
    }

    async fn run_acceptor(&mut self, stream: TcpStream) -> Result<()> {
        self.stream = Some(stream);
        self.handle.set_state(ConnectionState::AwaitingHandshake).await;
        self.receive_handshake().await?;
        self.send_handshake().await?;
        self.handle.set_state(ConnectionState::Established).await;
        self.send_bitfield().await?;

        info!("Accepted connection from peer: {}", self.handle.addr());
        self.run().await
    }

    async fn finish(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.handle.set_state(ConnectionState::Broken).await;
    }

    async fn send_handshake(&mut self) -> Result<()> {
        let handshake = Handshake::new(self.info_hash, self.our_peer_id);
        self.write(&handshake.serialize()).await
    }

    async fn send_bitfield(&mut self) -> Result<()> {
        if self.bitfield.iter().all(|b| *b == 0) {
            return Ok(());
        }
        let message = Message::Bitfield { bitfield: self.bitfield.clone() };
        self.send(&message).await
    }

    /// Wait for the peer's handshake; anything framed after it is queued
    async fn receive_handshake(&mut self) -> Result<()> {
        let addr = self.handle.addr().to_string();
        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut buffer = [0u8; READ_CHUNK];

        loop {
            let stream = self.stream_mut()?;
            let read = timeout_at(deadline, stream.read(&mut buffer))
                .await
                .map_err(|_| TorrentError::connection_error("Handshake timeout", addr.clone()))?
                .map_err(|e| TorrentError::connection_error_full("Failed to read handshake", addr.clone(), e.to_string()))?;
            if read == 0 {
                return Err(TorrentError::connection_error("Peer closed before handshake", addr).into());
            }

            let frames = self.decoder.feed(&buffer[..read])?;
            let mut frames = frames.into_iter();
            let Some(first) = frames.next() else {
                continue;
            };

            let Frame::Handshake(handshake) = first else {
                return Err(TorrentError::connection_error("Expected handshake", addr).into());
            };
            if !handshake.validate(&self.info_hash) {
                warn!("Peer {} sent handshake for another torrent", addr);
                return Err(TorrentError::connection_error("Info hash mismatch", addr).into());
            }

            trace!("Peer {} id {}", addr, hex::encode(handshake.peer_id));
            self.handle.set_peer_id(handshake.peer_id).await;
            self.frames.extend(frames);
            return Ok(());
        }
    }

    /// Main exchange loop, returns when the peer goes idle, errors or the
    /// session shuts down
    async fn run(&mut self) -> Result<()> {
        let addr = self.handle.addr();
        loop {
            if self.idles > self.config.max_idles {
                return Err(TorrentError::connection_error("Peer idle for too long", addr.to_string()).into());
            }

            self.handle_messages().await?;
            self.collect_completed_pieces().await?;

            let has_requests = self.handle.pending_requests().await > 0;
            if has_requests && !self.flags.am_interested {
                self.send(&Message::Interested).await?;
                self.flags.am_interested = true;
            }

            if self.flags.peer_interested && !self.flags.am_choking {
                self.send(&Message::Unchoke).await?;
                self.flags.am_choking = false;
            }

            if has_requests && !self.flags.peer_choking {
                if let Some(request) = self.handle.pop_request().await {
                    trace!("Requesting piece {} offset {} from {}", request.index, request.begin, addr);
                    self.send(&Message::Request {
                        index: request.index,
                        begin: request.begin,
                        length: request.length,
                    })
                    .await?;
                }
            }

            match self.receive().await? {
                Received::Data => self.idles = 0,
                Received::Idle => self.idles += 1,
                Received::Shutdown => {
                    debug!("Closing connection to {} on shutdown", addr);
                    return Ok(());
                }
            }
        }
    }

    async fn handle_messages(&mut self) -> Result<()> {
        while let Some(frame) = self.frames.pop_front() {
            let message = match frame {
                Frame::Message(message) => message,
                Frame::Handshake(_) => {
                    debug!("Ignoring repeated handshake from {}", self.handle.addr());
                    continue;
                }
            };

            match message {
                Message::KeepAlive => self.send(&Message::KeepAlive).await?,
                Message::Choke => self.flags.peer_choking = true,
                Message::Unchoke => self.flags.peer_choking = false,
                Message::Interested => self.flags.peer_interested = true,
                Message::NotInterested => self.flags.peer_interested = false,
                Message::Have { piece_index } => self.handle.add_pieces([piece_index]).await,
                Message::Bitfield { bitfield } => self.handle.add_pieces(decode_bitfield(&bitfield)).await,
                Message::Piece { index, begin, block } => {
                    if self.handle.plan().block_count(index).is_none() {
                        debug!("Dropping block for unknown piece {} from {}", index, self.handle.addr());
                        continue;
                    }
                    self.partial.entry(index).or_default().insert(begin, block);
                }
                other => trace!("Ignoring {:?} from {}", other.message_id(), self.handle.addr()),
            }
        }
        Ok(())
    }

    /// Move every fully received piece into the completed buffer and
    /// announce it to the peer
    async fn collect_completed_pieces(&mut self) -> Result<()> {
        let plan = Arc::clone(self.handle.plan());
        let ready: Vec<u32> = self
            .partial
            .iter()
            .filter(|(index, blocks)| plan.block_count(**index) == Some(blocks.len()))
            .map(|(index, _)| *index)
            .collect();
        if ready.is_empty() {
            return Ok(());
        }

        let mut pieces = Vec::with_capacity(ready.len());
        for index in ready {
            if let Some(blocks) = self.partial.remove(&index) {
                let data: Vec<u8> = blocks.into_values().flatten().collect();
                debug!("Piece {} complete from {} ({} bytes)", index, self.handle.addr(), data.len());
                pieces.push((index, data));
            }
        }

        let indices: Vec<u32> = pieces.iter().map(|(index, _)| *index).collect();
        self.handle.completed().lock().await.extend(pieces);

        for index in indices {
            self.send(&Message::Have { piece_index: index }).await?;
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Received> {
        let addr = self.handle.addr().to_string();
        let mut buffer = [0u8; READ_CHUNK];
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TorrentError::connection_error("Not connected", addr.clone()))?;
        let shutdown = &mut self.shutdown;
        if *shutdown.borrow() {
            return Ok(Received::Shutdown);
        }

        let read = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(Received::Shutdown);
                }
                return Ok(Received::Idle);
            }
            read = timeout(self.config.message_timeout, stream.read(&mut buffer)) => read,
        };

        let read = match read {
            Ok(read) => read.map_err(|e| {
                TorrentError::connection_error_full("Failed to read from peer", addr.clone(), e.to_string())
            })?,
            Err(_) => return Ok(Received::Idle),
        };
        if read == 0 {
            return Err(TorrentError::connection_error("Peer closed the connection", addr).into());
        }

        let frames = self.decoder.feed(&buffer[..read]).map_err(|e| {
            error!("Malformed data from {}: {}", addr, e);
            e
        })?;
        self.frames.extend(frames);
        Ok(Received::Data)
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        trace!("Sending {:?} to {}", message.message_id(), self.handle.addr());
        self.write(&message.serialize()).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let addr = self.handle.addr().to_string();
        let limit = self.config.message_timeout;
        let stream = self.stream_mut()?;
        timeout(limit, stream.write_all(data))
            .await
            .map_err(|_| TorrentError::connection_error("Send timeout", addr.clone()))?
            .map_err(|e| TorrentError::connection_error_full("Failed to send", addr, e.to_string()))?;
        Ok(())
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        let addr = self.handle.addr().to_string();
        Ok(self
            .stream
            .as_mut()
            .ok_or_else(|| TorrentError::connection_error("Not connected", addr))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{piece_digest, Piece};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const INFO_HASH: [u8; 20] = [7u8; 20];

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            message_timeout: Duration::from_millis(200),
            max_idles: 24,
        }
    }

    fn plan_for(data: &[u8]) -> Arc<PiecePlan> {
        let piece = Piece::new(0, data.len() as u32, piece_digest(data));
        Arc::new(PiecePlan::new(&[piece]))
    }

    async fn next_frame(stream: &mut TcpStream, decoder: &mut StreamDecoder, queue: &mut VecDeque<Frame>) -> Frame {
        let mut buffer = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = queue.pop_front() {
                return frame;
            }
            let read = timeout(Duration::from_secs(5), stream.read(&mut buffer)).await.unwrap().unwrap();
            assert!(read > 0, "connection closed");
            queue.extend(decoder.feed(&buffer[..read]).unwrap());
        }
    }

    async fn next_message(stream: &mut TcpStream, decoder: &mut StreamDecoder, queue: &mut VecDeque<Frame>) -> Message {
        match next_frame(stream, decoder, queue).await {
            Frame::Message(message) => message,
            Frame::Handshake(_) => panic!("unexpected handshake"),
        }
    }

    fn spawn_connection(
        addr: SocketAddr,
        plan: Arc<PiecePlan>,
        bitfield: Vec<u8>,
    ) -> (PeerHandle, watch::Sender<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let connection =
            PeerConnection::new(addr, INFO_HASH, Handshake::generate_peer_id(), plan, bitfield, test_config(), rx);
        let handle = connection.handle();
        let task = tokio::spawn(connection.initiate());
        (handle, tx, task)
    }

    #[tokio::test]
    async fn test_download_piece_from_scripted_peer() {
        let data: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
        let plan = plan_for(&data);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (handle, _tx, task) = spawn_connection(addr, plan, vec![0]);
        handle.request_piece(0).await;

        let (mut peer, _) = listener.accept().await.unwrap();
        let mut decoder = StreamDecoder::new();
        let mut queue = VecDeque::new();

        match next_frame(&mut peer, &mut decoder, &mut queue).await {
            Frame::Handshake(hs) => assert!(hs.validate(&INFO_HASH)),
            other => panic!("expected handshake, got {:?}", other),
        }
        peer.write_all(&Handshake::new(INFO_HASH, [9u8; 20]).serialize()).await.unwrap();
        peer.write_all(&Message::KeepAlive.serialize()).await.unwrap();
        peer.write_all(&Message::Bitfield { bitfield: vec![0x80] }.serialize()).await.unwrap();
        peer.write_all(&Message::Unchoke.serialize()).await.unwrap();

        let mut saw_keep_alive = false;
        let mut saw_interested = false;
        let mut served = 0;
        while served < 2 {
            match next_message(&mut peer, &mut decoder, &mut queue).await {
                Message::KeepAlive => saw_keep_alive = true,
                Message::Interested => saw_interested = true,
                Message::Request { index, begin, length } => {
                    assert_eq!(index, 0);
                    let block = data[begin as usize..(begin + length) as usize].to_vec();
                    peer.write_all(&Message::Piece { index, begin, block }.serialize()).await.unwrap();
                    served += 1;
                }
                other => panic!("unexpected message {:?}", other),
            }
        }

        assert_eq!(
            next_message(&mut peer, &mut decoder, &mut queue).await,
            Message::Have { piece_index: 0 }
        );
        assert!(saw_keep_alive);
        assert!(saw_interested);
        assert!(handle.has_piece(0).await);
        assert_eq!(handle.peer_id().await, Some([9u8; 20]));
        assert_eq!(handle.state().await, ConnectionState::Established);

        let completed = handle.completed().lock().await;
        assert_eq!(completed.get(&0), Some(&data));
        drop(completed);

        drop(peer);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(handle.is_broken().await);
    }

    #[tokio::test]
    async fn test_stalled_peer_breaks_connection() {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(16).unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle, _tx, task) = spawn_connection(addr, plan_for(&[1u8; 100]), vec![0]);

        let (mut peer, _) = listener.accept().await.unwrap();
        let mut decoder = StreamDecoder::new();
        let mut queue = VecDeque::new();
        assert!(matches!(next_frame(&mut peer, &mut decoder, &mut queue).await, Frame::Handshake(_)));
        peer.write_all(&Handshake::new(INFO_HASH, [9u8; 20]).serialize()).await.unwrap();

        // Keep-alives that are answered but never read back
        let flood = tokio::spawn(async move {
            let keep_alives = [0u8; 4096];
            while peer.write_all(&keep_alives).await.is_ok() {}
        });

        timeout(Duration::from_secs(30), task).await.unwrap().unwrap();
        assert!(handle.is_broken().await);
        flood.abort();
    }

    #[tokio::test]
    async fn test_bitfield_sent_after_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_handle, _tx, _task) = spawn_connection(addr, plan_for(&[1u8; 100]), vec![0x80]);

        let (mut peer, _) = listener.accept().await.unwrap();
        let mut decoder = StreamDecoder::new();
        let mut queue = VecDeque::new();
        assert!(matches!(next_frame(&mut peer, &mut decoder, &mut queue).await, Frame::Handshake(_)));
        peer.write_all(&Handshake::new(INFO_HASH, [9u8; 20]).serialize()).await.unwrap();

        assert_eq!(
            next_message(&mut peer, &mut decoder, &mut queue).await,
            Message::Bitfield { bitfield: vec![0x80] }
        );
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_breaks_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle, _tx, task) = spawn_connection(addr, plan_for(&[1u8; 100]), vec![0]);

        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(&Handshake::new([8u8; 20], [9u8; 20]).serialize()).await.unwrap();

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(handle.is_broken().await);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_broken() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (handle, _tx, task) = spawn_connection(addr, plan_for(&[1u8; 100]), vec![0]);
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(handle.state().await, ConnectionState::Broken);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle, tx, task) = spawn_connection(addr, plan_for(&[1u8; 100]), vec![0]);

        let (mut peer, _) = listener.accept().await.unwrap();
        let mut decoder = StreamDecoder::new();
        let mut queue = VecDeque::new();
        assert!(matches!(next_frame(&mut peer, &mut decoder, &mut queue).await, Frame::Handshake(_)));
        peer.write_all(&Handshake::new(INFO_HASH, [9u8; 20]).serialize()).await.unwrap();

        for _ in 0..50 {
            if handle.state().await == ConnectionState::Established {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(true).unwrap();

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(handle.is_broken().await);
    }

    #[tokio::test]
    async fn test_accept_answers_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut remote = TcpStream::connect(addr).await.unwrap();
        let (socket, peer_addr) = listener.accept().await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let connection = PeerConnection::new(
            peer_addr,
            INFO_HASH,
            Handshake::generate_peer_id(),
            plan_for(&[1u8; 100]),
            vec![0x80],
            test_config(),
            rx,
        );
        let handle = connection.handle();
        tokio::spawn(connection.accept(socket));

        remote.write_all(&Handshake::new(INFO_HASH, [3u8; 20]).serialize()).await.unwrap();
        let mut decoder = StreamDecoder::new();
        let mut queue = VecDeque::new();
        match next_frame(&mut remote, &mut decoder, &mut queue).await {
            Frame::Handshake(hs) => assert!(hs.validate(&INFO_HASH)),
            other => panic!("expected handshake, got {:?}", other),
        }
        assert_eq!(
            next_message(&mut remote, &mut decoder, &mut queue).await,
            Message::Bitfield { bitfield: vec![0x80] }
        );
        assert_eq!(handle.peer_id().await, Some([3u8; 20]));
    }
}
