//! Peer state module
//!
//! State shared between a connection task and the session that owns it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::storage::PiecePlan;

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Opening the socket
    #[default]
    Connecting,
    /// Socket open, waiting for the peer's handshake
    AwaitingHandshake,
    /// Handshake accepted, exchanging messages
    Established,
    /// Terminal: the connection is unusable
    Broken,
}

impl ConnectionState {
    pub fn is_broken(&self) -> bool {
        matches!(self, ConnectionState::Broken)
    }
}

/// The four choke/interest flags of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeState {
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
}

impl Default for ChokeState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// One outstanding block request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// State a connection task shares with its session
#[derive(Debug)]
pub struct PeerShared {
    addr: SocketAddr,
    plan: Arc<PiecePlan>,
    state: RwLock<ConnectionState>,
    peer_id: RwLock<Option<[u8; 20]>>,
    has_pieces: RwLock<HashSet<u32>>,
    requests: Mutex<VecDeque<BlockRequest>>,
    completed: Mutex<HashMap<u32, Vec<u8>>>,
}

/// Cheap handle to a connection's shared state
#[derive(Debug, Clone)]
pub struct PeerHandle {
    inner: Arc<PeerShared>,
}

impl PeerHandle {
    pub fn new(addr: SocketAddr, plan: Arc<PiecePlan>) -> Self {
        Self {
            inner: Arc::new(PeerShared {
                addr,
                plan,
                state: RwLock::new(ConnectionState::Connecting),
                peer_id: RwLock::new(None),
                has_pieces: RwLock::new(HashSet::new()),
                requests: Mutex::new(VecDeque::new()),
                completed: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn plan(&self) -> &Arc<PiecePlan> {
        &self.inner.plan
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn set_state(&self, state: ConnectionState) {
        let mut current = self.inner.state.write().await;
        if *current != state {
            debug!("Peer {} state {:?} -> {:?}", self.inner.addr, *current, state);
            *current = state;
        }
    }

    pub async fn is_broken(&self) -> bool {
        self.state().await.is_broken()
    }

    pub async fn peer_id(&self) -> Option<[u8; 20]> {
        *self.inner.peer_id.read().await
    }

    pub(crate) async fn set_peer_id(&self, peer_id: [u8; 20]) {
        *self.inner.peer_id.write().await = Some(peer_id);
    }

    /// Whether the peer has advertised the piece
    pub async fn has_piece(&self, index: u32) -> bool {
        self.inner.has_pieces.read().await.contains(&index)
    }

    pub async fn advertised_count(&self) -> usize {
        self.inner.has_pieces.read().await.len()
    }

    pub(crate) async fn add_pieces<I: IntoIterator<Item = u32>>(&self, indices: I) {
        self.inner.has_pieces.write().await.extend(indices);
    }

    /// Queue a request for every block of a piece, in block order
    pub async fn request_piece(&self, index: u32) {
        let Some(blocks) = self.inner.plan.blocks(index) else {
            debug!("Ignoring request for unknown piece {}", index);
            return;
        };
        let mut requests = self.inner.requests.lock().await;
        requests.extend(blocks.iter().map(|b| BlockRequest {
            index,
            begin: b.begin,
            length: b.length,
        }));
        debug!("Queued {} block requests for piece {} on {}", blocks.len(), index, self.inner.addr);
    }

    pub async fn pending_requests(&self) -> usize {
        self.inner.requests.lock().await.len()
    }

    pub(crate) async fn pop_request(&self) -> Option<BlockRequest> {
        self.inner.requests.lock().await.pop_front()
    }

    /// Completed but unverified pieces, keyed by index.
    ///
    /// The mutex is the buffer lock: producers and consumers both hold it.
    pub fn completed(&self) -> &Mutex<HashMap<u32, Vec<u8>>> {
        &self.inner.completed
    }
}
