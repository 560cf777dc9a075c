use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use crate::crypto::AeadContext;

/// Write half of a peer socket. Holding the lock is what makes a send (or a
/// whole rotation) atomic on the wire.
pub type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Identifies one live connection, independent of the peer's chosen id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything known about a connected peer: identity, session binding,
/// channel key and the socket's write half.
#[derive(Clone)]
pub struct PeerConnection {
    pub id: ConnectionId,
    pub peer_id: String,
    pub addr: SocketAddr,
    pub session_id: String,
    pub aead: Arc<AeadContext>,
    pub writer: SharedWriter,
    /// Signalled once when the connection is removed, to stop its reader
    pub closed: Arc<Notify>,
}

impl PeerConnection {
    pub fn new<W>(
        peer_id: impl Into<String>,
        addr: SocketAddr,
        session_id: impl Into<String>,
        aead: AeadContext,
        writer: W,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            id: ConnectionId::new(),
            peer_id: peer_id.into(),
            addr,
            session_id: session_id.into(),
            aead: Arc::new(aead),
            writer: Arc::new(Mutex::new(writer)),
            closed: Arc::new(Notify::new()),
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// Connected peers keyed by connection.
///
/// Identity, session id and channel key live in the same entry behind one
/// lock, so a connection is either fully registered or not at all.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<ConnectionId, PeerConnection>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection: PeerConnection) -> ConnectionId {
        let id = connection.id;
        debug!(conn = %id, peer = %connection.peer_id, "peer registered");
        self.peers.lock().await.insert(id, connection);
        id
    }

    pub async fn get(&self, id: ConnectionId) -> Option<PeerConnection> {
        self.peers.lock().await.get(&id).cloned()
    }

    /// Current session id bound to the connection
    pub async fn session_of(&self, id: ConnectionId) -> Option<String> {
        self.peers
            .lock()
            .await
            .get(&id)
            .map(|peer| peer.session_id.clone())
    }

    /// Rebind the connection to a new session id. Returns false if the
    /// connection is gone.
    pub async fn update_session(&self, id: ConnectionId, session_id: &str) -> bool {
        self.with_session(id, |current| *current = session_id.to_string())
            .await
            .is_some()
    }

    /// Run `f` on the connection's session binding with the registry locked.
    ///
    /// A check of the bound id and a switch to a new one made inside `f` are
    /// seen by every other task as a single step. `f` must not block.
    pub async fn with_session<T, F>(&self, id: ConnectionId, f: F) -> Option<T>
    where
        F: FnOnce(&mut String) -> T,
    {
        let mut peers = self.peers.lock().await;
        peers.get_mut(&id).map(|peer| f(&mut peer.session_id))
    }

    /// Point-in-time copy of all entries, safe to iterate while peers come
    /// and go.
    pub async fn snapshot(&self) -> Vec<PeerConnection> {
        self.peers.lock().await.values().cloned().collect()
    }

    /// Drop the connection and close its socket. Close errors are ignored and
    /// removing an unknown id is a no-op.
    pub async fn remove(&self, id: ConnectionId) -> Option<PeerConnection> {
        let removed = self.peers.lock().await.remove(&id)?;

        removed.closed.notify_one();
        let mut writer = removed.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);

        debug!(conn = %id, peer = %removed.peer_id, "peer removed");
        Some(removed)
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }
}
