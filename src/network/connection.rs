use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::{
    net::{tcp::OwnedReadHalf, TcpListener, TcpStream},
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::handshake::{self, HandshakeOutcome};
use super::messages::ConnectionString;
use super::registry::{ConnectionId, PeerConnection, PeerRegistry};
use super::transport::{Inbound, SecureTransport};
use super::NetworkEvent;
use crate::config::NodeConfig;
use crate::crypto::CryptoManager;
use crate::error::{P2PError, P2PResult};
use crate::session::SessionManager;

/// Result of one broadcast
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Connections dropped because their session was invalid or the send failed
    pub removed: Vec<ConnectionId>,
}

/// One row of the `sessions` listing
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub conn: ConnectionId,
    pub peer_id: String,
    pub addr: SocketAddr,
    pub session_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub operation_count: u64,
    pub valid: bool,
}

/// Owns the listener, every live connection and their receive tasks.
///
/// This is the only layer that turns crypto, session and transport errors into
/// connection teardown and user-visible events.
#[derive(Clone)]
pub struct ConnectionManager {
    node: Arc<NodeConfig>,
    crypto: Arc<CryptoManager>,
    transport: SecureTransport,
    event_sender: mpsc::UnboundedSender<NetworkEvent>,
    local_addr: Arc<OnceLock<SocketAddr>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ConnectionManager {
    /// Create a manager with a freshly generated RSA keypair
    pub fn new(
        node: NodeConfig,
        sessions: Arc<SessionManager>,
        event_sender: mpsc::UnboundedSender<NetworkEvent>,
    ) -> P2PResult<Self> {
        let crypto = Arc::new(CryptoManager::new()?);
        Self::with_crypto(node, sessions, crypto, event_sender)
    }

    pub fn with_crypto(
        node: NodeConfig,
        sessions: Arc<SessionManager>,
        crypto: Arc<CryptoManager>,
        event_sender: mpsc::UnboundedSender<NetworkEvent>,
    ) -> P2PResult<Self> {
        node.validate()?;
        let registry = Arc::new(PeerRegistry::new());
        Ok(Self {
            node: Arc::new(node),
            crypto,
            transport: SecureTransport::new(sessions, registry),
            event_sender,
            local_addr: Arc::new(OnceLock::new()),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.node.peer_id
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        self.transport.sessions()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        self.transport.registry()
    }

    pub fn transport(&self) -> &SecureTransport {
        &self.transport
    }

    /// Address the listener is bound to, once `listen` succeeded
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// `host:port:secret` other peers use to reach this node
    pub fn connection_string(&self) -> Option<ConnectionString> {
        self.local_addr().map(|addr| {
            ConnectionString::new(self.node.host.clone(), addr.port(), self.node.secret.clone())
        })
    }

    fn emit(&self, event: NetworkEvent) {
        let _ = self.event_sender.send(event);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Bind the listener and start accepting peers in the background.
    ///
    /// Also starts the periodic session garbage collection.
    pub async fn listen(&self) -> P2PResult<SocketAddr> {
        let listener = match TcpListener::bind(self.node.bind_addr()).await {
            Ok(listener) => listener,
            Err(e) => {
                self.emit(NetworkEvent::ListenerFailed(e.to_string()));
                return Err(e.into());
            }
        };
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        info!(%addr, "listening for peers");
        self.emit(NetworkEvent::ListenerStarted(addr));

        let manager = self.clone();
        self.track(tokio::spawn(async move {
            manager.accept_loop(listener).await;
        }));
        self.start_session_gc();

        Ok(addr)
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "incoming connection");
                    let manager = self.clone();
                    self.track(tokio::spawn(async move {
                        manager.handle_incoming(stream, addr).await;
                    }));
                }
                Err(e) => {
                    error!(error = %e, "accepting connections failed");
                    self.emit(NetworkEvent::ListenerFailed(e.to_string()));
                    break;
                }
            }
        }
    }

    async fn handle_incoming(self, mut stream: TcpStream, addr: SocketAddr) {
        match handshake::respond(&mut stream, &self.node.peer_id, &self.node.secret).await {
            Ok(outcome) => {
                self.establish(stream, addr, outcome).await;
            }
            Err(e) => {
                warn!(%addr, error = %e, "inbound handshake failed");
                self.emit(NetworkEvent::ConnectionFailed {
                    target: addr.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Dial a peer, run the handshake and start receiving from it
    pub async fn connect(&self, target: &ConnectionString) -> P2PResult<ConnectionId> {
        match self.dial(target).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                warn!(target = %target.address(), error = %e, "outbound connection failed");
                self.emit(NetworkEvent::ConnectionFailed {
                    target: target.address(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn dial(&self, target: &ConnectionString) -> P2PResult<ConnectionId> {
        let mut stream = TcpStream::connect(target.address()).await?;
        let addr = stream.peer_addr()?;
        let outcome =
            handshake::initiate(&mut stream, &self.crypto, &self.node.peer_id, &target.secret).await?;
        Ok(self.establish(stream, addr, outcome).await)
    }

    async fn establish(&self, stream: TcpStream, addr: SocketAddr, outcome: HandshakeOutcome) -> ConnectionId {
        let HandshakeOutcome {
            aead,
            remote_peer_id,
        } = outcome;

        let session_id = self.sessions().create_session(&remote_peer_id);
        let (reader, writer) = stream.into_split();
        let peer = PeerConnection::new(remote_peer_id.clone(), addr, session_id, aead, writer);
        let closed = peer.closed.clone();
        let conn = self.registry().register(peer).await;

        info!(conn = %conn, peer = %remote_peer_id, %addr, "peer connected");
        self.emit(NetworkEvent::PeerConnected {
            conn,
            peer_id: remote_peer_id.clone(),
            addr,
        });

        let manager = self.clone();
        self.track(tokio::spawn(async move {
            manager.receive_loop(conn, remote_peer_id, reader, closed).await;
        }));
        conn
    }

    async fn receive_loop(
        self,
        conn: ConnectionId,
        peer_id: String,
        mut reader: OwnedReadHalf,
        closed: Arc<Notify>,
    ) {
        let reason = loop {
            tokio::select! {
                _ = closed.notified() => break "connection closed".to_string(),
                result = self.transport.receive_encrypted(conn, &mut reader) => match result {
                    Ok(Inbound::Message(bytes)) => {
                        self.emit(NetworkEvent::MessageReceived {
                            conn,
                            peer_id: peer_id.clone(),
                            content: String::from_utf8_lossy(&bytes).into_owned(),
                        });
                    }
                    Ok(Inbound::Rotated { .. }) => {
                        self.emit(NetworkEvent::SessionRotated {
                            conn,
                            peer_id: peer_id.clone(),
                        });
                    }
                    // the stale session id fails the next application frame
                    Ok(Inbound::RotationRejected(_)) => {}
                    Err(e) if e.is_disconnect() => break "peer disconnected".to_string(),
                    Err(e) if e.is_session_error() => {
                        warn!(conn = %conn, peer = %peer_id, error = %e, "session out of sync");
                        break format!("session out of sync: {}", e);
                    }
                    Err(e) => {
                        warn!(conn = %conn, peer = %peer_id, error = %e, "dropping connection");
                        break e.to_string();
                    }
                },
            }
        };

        self.disconnect(conn, &reason).await;
    }

    /// Remove a connection, invalidate its session and report it. Safe to call
    /// more than once; only the first call has an effect.
    async fn disconnect(&self, conn: ConnectionId, reason: &str) {
        let Some(peer) = self.registry().remove(conn).await else {
            return;
        };
        self.sessions().invalidate(&peer.session_id);

        info!(conn = %conn, peer = %peer.peer_id, %reason, "peer disconnected");
        self.emit(NetworkEvent::PeerDisconnected {
            conn,
            peer_id: peer.peer_id,
            reason: reason.to_string(),
        });
    }

    /// Close and forget a connection
    pub async fn remove(&self, conn: ConnectionId) {
        self.disconnect(conn, "connection removed").await;
    }

    /// Send `message` to every connected peer except `exclude`.
    ///
    /// Works on a snapshot of the registry. Peers whose session is invalid or
    /// whose send fails are removed after the traversal, never during it.
    /// The session check itself happens inside `send_encrypted`, against the
    /// binding current at send time rather than the snapshot's copy.
    pub async fn broadcast(&self, message: &[u8], exclude: Option<ConnectionId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed: Vec<(ConnectionId, String)> = Vec::new();

        for peer in self.registry().snapshot().await {
            if Some(peer.id) == exclude {
                continue;
            }

            match self.transport.send_encrypted(peer.id, message).await {
                Ok(_) => report.delivered += 1,
                Err(P2PError::UnknownConnection(_)) => {}
                Err(e) if e.is_session_error() => {
                    failed.push((peer.id, "session no longer valid".to_string()));
                }
                Err(e) => {
                    warn!(conn = %peer.id, peer = %peer.peer_id, error = %e, "send failed");
                    failed.push((peer.id, format!("send failed: {}", e)));
                }
            }
        }

        for (conn, reason) in failed {
            self.disconnect(conn, &reason).await;
            report.removed.push(conn);
        }
        report
    }

    /// Per-peer session state, for display
    pub async fn sessions_overview(&self) -> Vec<SessionSummary> {
        let mut rows: Vec<SessionSummary> = self
            .registry()
            .snapshot()
            .await
            .into_iter()
            .map(|peer| {
                let info = self.sessions().session_info(&peer.session_id);
                SessionSummary {
                    conn: peer.id,
                    peer_id: peer.peer_id,
                    addr: peer.addr,
                    valid: info.as_ref().is_some_and(|s| s.is_active()),
                    created_at: info.as_ref().map(|s| s.created_at),
                    operation_count: info.map_or(0, |s| s.operation_count),
                    session_id: peer.session_id,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        rows
    }

    pub async fn peer_count(&self) -> usize {
        self.registry().len().await
    }

    fn start_session_gc(&self) {
        let sessions = self.sessions().clone();
        let period = Duration::from_secs(sessions.config().token_lifetime);

        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sessions.collect_garbage();
            }
        }));
    }

    /// Invalidate every session, close every connection and stop all
    /// background tasks.
    pub async fn shutdown(&self) {
        for peer in self.registry().snapshot().await {
            self.disconnect(peer.id, "shutting down").await;
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        info!("network stopped");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("peer_id", &self.node.peer_id)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    fn crypto() -> Arc<CryptoManager> {
        static MANAGER: OnceLock<Arc<CryptoManager>> = OnceLock::new();
        MANAGER
            .get_or_init(|| Arc::new(CryptoManager::new().unwrap()))
            .clone()
    }

    fn node(name: &str) -> (ConnectionManager, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sessions = Arc::new(SessionManager::new(SessionConfig::default()));
        let config = NodeConfig::new(Some(name.to_string()), None, 0);
        (
            ConnectionManager::with_crypto(config, sessions, crypto(), tx).unwrap(),
            rx,
        )
    }

    async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<NetworkEvent>, mut pred: F) -> NetworkEvent
    where
        F: FnMut(&NetworkEvent) -> bool,
    {
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_listen_reports_connection_string() {
        let (alice, mut events) = node("alice");
        assert!(alice.connection_string().is_none());

        let addr = alice.listen().await.unwrap();
        let conn = alice.connection_string().unwrap();
        assert_eq!(conn.port, addr.port());
        assert_eq!(conn.host, "127.0.0.1");
        assert!(matches!(
            events.recv().await,
            Some(NetworkEvent::ListenerStarted(a)) if a == addr
        ));
        alice.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_peers_and_remove_reports() {
        let (hub, mut hub_events) = node("hub");
        hub.listen().await.unwrap();
        let target = hub.connection_string().unwrap();

        let (alice, mut alice_events) = node("alice");
        let (bob, mut bob_events) = node("bob");
        alice.connect(&target).await.unwrap();
        bob.connect(&target).await.unwrap();

        for _ in 0..2 {
            next_matching(&mut hub_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await;
        }

        let report = hub.broadcast(b"hi all", None).await;
        assert_eq!(report.delivered, 2);
        assert!(report.removed.is_empty());

        for events in [&mut alice_events, &mut bob_events] {
            let event = next_matching(events, |e| matches!(e, NetworkEvent::MessageReceived { .. })).await;
            assert!(matches!(
                event,
                NetworkEvent::MessageReceived { ref peer_id, ref content, .. }
                    if peer_id == "hub" && content == "hi all"
            ));
        }

        let overview = hub.sessions_overview().await;
        assert_eq!(overview.len(), 2);
        assert_eq!(overview[0].peer_id, "alice");
        assert!(overview.iter().all(|row| row.valid && row.operation_count == 1));

        let alice_conn = overview[0].conn;
        hub.remove(alice_conn).await;
        hub.remove(alice_conn).await;
        let event = next_matching(&mut hub_events, |e| matches!(e, NetworkEvent::PeerDisconnected { .. })).await;
        assert!(matches!(event, NetworkEvent::PeerDisconnected { conn, .. } if conn == alice_conn));
        assert_eq!(hub.peer_count().await, 1);

        // alice notices the hub went away
        next_matching(&mut alice_events, |e| matches!(e, NetworkEvent::PeerDisconnected { .. })).await;

        hub.shutdown().await;
        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_removes_peer_with_invalid_session() {
        let (hub, mut hub_events) = node("hub");
        hub.listen().await.unwrap();
        let (alice, _alice_events) = node("alice");
        alice.connect(&hub.connection_string().unwrap()).await.unwrap();
        next_matching(&mut hub_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await;

        let row = hub.sessions_overview().await.remove(0);
        hub.sessions().invalidate(&row.session_id);

        let report = hub.broadcast(b"anyone?", None).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.removed, vec![row.conn]);
        assert!(hub.registry().is_empty().await);
        let event = next_matching(&mut hub_events, |e| matches!(e, NetworkEvent::PeerDisconnected { .. })).await;
        assert!(matches!(
            event,
            NetworkEvent::PeerDisconnected { ref reason, .. } if reason == "session no longer valid"
        ));

        hub.shutdown().await;
        alice.shutdown().await;
    }

    #[tokio::test]
    async fn test_frame_on_dead_session_drops_connection_as_session_error() {
        let (hub, mut hub_events) = node("hub");
        hub.listen().await.unwrap();
        let (alice, _alice_events) = node("alice");
        alice.connect(&hub.connection_string().unwrap()).await.unwrap();
        next_matching(&mut hub_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await;

        // alice still thinks the session is fine
        let row = hub.sessions_overview().await.remove(0);
        hub.sessions().invalidate(&row.session_id);
        assert_eq!(alice.broadcast(b"late", None).await.delivered, 1);

        let event = next_matching(&mut hub_events, |e| matches!(e, NetworkEvent::PeerDisconnected { .. })).await;
        match event {
            NetworkEvent::PeerDisconnected { conn, reason, .. } => {
                assert_eq!(conn, row.conn);
                assert!(reason.starts_with("session out of sync"), "reason: {}", reason);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(hub.peer_count().await, 0);

        hub.shutdown().await;
        alice.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_respects_exclude() {
        let (hub, mut hub_events) = node("hub");
        hub.listen().await.unwrap();
        let (alice, _alice_events) = node("alice");
        alice.connect(&hub.connection_string().unwrap()).await.unwrap();
        let conn = match next_matching(&mut hub_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await {
            NetworkEvent::PeerConnected { conn, .. } => conn,
            other => panic!("unexpected event {:?}", other),
        };

        let report = hub.broadcast(b"not for alice", Some(conn)).await;
        assert_eq!(report, BroadcastReport::default());

        hub.shutdown().await;
        alice.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_secret_reports_connection_failed() {
        let (hub, _hub_events) = node("hub");
        hub.listen().await.unwrap();
        let mut target = hub.connection_string().unwrap();
        target.secret = "guess".to_string();

        let (mallory, mut events) = node("mallory");
        assert!(matches!(
            mallory.connect(&target).await,
            Err(P2PError::Handshake(_))
        ));
        assert!(matches!(
            events.recv().await,
            Some(NetworkEvent::ConnectionFailed { .. })
        ));
        assert!(hub.registry().is_empty().await);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_invalidates_sessions() {
        let (hub, mut hub_events) = node("hub");
        hub.listen().await.unwrap();
        let (alice, _alice_events) = node("alice");
        alice.connect(&hub.connection_string().unwrap()).await.unwrap();
        next_matching(&mut hub_events, |e| matches!(e, NetworkEvent::PeerConnected { .. })).await;

        let row = hub.sessions_overview().await.remove(0);
        hub.shutdown().await;

        assert!(!hub.sessions().is_valid(&row.session_id));
        assert_eq!(hub.peer_count().await, 0);
        alice.shutdown().await;
    }
}
