use std::net::SocketAddr;

pub mod connection;
pub mod framing;
pub mod handshake;
pub mod messages;
pub mod registry;
pub mod transport;

pub use connection::{BroadcastReport, ConnectionManager, SessionSummary};
pub use framing::MAX_FRAME_SIZE;
pub use messages::{ConnectionString, RotationNotice};
pub use registry::{ConnectionId, PeerConnection, PeerRegistry};
pub use transport::{Inbound, SecureTransport, SendOutcome};

/// Events that the network layer can generate
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    ListenerStarted(SocketAddr),
    ListenerFailed(String),
    PeerConnected {
        conn: ConnectionId,
        peer_id: String,
        addr: SocketAddr,
    },
    MessageReceived {
        conn: ConnectionId,
        peer_id: String,
        content: String,
    },
    /// The peer moved the connection to a new session
    SessionRotated {
        conn: ConnectionId,
        peer_id: String,
    },
    PeerDisconnected {
        conn: ConnectionId,
        peer_id: String,
        reason: String,
    },
    ConnectionFailed {
        target: String,
        error: String,
    },
}
