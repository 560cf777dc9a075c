//! Peer-to-peer encrypted chat with live session rotation
//!
//! Peers authenticate with a shared secret, agree on an AES-256-GCM channel
//! key through RSA-OAEP key transport, and exchange length-prefixed sealed
//! frames. Session identifiers are rotated in-band on a running connection
//! without dropping messages.

pub mod app;
pub mod config;
pub mod crypto;
pub mod error;
pub mod network;
pub mod session;

pub use config::{NodeConfig, SessionConfig};
pub use error::{P2PError, P2PResult};
pub use network::{ConnectionManager, NetworkEvent};
pub use session::SessionManager;
