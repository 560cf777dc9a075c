use thiserror::Error;

use crate::network::ConnectionId;
use crate::session::RejectReason;

/// Failures of the asymmetric and symmetric primitives.
///
/// Always fatal to the message or handshake that produced them; the same key
/// material is never retried.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("RSA key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Public key export failed: {0}")]
    PublicKeyExport(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Symmetric key wrap failed: {0}")]
    WrapFailed(String),

    #[error("Symmetric key unwrap failed")]
    UnwrapFailed,

    #[error("Invalid symmetric key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("AEAD seal failed")]
    SealFailed,

    #[error("AEAD authentication failed")]
    AuthenticationFailed,
}

/// Session state machine failures. Fatal to the connection that hit them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Session is not active")]
    NotActive,

    #[error("Message queue full for session (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Session transition rejected: {0}")]
    TransitionRejected(RejectReason),
}

/// Stream level failures. Treated as an ordinary disconnect.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Stream closed by peer")]
    Closed,

    #[error("Frame exceeds maximum size: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejected startup configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {key}: {value}. Must be between {min} and {max}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: String, value: String },

    #[error("Invalid node configuration: {0}")]
    InvalidNode(String),
}

/// Main error type for the P2P chat node
#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for P2P operations
pub type P2PResult<T> = Result<T, P2PError>;

impl P2PError {
    /// True for errors that mean the session binding can no longer be trusted.
    pub fn is_session_error(&self) -> bool {
        matches!(self, P2PError::Session(_))
    }

    /// True for errors that are just the peer going away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            P2PError::Transport(TransportError::Closed) | P2PError::Transport(TransportError::Io(_))
        )
    }
}

impl From<std::string::FromUtf8Error> for P2PError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        P2PError::InvalidMessage(format!("UTF-8 decode error: {}", err))
    }
}
