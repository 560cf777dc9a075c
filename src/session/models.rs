use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};

/// Number of random bytes behind session ids and transition tokens (256 bits)
pub const TOKEN_BYTES: usize = 32;

/// Lifecycle of a session. `Invalidated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Invalidated,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Invalidated => write!(f, "invalidated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub peer_id: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub operation_count: u64,
}

impl Session {
    pub fn new(peer_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            peer_id: peer_id.into(),
            created_at,
            status: SessionStatus::Active,
            operation_count: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Single-use credential for one old -> new session handoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionToken {
    pub token: String,
    pub old_session: String,
    pub new_session: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl TransitionToken {
    /// Redeemable strictly before `expires_at`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Payload held back while a rotation is in flight
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

/// Result of a successful `rotate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub new_session: String,
    pub token: String,
}

/// Why a transition was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownToken,
    AlreadyUsed,
    Expired,
    SessionMismatch,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            RejectReason::UnknownToken => "unknown token",
            RejectReason::AlreadyUsed => "token already used",
            RejectReason::Expired => "token expired",
            RejectReason::SessionMismatch => "token does not match sessions",
        };
        f.write_str(reason)
    }
}

/// 256-bit random, URL-safe opaque identifier
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
