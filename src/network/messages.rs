use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{P2PError, P2PResult};
use crate::session::TOKEN_BYTES;

/// Handshake reply when the presented secret matches
pub const STATUS_OK: &str = "OK";

/// Handshake reply when it does not; the socket is closed afterwards
pub const STATUS_ERROR: &str = "ERROR";

const ROTATION_TYPE: &str = "session_rotation";

/// Length of an unpadded URL-safe base64 encoding of `TOKEN_BYTES`
const ENCODED_TOKEN_LEN: usize = (TOKEN_BYTES * 4 + 2) / 3;

/// Exact JSON shape of a rotation notice. Extra fields are refused.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoticeRecord {
    #[serde(rename = "type")]
    kind: String,
    token: String,
    new_session: String,
}

/// In-band control frame announcing that the sender moved the connection to
/// `new_session`, authorized by `token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationNotice {
    pub token: String,
    pub new_session: String,
}

impl RotationNotice {
    pub fn new(token: impl Into<String>, new_session: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            new_session: new_session.into(),
        }
    }

    pub fn to_bytes(&self) -> P2PResult<Vec<u8>> {
        let record = NoticeRecord {
            kind: ROTATION_TYPE.to_string(),
            token: self.token.clone(),
            new_session: self.new_session.clone(),
        };
        Ok(serde_json::to_vec(&record)?)
    }

    /// Decode a rotation notice from an opened payload.
    ///
    /// Returns `None` for anything that is not exactly a notice: other JSON,
    /// plain chat text, a wrong type tag or malformed identifiers.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let record: NoticeRecord = serde_json::from_slice(payload).ok()?;
        if record.kind != ROTATION_TYPE
            || !is_identifier(&record.token)
            || !is_identifier(&record.new_session)
        {
            return None;
        }
        Some(Self {
            token: record.token,
            new_session: record.new_session,
        })
    }
}

fn is_identifier(value: &str) -> bool {
    value.len() == ENCODED_TOKEN_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// `host:port:secret`, as printed by a listening node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host: String,
    pub port: u16,
    pub secret: String,
}

impl ConnectionString {
    pub fn new(host: impl Into<String>, port: u16, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            secret: secret.into(),
        }
    }

    pub fn parse(input: &str) -> P2PResult<Self> {
        let parts: Vec<&str> = input.trim().split(':').collect();
        let [host, port, secret] = parts.as_slice() else {
            return Err(P2PError::InvalidConnectionString(
                "expected host:port:secret".to_string(),
            ));
        };

        if host.is_empty() || secret.is_empty() {
            return Err(P2PError::InvalidConnectionString(
                "host and secret cannot be empty".to_string(),
            ));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| P2PError::InvalidConnectionString(format!("invalid port: {}", port)))?;

        Ok(Self::new(*host, port, *secret))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.secret)
    }
}
