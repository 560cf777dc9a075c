use std::sync::Arc;

use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use super::framing::{read_sealed, write_sealed};
use super::messages::RotationNotice;
use super::registry::{ConnectionId, PeerRegistry};
use crate::error::{P2PError, P2PResult, SessionError};
use crate::session::{RejectReason, Rotation, SessionManager};

/// What a call to `send_encrypted` put on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message went out under the current session
    Sent,
    /// The session was rotated first; the notice and then `redelivered`
    /// queued messages (including this one) went out
    Rotated {
        new_session: String,
        redelivered: usize,
    },
}

/// One frame read by `receive_encrypted`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Application payload for the caller
    Message(Vec<u8>),
    /// A rotation notice was accepted and the connection now uses `new_session`
    Rotated { new_session: String },
    /// A rotation notice was refused; the connection keeps its session id
    RotationRejected(RejectReason),
}

/// Encrypted send/receive on registered connections, with transparent
/// session rotation.
#[derive(Debug, Clone)]
pub struct SecureTransport {
    sessions: Arc<SessionManager>,
    registry: Arc<PeerRegistry>,
}

impl SecureTransport {
    pub fn new(sessions: Arc<SessionManager>, registry: Arc<PeerRegistry>) -> Self {
        Self { sessions, registry }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Seal and send `plaintext` to the connection.
    ///
    /// If the session is due for rotation the message is held back, a
    /// rotation notice goes out first under the same channel key, the
    /// connection switches to the new session and the held-back message
    /// follows. The writer lock is held for the whole sequence, so no other
    /// send on this connection can slip in between.
    pub async fn send_encrypted(&self, conn: ConnectionId, plaintext: &[u8]) -> P2PResult<SendOutcome> {
        let peer = self
            .registry
            .get(conn)
            .await
            .ok_or(P2PError::UnknownConnection(conn))?;
        let mut writer = peer.writer.lock().await;

        // the connection moves to the new id in the same step that retires
        // the old one, so the reader never sees a dead binding
        let step = self
            .registry
            .with_session(conn, |current| -> Result<SendStep, SessionError> {
                if !self.sessions.is_valid(current) {
                    return Err(SessionError::NotActive);
                }
                if !self.sessions.rotation_due(current) {
                    return Ok(SendStep::Current(current.clone()));
                }
                let rotation = self.sessions.rotate(current)?;
                *current = rotation.new_session.clone();
                Ok(SendStep::Rotated(rotation))
            })
            .await
            .ok_or(P2PError::UnknownConnection(conn))??;

        let rotation = match step {
            SendStep::Current(session_id) => {
                write_sealed(&mut **writer, &peer.aead, plaintext).await?;
                self.sessions.record_operation(&session_id);
                return Ok(SendOutcome::Sent);
            }
            SendStep::Rotated(rotation) => rotation,
        };

        let new_session = rotation.new_session.clone();
        self.sessions.enqueue(&new_session, plaintext.to_vec())?;
        // taken before the notice is visible to anyone
        let queued = self.sessions.drain(&new_session);

        let notice = RotationNotice::new(rotation.token, new_session.clone()).to_bytes()?;
        write_sealed(&mut **writer, &peer.aead, &notice).await?;
        info!(conn = %conn, peer = %peer.peer_id, "session rotated");

        for message in &queued {
            write_sealed(&mut **writer, &peer.aead, message).await?;
            self.sessions.record_operation(&new_session);
        }

        Ok(SendOutcome::Rotated {
            new_session,
            redelivered: queued.len(),
        })
    }

    /// Read and open the next frame from the connection's read half.
    ///
    /// Rotation notices are consumed here and never returned as messages.
    /// Application messages are only returned while the connection's session
    /// is valid; otherwise the session error is returned and the connection
    /// must be torn down.
    pub async fn receive_encrypted<R>(&self, conn: ConnectionId, reader: &mut R) -> P2PResult<Inbound>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let peer = self
            .registry
            .get(conn)
            .await
            .ok_or(P2PError::UnknownConnection(conn))?;
        let payload = read_sealed(reader, &peer.aead).await?;

        if let Some(notice) = RotationNotice::parse(&payload) {
            return self.apply_notice(conn, notice).await;
        }

        let accepted = self
            .registry
            .with_session(conn, |current| {
                let valid = self.sessions.is_valid(current);
                if valid {
                    self.sessions.record_operation(current);
                }
                valid
            })
            .await
            .ok_or(P2PError::UnknownConnection(conn))?;
        if !accepted {
            return Err(SessionError::NotActive.into());
        }
        Ok(Inbound::Message(payload))
    }

    async fn apply_notice(&self, conn: ConnectionId, notice: RotationNotice) -> P2PResult<Inbound> {
        let verdict = self
            .registry
            .with_session(conn, |current| -> Result<(), SessionError> {
                self.sessions
                    .receive_transition(current, &notice.new_session, &notice.token)?;
                *current = notice.new_session.clone();
                Ok(())
            })
            .await
            .ok_or(P2PError::UnknownConnection(conn))?;
        match verdict {
            Ok(()) => {}
            Err(SessionError::TransitionRejected(reason)) => {
                warn!(conn = %conn, %reason, "rotation notice rejected");
                return Ok(Inbound::RotationRejected(reason));
            }
            Err(e) => return Err(e.into()),
        }
        info!(conn = %conn, "peer rotated session");

        // the initiator flushes its own queue, so this only holds what was
        // queued locally under the new id
        let queued = self.sessions.drain(&notice.new_session);
        if !queued.is_empty() {
            let peer = self
                .registry
                .get(conn)
                .await
                .ok_or(P2PError::UnknownConnection(conn))?;
            let mut writer = peer.writer.lock().await;
            for message in &queued {
                write_sealed(&mut **writer, &peer.aead, message).await?;
                self.sessions.record_operation(&notice.new_session);
            }
            debug!(conn = %conn, count = queued.len(), "queued messages redelivered");
        }

        Ok(Inbound::Rotated {
            new_session: notice.new_session,
        })
    }
}

/// What `send_encrypted` decided under the registry lock
enum SendStep {
    Current(String),
    Rotated(Rotation),
}
