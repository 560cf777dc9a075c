//! Connection setup
//!
//! Frame order on a fresh socket (every frame length-prefixed):
//!
//! 1. initiator -> secret (plaintext)
//! 2. responder -> `OK` or `ERROR` (plaintext, socket closed on `ERROR`)
//! 3. initiator -> RSA public key, SPKI PEM
//! 4. responder -> fresh AES-256 key wrapped with RSA-OAEP
//! 5. initiator -> own peer id, sealed
//! 6. responder -> own peer id, sealed
//!
//! The initiator sends before it receives and the responder receives before
//! it sends, so the two sides never wait on each other.

use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::framing::{read_frame, read_sealed, write_frame, write_sealed};
use super::messages::{STATUS_ERROR, STATUS_OK};
use crate::crypto::{AeadContext, CryptoManager};
use crate::error::{P2PError, P2PResult};

/// Shared channel and the identity the remote side announced
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub aead: AeadContext,
    pub remote_peer_id: String,
}

/// Dialing side of the handshake
pub async fn initiate<S>(
    stream: &mut S,
    crypto: &CryptoManager,
    local_peer_id: &str,
    secret: &str,
) -> P2PResult<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, secret.as_bytes()).await?;
    let status = read_frame(stream).await?;
    if status != STATUS_OK.as_bytes() {
        return Err(P2PError::Handshake("connection refused: invalid secret".to_string()));
    }

    let public_key = crypto.export_public_key()?;
    write_frame(stream, public_key.as_bytes()).await?;

    let wrapped = read_frame(stream).await?;
    let key = crypto.unwrap_symmetric_key(&wrapped)?;
    let aead = AeadContext::from_key(&key)?;
    debug!("channel key received");

    write_sealed(stream, &aead, local_peer_id.as_bytes()).await?;
    let remote_peer_id = decode_peer_id(read_sealed(stream, &aead).await?)?;

    info!(peer = %remote_peer_id, "handshake complete");
    Ok(HandshakeOutcome {
        aead,
        remote_peer_id,
    })
}

/// Accepting side of the handshake.
///
/// A wrong secret is answered with `ERROR` and the stream is shut down.
pub async fn respond<S>(stream: &mut S, local_peer_id: &str, secret: &str) -> P2PResult<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let presented = read_frame(stream).await?;
    if !bool::from(presented.as_slice().ct_eq(secret.as_bytes())) {
        warn!("peer presented an invalid secret");
        write_frame(stream, STATUS_ERROR.as_bytes()).await?;
        let _ = stream.shutdown().await;
        return Err(P2PError::Handshake("invalid secret".to_string()));
    }
    write_frame(stream, STATUS_OK.as_bytes()).await?;

    let public_key = String::from_utf8(read_frame(stream).await?)?;
    let fingerprint = CryptoManager::fingerprint(&public_key)?;
    debug!(%fingerprint, "received peer public key");

    let aead = CryptoManager::new_symmetric_context();
    let wrapped = CryptoManager::wrap_symmetric_key(aead.key_bytes(), &public_key)?;
    write_frame(stream, &wrapped).await?;

    let remote_peer_id = decode_peer_id(read_sealed(stream, &aead).await?)?;
    write_sealed(stream, &aead, local_peer_id.as_bytes()).await?;

    info!(peer = %remote_peer_id, %fingerprint, "handshake complete");
    Ok(HandshakeOutcome {
        aead,
        remote_peer_id,
    })
}

fn decode_peer_id(bytes: Vec<u8>) -> P2PResult<String> {
    let peer_id = String::from_utf8(bytes)?;
    if peer_id.trim().is_empty() {
        return Err(P2PError::Handshake("peer sent an empty id".to_string()));
    }
    Ok(peer_id)
}
