//! Length-prefixed framing
//!
//! Every frame on the wire is a 4-byte big-endian length followed by exactly
//! that many payload bytes. After the handshake the payload is always an AEAD
//! blob (`nonce || ciphertext || tag`).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::AeadContext;
use crate::error::{P2PResult, TransportError};

/// Largest payload accepted from a peer
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Write one frame as a single buffer so the prefix and payload are never
/// interleaved with another writer's bytes.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, accumulating short reads until the full payload arrived.
///
/// A peer hanging up before or inside a frame is `TransportError::Closed`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_bytes = [0u8; LENGTH_PREFIX];
    read_exact_or_closed(reader, &mut len_bytes).await?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    read_exact_or_closed(reader, &mut payload).await?;
    Ok(payload)
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
        Err(e) => Err(TransportError::Io(e)),
    }
}

/// Seal `plaintext` under `aead` and write it as one frame
pub async fn write_sealed<W>(writer: &mut W, aead: &AeadContext, plaintext: &[u8]) -> P2PResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let blob = aead.seal(plaintext)?;
    write_frame(writer, &blob).await?;
    Ok(())
}

/// Read one frame and open it under `aead`
pub async fn read_sealed<R>(reader: &mut R, aead: &AeadContext) -> P2PResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let blob = read_frame(reader).await?;
    Ok(aead.open(&blob)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CryptoError, P2PError};

    #[tokio::test]
    async fn test_frame_layout_is_big_endian_length_prefix() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"abc").await.unwrap();

        let mut raw = [0u8; 7];
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_frames_survive_short_reads() {
        // an 8-byte pipe forces every frame through many partial reads
        let (mut client, mut server) = tokio::io::duplex(8);
        let payload: Vec<u8> = (0..=255u8).cycle().take(5000).collect();

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut client, &payload).await.unwrap();
            write_frame(&mut client, b"").await.unwrap();
        });

        assert_eq!(read_frame(&mut server).await.unwrap(), expected);
        assert!(read_frame(&mut server).await.unwrap().is_empty());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_is_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_closed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 10, 1, 2, 3]).await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(TransportError::FrameTooLarge { size, max: MAX_FRAME_SIZE }) if size == u32::MAX as usize
        ));
    }

    #[tokio::test]
    async fn test_sealed_frames_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let aead = AeadContext::generate();

        write_sealed(&mut client, &aead, b"hello").await.unwrap();
        assert_eq!(read_sealed(&mut server, &aead).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_sealed_frame_with_wrong_key_is_crypto_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_sealed(&mut client, &AeadContext::generate(), b"hello")
            .await
            .unwrap();
        let err = read_sealed(&mut server, &AeadContext::generate())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            P2PError::Crypto(CryptoError::AuthenticationFailed)
        ));
    }
}
