use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use super::AeadContext;
use crate::error::CryptoError;

/// RSA modulus size used for handshake keys
pub const RSA_KEY_BITS: usize = 2048;

/// Ephemeral RSA keypair used to receive the connection's AES key.
///
/// Keys live for the process only; nothing is persisted.
pub struct CryptoManager {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl CryptoManager {
    /// Generate a new RSA-2048 keypair (public exponent 65537)
    pub fn new() -> Result<Self, CryptoError> {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        debug!(bits = RSA_KEY_BITS, "generated RSA keypair");

        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Public key as SubjectPublicKeyInfo PEM, the form sent during handshake
    pub fn export_public_key(&self) -> Result<String, CryptoError> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::PublicKeyExport(e.to_string()))
    }

    /// Encrypt a symmetric key for the holder of `peer_public_key_pem`.
    ///
    /// RSA-OAEP with SHA-256 for both the hash and MGF1, empty label.
    pub fn wrap_symmetric_key(
        symmetric_key: &[u8],
        peer_public_key_pem: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let peer_public_key = RsaPublicKey::from_public_key_pem(peer_public_key_pem)
            .map_err(|e| CryptoError::WrapFailed(format!("malformed peer public key: {}", e)))?;

        let mut rng = OsRng;
        peer_public_key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), symmetric_key)
            .map_err(|e| CryptoError::WrapFailed(e.to_string()))
    }

    /// Decrypt a wrapped symmetric key with our private key.
    ///
    /// The underlying error is discarded so callers cannot distinguish padding
    /// failures from other decryption failures.
    pub fn unwrap_symmetric_key(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::UnwrapFailed)
    }

    /// Fresh 256-bit AES-GCM context for a new connection
    pub fn new_symmetric_context() -> AeadContext {
        AeadContext::generate()
    }

    pub fn seal_message(context: &AeadContext, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        context.seal(plaintext)
    }

    pub fn open_message(context: &AeadContext, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        context.open(blob)
    }

    /// Short fingerprint of a PEM public key (first 8 bytes of SHA-256 over DER)
    pub fn fingerprint(public_key_pem: &str) -> Result<String, CryptoError> {
        let key = RsaPublicKey::from_public_key_pem(public_key_pem)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let der = key
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

        let hash = Sha256::digest(der.as_bytes());
        let hex = hex::encode_upper(&hash[..8]);
        Ok(format!(
            "{}-{}-{}-{}",
            &hex[0..4],
            &hex[4..8],
            &hex[8..12],
            &hex[12..16]
        ))
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }
}
