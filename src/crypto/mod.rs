//! Cryptography module for the P2P chat node
//!
//! This module provides:
//! - Handshake keys (ephemeral RSA-2048, OAEP key transport)
//! - Channel encryption (AES-256-GCM with a random nonce per message)

mod aead;
mod manager;

pub use aead::{AeadContext, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use manager::{CryptoManager, RSA_KEY_BITS};
