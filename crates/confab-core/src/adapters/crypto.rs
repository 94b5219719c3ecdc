//! Packet AEAD: AES-256-GCM over media payloads.
//!
//! The unencrypted 12-byte packet header is the AAD; the nonce is derived
//! from header fields and never stored. Implements the per-stream cipher
//! used by the splitter and render paths.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};

use crate::domain::identity::CipherKey;
use crate::domain::wire::PACKET_HEADER_LEN;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// AEAD failures. `AuthFailure` is expected at line rate (loss or
/// tampering) and must never terminate a stream — callers drop the
/// packet and log.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("packet authentication failed")]
    AuthFailure,
    #[error("packet header too short to derive a nonce")]
    ShortHeader,
    #[error("payload could not be sealed")]
    SealFailure,
}

// ---------------------------------------------------------------------------
// PacketCipher
// ---------------------------------------------------------------------------

/// Per-stream AEAD context. The key schedule is computed once at
/// construction; a stream's key never changes.
pub struct PacketCipher {
    cipher: Aes256Gcm,
}

impl PacketCipher {
    pub fn new(key: &CipherKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)),
        }
    }

    /// Encrypt `plaintext`, binding the 12-byte packet header as AAD.
    /// Returns ciphertext with the 128-bit tag appended.
    pub fn seal(&self, header12: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce_bytes = derive_nonce(header12)?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        self.cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &header12[..PACKET_HEADER_LEN],
                },
            )
            .map_err(|_| CipherError::SealFailure)
    }

    /// Decrypt a `ciphertext ‖ tag` blob sealed against `header12`.
    /// Any mutation of ciphertext, tag, or header yields `AuthFailure`.
    pub fn open(&self, header12: &[u8], cipher_tag: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce_bytes = derive_nonce(header12)?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: cipher_tag,
                    aad: &header12[..PACKET_HEADER_LEN],
                },
            )
            .map_err(|_| CipherError::AuthFailure)
    }
}

// ---------------------------------------------------------------------------
// Nonce derivation
// ---------------------------------------------------------------------------

/// `nonce = ssrc(4) ‖ timestamp(4) ‖ seq(2) ‖ 0x0000`, read straight out
/// of the header so the AAD and nonce can never disagree. Uniqueness
/// holds because (ssrc, timestamp, seq) is unique per stream direction.
fn derive_nonce(header12: &[u8]) -> Result<[u8; 12], CipherError> {
    if header12.len() < PACKET_HEADER_LEN {
        return Err(CipherError::ShortHeader);
    }
    let mut nonce = [0u8; 12];
    nonce[0..4].copy_from_slice(&header12[8..12]); // ssrc
    nonce[4..8].copy_from_slice(&header12[4..8]); // timestamp
    nonce[8..10].copy_from_slice(&header12[2..4]); // seq
    Ok(nonce)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
