//! Domain identifiers and stream-level value types.
//!
//! These are **pure data** — no I/O, no framework dependencies.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Server-assigned identifier of one logical device (camera, mic, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Server-assigned identifier of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u32);

// ---------------------------------------------------------------------------
// Device kinds
// ---------------------------------------------------------------------------

/// Kind of media device, using the server's `device_type` numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceKind {
    Camera = 1,
    Screen = 2,
    Microphone = 4,
}

impl DeviceKind {
    pub fn is_video(self) -> bool {
        matches!(self, Self::Camera | Self::Screen)
    }

    /// Human-readable name used in device-error messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Screen => "screen capture",
            Self::Microphone => "microphone",
        }
    }
}

impl TryFrom<u8> for DeviceKind {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(Self::Camera),
            2 => Ok(Self::Screen),
            4 => Ok(Self::Microphone),
            other => Err(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Cipher key
// ---------------------------------------------------------------------------

/// 32-byte AES-256-GCM key assigned by the server per stream.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey(pub [u8; 32]);

impl CipherKey {
    /// Parse from the server's 64-hex-char representation.
    pub fn from_hex(s: &str) -> Result<Self, KeyParseError> {
        let s = s.trim();
        if s.len() != 64 {
            return Err(KeyParseError::BadLength(s.len()));
        }
        let raw = hex::decode(s).map_err(|_| KeyParseError::BadDigit)?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&raw);
        Ok(Self(key))
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(***)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyParseError {
    #[error("cipher key must be 64 hex chars, got {0}")]
    BadLength(usize),
    #[error("cipher key contains a non-hex digit")]
    BadDigit,
}

// ---------------------------------------------------------------------------
// Stream identity
// ---------------------------------------------------------------------------

/// Everything the server assigns to one media stream.
///
/// Immutable for the stream's lifetime. `cipher_key == None` means the
/// stream is intentionally unencrypted (server policy, not a fallback).
#[derive(Debug, Clone)]
pub struct StreamIdentity {
    pub ssrc: u32,
    pub transport_port: u16,
    pub cipher_key: Option<CipherKey>,
}

impl StreamIdentity {
    /// Build from a `device_connect` notice. An empty `secure_key` means
    /// the stream runs in the clear.
    pub fn from_assignment(ssrc: u32, port: u16, secure_key: &str) -> Result<Self, KeyParseError> {
        let cipher_key = if secure_key.trim().is_empty() {
            None
        } else {
            Some(CipherKey::from_hex(secure_key)?)
        };
        Ok(Self {
            ssrc,
            transport_port: port,
            cipher_key,
        })
    }
}

// ---------------------------------------------------------------------------
// Resolution packing
// ---------------------------------------------------------------------------

/// Video resolution, packed on the wire as one u32:
/// width in the low 16 bits, height in the high 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u16,
    pub height: u16,
}

impl Resolution {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    pub fn pack(self) -> u32 {
        ((self.height as u32) << 16) | self.width as u32
    }

    pub fn unpack(v: u32) -> Self {
        Self {
            width: (v & 0xFFFF) as u16,
            height: (v >> 16) as u16,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
