//! Error taxonomy for session and control-plane failures.
//!
//! Transport drops are not here: links absorb them with backoff and
//! never surface them as errors. Packet-level auth failures live in
//! [`crate::adapters::crypto::CipherError`] and only ever cost one
//! packet.

use crate::domain::control::ConnectResult;
use crate::domain::identity::DeviceKind;

// ---------------------------------------------------------------------------
// Device errors
// ---------------------------------------------------------------------------

/// Why a capture device could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// Held by another application.
    Busy,
    /// The user or platform denied access.
    Denied,
    /// Requested constraints cannot be met.
    Unsupported,
    /// No such device.
    Unavailable,
}

/// Fatal to one capture session only; reported to the user with a
/// device-class-specific message and never retried automatically.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", self.user_message())]
pub struct DeviceError {
    pub device: DeviceKind,
    pub fault: DeviceFault,
}

impl DeviceError {
    pub fn new(device: DeviceKind, fault: DeviceFault) -> Self {
        Self { device, fault }
    }

    /// The message shown to the user.
    pub fn user_message(&self) -> String {
        let label = self.device.label();
        match self.fault {
            DeviceFault::Busy => format!(
                "The {label} is already in use by another application. \
                 Close it and try again."
            ),
            DeviceFault::Denied => format!(
                "Access to the {label} was denied. Allow access in your \
                 system settings and try again."
            ),
            DeviceFault::Unsupported => format!(
                "The current {label} settings are not supported. Try a \
                 different resolution or device."
            ),
            DeviceFault::Unavailable => format!("No {label} is available."),
        }
    }
}

// ---------------------------------------------------------------------------
// Control-plane login failures
// ---------------------------------------------------------------------------

/// A rejected control-plane logon. Fatal: the client returns to the
/// login state and all media sessions are torn down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoginFailure {
    #[error("invalid login or password")]
    BadCredentials,
    #[error("this client version is out of date")]
    StaleClient,
    #[error("redirected to another server")]
    Redirect,
    #[error("the server has no free connection slots")]
    NoSlots,
    #[error("internal server error")]
    ServerError,
    #[error("this address is banned after repeated failed login attempts")]
    IpBanned,
    #[error("unknown connect result: {0}")]
    Unknown(u8),
}

impl LoginFailure {
    /// `None` when the result code means success.
    pub fn from_result(result: ConnectResult) -> Option<Self> {
        match result {
            ConnectResult::Ok => None,
            ConnectResult::BadCredentials => Some(Self::BadCredentials),
            ConnectResult::StaleClient => Some(Self::StaleClient),
            ConnectResult::Redirect => Some(Self::Redirect),
            ConnectResult::NoSlots => Some(Self::NoSlots),
            ConnectResult::ServerError => Some(Self::ServerError),
            ConnectResult::IpBanned => Some(Self::IpBanned),
            ConnectResult::Unknown(code) => Some(Self::Unknown(code)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
