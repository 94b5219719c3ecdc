//! Per-session lifecycle states.

/// Lifecycle of a capture session or render channel.
///
/// Created on user/server-triggered start, destroyed on explicit stop
/// or a fatal local-capture failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Acquiring the local device; no network identity exists yet.
    LocalStarting,
    /// Device running, frames pumping, not yet announced to the server.
    LocalActive,
    /// Stream identity assigned; media link coming up.
    Attaching,
    Connected,
    /// Media link lost; backoff reconnection underway.
    Reconnecting,
    Stopping,
    Stopped,
}
