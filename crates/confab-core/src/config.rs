//! Client configuration.
//!
//! Serde-deserializable with full defaults; the embedding application
//! decides the on-disk format.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol version sent in `connect_request.client_version`.
pub const CLIENT_VERSION: u32 = 1000;

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base WebSocket URL of the server, e.g. `wss://host:8080`.
    pub server_url: String,
    pub backoff: BackoffConfig,
    pub watchdog: WatchdogConfig,
    pub media: MediaConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            backoff: BackoffConfig::default(),
            watchdog: WatchdogConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reconnection backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 8_000,
            jitter_ms: 250,
        }
    }
}

// ---------------------------------------------------------------------------
// Stale-link watchdog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub period_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            period_ms: 5_000,
            stale_after_ms: 30_000,
        }
    }
}

impl WatchdogConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

// ---------------------------------------------------------------------------
// Media tuning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub video_bitrate: u32,
    pub video_fps: u32,
    pub screen_bitrate: u32,
    pub screen_fps: u32,
    pub audio_bitrate: u32,
    pub audio_channels: u16,
    /// Playout ring capacity in samples per channel (1 s at 48 kHz).
    pub ring_capacity: usize,
    pub ring_channels: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_bitrate: 1_200_000,
            video_fps: 25,
            screen_bitrate: 1_500_000,
            screen_fps: 15,
            audio_bitrate: 64_000,
            audio_channels: 1,
            ring_capacity: 48_000,
            ring_channels: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: ClientConfig =
            serde_json::from_str(r#"{"server_url":"wss://example:8080"}"#).unwrap();
        assert_eq!(cfg.server_url, "wss://example:8080");
        assert_eq!(cfg.backoff.base_ms, 500);
        assert_eq!(cfg.backoff.max_ms, 8_000);
        assert_eq!(cfg.watchdog.stale_after(), Duration::from_secs(30));
        assert_eq!(cfg.media.video_fps, 25);
    }

    #[test]
    fn partial_section_overrides_only_named_fields() {
        let cfg: ClientConfig =
            serde_json::from_str(r#"{"backoff":{"max_ms":2000}}"#).unwrap();
        assert_eq!(cfg.backoff.max_ms, 2_000);
        assert_eq!(cfg.backoff.base_ms, 500);
    }
}
