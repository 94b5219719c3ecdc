//! Port traits (interfaces) that use cases depend on.
//!
//! Adapters implement these; use cases never reference tungstenite,
//! platform codecs, or any UI framework. The capture/codec/surface
//! ports wrap the platform's opaque media primitives, which sit outside
//! this crate's boundary.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::identity::{ClientId, DeviceKind, Resolution};
use super::error::{DeviceError, LoginFailure};

// ---------------------------------------------------------------------------
// Message socket (WebSocket abstraction)
// ---------------------------------------------------------------------------

/// One message on a full-duplex, message-oriented connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Text(String),
    Binary(Bytes),
}

/// A live message-oriented connection.
#[async_trait]
pub trait MessageSocket: Send {
    async fn send(&mut self, msg: SocketMessage) -> anyhow::Result<()>;

    /// Next inbound message; `None` once the peer closed the connection.
    async fn recv(&mut self) -> Option<anyhow::Result<SocketMessage>>;

    /// Close the connection. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens message-oriented connections (one per TransportLink attempt).
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> anyhow::Result<Box<dyn MessageSocket>>;
}

// ---------------------------------------------------------------------------
// Capture devices
// ---------------------------------------------------------------------------

/// Constraints requested from a capture device. Devices are free to
/// answer with different actual values; the first produced frame is
/// authoritative.
#[derive(Debug, Clone, Default)]
pub struct CaptureConstraints {
    pub resolution: Option<Resolution>,
    pub fps: u32,
    pub channels: u16,
    pub sample_rate: u32,
    /// Platform device selector, when the user picked one.
    pub device_hint: Option<String>,
}

/// One raw (unencoded) video frame from capture or decode.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub resolution: Resolution,
    /// Opaque pixel data in whatever layout the platform produced.
    pub data: Bytes,
}

/// One block of raw planar audio.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioBlock {
    pub fn samples_per_channel(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }
}

/// What a capture stream produces.
#[derive(Debug, Clone)]
pub enum RawFrame {
    Video(VideoFrame),
    Audio(AudioBlock),
}

/// Acquires platform capture devices.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn acquire(
        &self,
        kind: DeviceKind,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, DeviceError>;
}

/// A running capture device.
#[async_trait]
pub trait CaptureStream: Send {
    /// Next captured frame; `None` once the device stops producing.
    async fn next_frame(&mut self) -> Option<RawFrame>;

    /// Release the underlying device. Must be safe to call repeatedly.
    fn release(&mut self);
}

// ---------------------------------------------------------------------------
// Encoders / decoders (opaque platform codecs)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    pub resolution: Resolution,
    pub fps: u32,
    pub bitrate: u32,
}

#[derive(Debug, Clone)]
pub struct AudioEncoderConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
}

/// One encoder output unit, ready for packetization.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub data: Bytes,
    pub is_keyframe: bool,
}

pub trait VideoEncoder: Send {
    fn configure(&mut self, cfg: &VideoEncoderConfig) -> anyhow::Result<()>;
    fn encode(&mut self, frame: &VideoFrame, force_keyframe: bool)
        -> anyhow::Result<Vec<EncodedChunk>>;
    /// Drain buffered output at teardown. Failures are tolerated.
    fn flush(&mut self) -> anyhow::Result<Vec<EncodedChunk>>;
}

pub trait AudioEncoder: Send {
    fn configure(&mut self, cfg: &AudioEncoderConfig) -> anyhow::Result<()>;
    fn encode(&mut self, block: &AudioBlock) -> anyhow::Result<Vec<EncodedChunk>>;
    fn flush(&mut self) -> anyhow::Result<Vec<EncodedChunk>>;
}

pub trait VideoDecoder: Send {
    fn decode(&mut self, chunk: &[u8]) -> anyhow::Result<Vec<VideoFrame>>;
    /// Drop codec state (background pause, stream restart).
    fn reset(&mut self);
}

pub trait AudioDecoder: Send {
    fn decode(&mut self, chunk: &[u8]) -> anyhow::Result<Vec<AudioBlock>>;
}

/// Where decoded video ends up; owned by the embedding application and
/// kept alive across background pauses.
pub trait PresentationSurface: Send + Sync {
    fn present(&self, frame: &VideoFrame);
}

/// Creates platform codec instances and render sinks on demand.
pub trait MediaFactory: Send + Sync {
    fn video_encoder(&self, kind: DeviceKind) -> Box<dyn VideoEncoder>;
    fn audio_encoder(&self) -> Box<dyn AudioEncoder>;
    fn video_decoder(&self) -> Box<dyn VideoDecoder>;
    fn audio_decoder(&self) -> Box<dyn AudioDecoder>;

    /// Presentation surface for one remote video stream.
    fn video_surface(
        &self,
        device: crate::domain::identity::DeviceId,
        client: ClientId,
        label: &str,
    ) -> std::sync::Arc<dyn PresentationSurface>;

    /// Hand one remote audio stream's playout consumer to the platform's
    /// fixed-period render callback.
    fn bind_audio_output(
        &self,
        device: crate::domain::identity::DeviceId,
        client: ClientId,
        consumer: crate::adapters::media::ring::RingConsumer,
    );
}

// ---------------------------------------------------------------------------
// Session events (UI bridge)
// ---------------------------------------------------------------------------

/// Events surfaced to the embedding application.
#[async_trait]
pub trait SessionEvents: Send + Sync {
    async fn login_succeeded(&self, client_id: ClientId);
    async fn login_failed(&self, failure: &LoginFailure);
    async fn conference_joined(&self, tag: &str, name: &str);
    async fn conference_join_failed(&self, result: u8);
    async fn conference_left(&self);
    async fn device_failed(&self, error: &DeviceError);
    async fn speaking_changed(&self, speaking: bool);
    async fn chat_delivery(&self, payload: &serde_json::Value);
    /// Control link lost while logged out; shown on the login screen.
    async fn control_offline(&self);
}
