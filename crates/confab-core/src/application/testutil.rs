//! Shared fakes for exercising use cases without real sockets, devices,
//! or codecs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::domain::identity::{DeviceKind, Resolution};

use super::error::{DeviceError, DeviceFault};
use super::ports::{
    AudioBlock, AudioDecoder, AudioEncoder, AudioEncoderConfig, CaptureBackend,
    CaptureConstraints, CaptureStream, Dialer, EncodedChunk, MessageSocket, PresentationSurface,
    RawFrame, SocketMessage, VideoDecoder, VideoEncoder, VideoEncoderConfig, VideoFrame,
};

// ---------------------------------------------------------------------------
// Fake sockets
// ---------------------------------------------------------------------------

/// Client half of an in-memory socket.
pub struct FakeSocket {
    inbound: mpsc::UnboundedReceiver<SocketMessage>,
    outbound: mpsc::UnboundedSender<SocketMessage>,
    closed: bool,
}

/// Test-side handle: inject server messages, observe client messages.
pub struct FakePeer {
    pub to_client: mpsc::UnboundedSender<SocketMessage>,
    pub from_client: mpsc::UnboundedReceiver<SocketMessage>,
}

pub fn socket_pair() -> (FakeSocket, FakePeer) {
    let (to_client, inbound) = mpsc::unbounded_channel();
    let (outbound, from_client) = mpsc::unbounded_channel();
    (
        FakeSocket {
            inbound,
            outbound,
            closed: false,
        },
        FakePeer {
            to_client,
            from_client,
        },
    )
}

impl FakePeer {
    pub fn send_text(&self, text: &str) {
        let _ = self.to_client.send(SocketMessage::Text(text.to_owned()));
    }

    pub fn send_binary(&self, data: Bytes) {
        let _ = self.to_client.send(SocketMessage::Binary(data));
    }

    pub fn ack_logon(&self) {
        self.send_text(r#"{"connect_response":{"result":1}}"#);
    }

    /// Await the next message the client sent.
    pub async fn next_from_client(&mut self) -> Option<SocketMessage> {
        self.from_client.recv().await
    }
}

#[async_trait]
impl MessageSocket for FakeSocket {
    async fn send(&mut self, msg: SocketMessage) -> anyhow::Result<()> {
        if self.closed {
            anyhow::bail!("socket closed");
        }
        self.outbound
            .send(msg)
            .map_err(|_| anyhow::anyhow!("peer gone"))
    }

    async fn recv(&mut self) -> Option<anyhow::Result<SocketMessage>> {
        if self.closed {
            return None;
        }
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed = true;
        self.inbound.close();
    }
}

// ---------------------------------------------------------------------------
// Fake dialer
// ---------------------------------------------------------------------------

pub enum DialScript {
    Refuse,
    Accept(FakeSocket),
}

/// Pops one scripted outcome per dial attempt; refuses once exhausted.
pub struct FakeDialer {
    scripts: Mutex<VecDeque<DialScript>>,
    pub dials: AtomicUsize,
}

impl FakeDialer {
    pub fn new(scripts: Vec<DialScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, _url: &str) -> anyhow::Result<Box<dyn MessageSocket>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(DialScript::Accept(socket)) => Ok(Box::new(socket)),
            Some(DialScript::Refuse) | None => anyhow::bail!("connection refused"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fake capture
// ---------------------------------------------------------------------------

/// Capture backend that hands out pre-scripted frame streams.
pub struct FakeCapture {
    streams: Mutex<VecDeque<Result<FakeCaptureStream, DeviceError>>>,
}

impl FakeCapture {
    pub fn with_stream(stream: FakeCaptureStream) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(VecDeque::from([Ok(stream)])),
        })
    }

    pub fn failing(error: DeviceError) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(VecDeque::from([Err(error)])),
        })
    }
}

#[async_trait]
impl CaptureBackend for FakeCapture {
    async fn acquire(
        &self,
        kind: DeviceKind,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, DeviceError> {
        match self.streams.lock().unwrap().pop_front() {
            Some(Ok(stream)) => Ok(Box::new(stream)),
            Some(Err(e)) => Err(e),
            None => Err(DeviceError::new(kind, DeviceFault::Unavailable)),
        }
    }
}

/// Replays a fixed list of frames, one per millisecond (a fast but
/// paced device). After the list runs out it either loops the last
/// frame (`endless`) or idles forever.
pub struct FakeCaptureStream {
    frames: VecDeque<RawFrame>,
    repeat: Option<RawFrame>,
    pub released: Arc<AtomicUsize>,
}

impl FakeCaptureStream {
    fn video_frame(resolution: Resolution, tag: u8) -> RawFrame {
        RawFrame::Video(VideoFrame {
            resolution,
            data: Bytes::from(vec![tag; 32]),
        })
    }

    fn audio_frame(sample_rate: u32, energy: f32) -> RawFrame {
        RawFrame::Audio(AudioBlock {
            channels: vec![vec![energy; 960]],
            sample_rate,
        })
    }

    pub fn video(count: usize, resolution: Resolution) -> Self {
        let frames = (0..count)
            .map(|i| Self::video_frame(resolution, i as u8))
            .collect();
        Self {
            frames,
            repeat: None,
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Video frames forever, like a live camera.
    pub fn video_endless(resolution: Resolution) -> Self {
        Self {
            frames: VecDeque::new(),
            repeat: Some(Self::video_frame(resolution, 0xCC)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn audio(count: usize, sample_rate: u32, energy: f32) -> Self {
        let frames = (0..count)
            .map(|_| Self::audio_frame(sample_rate, energy))
            .collect();
        Self {
            frames,
            repeat: None,
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Audio blocks forever, like an open microphone.
    pub fn audio_endless(sample_rate: u32, energy: f32) -> Self {
        Self {
            frames: VecDeque::new(),
            repeat: Some(Self::audio_frame(sample_rate, energy)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn release_probe(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.released)
    }
}

#[async_trait]
impl CaptureStream for FakeCaptureStream {
    async fn next_frame(&mut self) -> Option<RawFrame> {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        match self.frames.pop_front() {
            Some(frame) => Some(frame),
            None => match &self.repeat {
                Some(frame) => Some(frame.clone()),
                None => {
                    // Keep the session pump alive without busy-looping.
                    std::future::pending::<()>().await;
                    None
                }
            },
        }
    }

    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Fake codecs
// ---------------------------------------------------------------------------

/// "Encodes" by prefixing a tag byte. All probes are shared so tests
/// keep visibility after the encoder moves into a session.
#[derive(Default)]
pub struct FakeVideoEncoder {
    pub configured: Arc<Mutex<Option<VideoEncoderConfig>>>,
    pub forced_keyframes: Arc<AtomicUsize>,
    pub flushes: Arc<AtomicUsize>,
    pub fail_configure: bool,
    pub fail_flush: bool,
}

impl FakeVideoEncoder {
    pub fn probes(&self) -> (Arc<Mutex<Option<VideoEncoderConfig>>>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (
            Arc::clone(&self.configured),
            Arc::clone(&self.forced_keyframes),
            Arc::clone(&self.flushes),
        )
    }
}

impl VideoEncoder for FakeVideoEncoder {
    fn configure(&mut self, cfg: &VideoEncoderConfig) -> anyhow::Result<()> {
        if self.fail_configure {
            anyhow::bail!("unsupported encoder configuration");
        }
        *self.configured.lock().unwrap() = Some(cfg.clone());
        Ok(())
    }

    fn encode(
        &mut self,
        frame: &VideoFrame,
        force_keyframe: bool,
    ) -> anyhow::Result<Vec<EncodedChunk>> {
        if self.configured.lock().unwrap().is_none() {
            anyhow::bail!("encoder not configured");
        }
        if force_keyframe {
            self.forced_keyframes.fetch_add(1, Ordering::SeqCst);
        }
        let mut data = vec![0xE0];
        data.extend_from_slice(&frame.data);
        Ok(vec![EncodedChunk {
            data: Bytes::from(data),
            is_keyframe: force_keyframe,
        }])
    }

    fn flush(&mut self) -> anyhow::Result<Vec<EncodedChunk>> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_flush {
            anyhow::bail!("flush failed");
        }
        Ok(Vec::new())
    }
}

#[derive(Default)]
pub struct FakeAudioEncoder {
    pub configured: Arc<Mutex<Option<AudioEncoderConfig>>>,
}

impl AudioEncoder for FakeAudioEncoder {
    fn configure(&mut self, cfg: &AudioEncoderConfig) -> anyhow::Result<()> {
        *self.configured.lock().unwrap() = Some(cfg.clone());
        Ok(())
    }

    fn encode(&mut self, block: &AudioBlock) -> anyhow::Result<Vec<EncodedChunk>> {
        if self.configured.lock().unwrap().is_none() {
            anyhow::bail!("encoder not configured");
        }
        // Mark muted blocks so tests can tell silence from speech.
        let peak = block
            .channels
            .first()
            .map(|c| c.iter().fold(0.0f32, |m, s| m.max(s.abs())))
            .unwrap_or(0.0);
        Ok(vec![EncodedChunk {
            data: Bytes::from(vec![0xA0, if peak > 0.0 { 1 } else { 0 }]),
            is_keyframe: false,
        }])
    }

    fn flush(&mut self) -> anyhow::Result<Vec<EncodedChunk>> {
        Ok(Vec::new())
    }
}

/// Decodes by stripping the tag byte the fake encoders added.
#[derive(Default)]
pub struct FakeVideoDecoder {
    pub decoded: Arc<Mutex<Vec<Vec<u8>>>>,
    pub fail_next: Arc<AtomicUsize>,
    pub resets: Arc<AtomicUsize>,
}

impl VideoDecoder for FakeVideoDecoder {
    fn decode(&mut self, chunk: &[u8]) -> anyhow::Result<Vec<VideoFrame>> {
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("decode error");
        }
        self.decoded.lock().unwrap().push(chunk.to_vec());
        Ok(vec![VideoFrame {
            resolution: Resolution::new(864, 480),
            data: Bytes::copy_from_slice(chunk),
        }])
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeAudioDecoder {
    pub decoded: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl AudioDecoder for FakeAudioDecoder {
    fn decode(&mut self, chunk: &[u8]) -> anyhow::Result<Vec<AudioBlock>> {
        self.decoded.lock().unwrap().push(chunk.to_vec());
        Ok(vec![AudioBlock {
            channels: vec![vec![0.25f32; 960]],
            sample_rate: 48_000,
        }])
    }
}

// ---------------------------------------------------------------------------
// Fake surface
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeSurface {
    pub presented: Mutex<Vec<usize>>,
}

impl PresentationSurface for FakeSurface {
    fn present(&self, frame: &VideoFrame) {
        self.presented.lock().unwrap().push(frame.data.len());
    }
}

// ---------------------------------------------------------------------------
// Fake media factory
// ---------------------------------------------------------------------------

use crate::adapters::media::ring::RingConsumer;
use crate::domain::identity::{ClientId, DeviceId};
use super::ports::MediaFactory;

/// Hands out fake codecs and records the sinks it was asked for.
#[derive(Default)]
pub struct FakeMediaFactory {
    pub surface: Arc<FakeSurface>,
    pub decoded_video: Arc<Mutex<Vec<Vec<u8>>>>,
    pub decoded_audio: Arc<Mutex<Vec<Vec<u8>>>>,
    pub audio_outputs: Mutex<Vec<(DeviceId, ClientId, RingConsumer)>>,
    /// Next N video decodes fail (shared into every created decoder).
    pub video_fail_next: Arc<AtomicUsize>,
    pub video_resets: Arc<AtomicUsize>,
}

impl MediaFactory for FakeMediaFactory {
    fn video_encoder(&self, _kind: DeviceKind) -> Box<dyn VideoEncoder> {
        Box::new(FakeVideoEncoder::default())
    }

    fn audio_encoder(&self) -> Box<dyn AudioEncoder> {
        Box::new(FakeAudioEncoder::default())
    }

    fn video_decoder(&self) -> Box<dyn VideoDecoder> {
        Box::new(FakeVideoDecoder {
            decoded: Arc::clone(&self.decoded_video),
            fail_next: Arc::clone(&self.video_fail_next),
            resets: Arc::clone(&self.video_resets),
        })
    }

    fn audio_decoder(&self) -> Box<dyn AudioDecoder> {
        Box::new(FakeAudioDecoder {
            decoded: Arc::clone(&self.decoded_audio),
        })
    }

    fn video_surface(
        &self,
        _device: DeviceId,
        _client: ClientId,
        _label: &str,
    ) -> Arc<dyn PresentationSurface> {
        Arc::clone(&self.surface) as Arc<dyn PresentationSurface>
    }

    fn bind_audio_output(&self, device: DeviceId, client: ClientId, consumer: RingConsumer) {
        self.audio_outputs.lock().unwrap().push((device, client, consumer));
    }
}

// ---------------------------------------------------------------------------
// Fake session events
// ---------------------------------------------------------------------------

use super::error::LoginFailure;
use super::ports::SessionEvents;

/// Records every event for assertions.
#[derive(Debug, Default)]
pub struct FakeEvents {
    pub log: Mutex<Vec<String>>,
}

impl FakeEvents {
    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl SessionEvents for FakeEvents {
    async fn login_succeeded(&self, client_id: ClientId) {
        self.push(format!("login_ok:{}", client_id.0));
    }

    async fn login_failed(&self, failure: &LoginFailure) {
        self.push(format!("login_failed:{failure}"));
    }

    async fn conference_joined(&self, tag: &str, name: &str) {
        self.push(format!("joined:{tag}:{name}"));
    }

    async fn conference_join_failed(&self, result: u8) {
        self.push(format!("join_failed:{result}"));
    }

    async fn conference_left(&self) {
        self.push("left".into());
    }

    async fn device_failed(&self, error: &DeviceError) {
        self.push(format!("device_failed:{}", error.device.label()));
    }

    async fn speaking_changed(&self, speaking: bool) {
        self.push(format!("speaking:{speaking}"));
    }

    async fn chat_delivery(&self, _payload: &serde_json::Value) {
        self.push("chat".into());
    }

    async fn control_offline(&self) {
        self.push("offline".into());
    }
}
