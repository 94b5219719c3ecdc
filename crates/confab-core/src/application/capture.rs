//! Outbound capture sessions, one state machine per device kind.
//!
//! Two-phase lifecycle: `start_local` acquires the device and learns its
//! real geometry from the first produced frame, before any network
//! identity exists; `attach_remote` runs once the server assigns a
//! stream identity, wiring encoder → splitter/packetizer → media link.
//! The pump keeps running across link losses and resumes transmitting,
//! with a forced keyframe, on every fresh logon.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::adapters::media::clock::video_frame_ticks;
use crate::adapters::media::splitter::{AudioPacketizer, FrameSplitter};
use crate::adapters::media::vad::{rms, SpeechTransition, VadConfig, VoiceActivityDetector};
use crate::config::ClientConfig;
use crate::domain::control::ConnectRequest;
use crate::domain::identity::{DeviceId, DeviceKind, Resolution, StreamIdentity};
use crate::domain::session::SessionState;
use crate::domain::wire::{MediaClass, WireFrame};

use super::error::{DeviceError, DeviceFault};
use super::link::{self, LinkEvent, LinkHandle, LinkOptions};
use super::ports::{
    AudioEncoder, AudioEncoderConfig, CaptureBackend, CaptureConstraints, CaptureStream, Dialer,
    RawFrame, SessionEvents, VideoEncoder, VideoEncoderConfig,
};

// ---------------------------------------------------------------------------
// Video (camera / screen)
// ---------------------------------------------------------------------------

struct VideoPipeline {
    encoder: Box<dyn VideoEncoder>,
    splitter: FrameSplitter,
    link: LinkHandle,
    timestamp: u32,
    tick_step: u32,
}

struct VideoShared {
    pipeline: Mutex<Option<VideoPipeline>>,
    /// Media link is open; frames may be encoded and sent.
    transmitting: AtomicBool,
    /// One-shot: force a keyframe on the next encoded frame.
    want_keyframe: AtomicBool,
    state: Arc<watch::Sender<SessionState>>,
}

pub struct VideoCaptureSession {
    kind: DeviceKind,
    capture: Arc<dyn CaptureBackend>,
    dialer: Arc<dyn Dialer>,
    config: ClientConfig,
    shared: Arc<VideoShared>,
    state_rx: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
    link_task: Option<JoinHandle<()>>,
    link: Option<LinkHandle>,
    device_id: Option<DeviceId>,
    resolution: Option<Resolution>,
    stopped: bool,
}

impl VideoCaptureSession {
    pub fn new(
        kind: DeviceKind,
        capture: Arc<dyn CaptureBackend>,
        dialer: Arc<dyn Dialer>,
        config: ClientConfig,
    ) -> Self {
        debug_assert!(kind.is_video());
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let state_tx = Arc::new(state_tx);
        Self {
            kind,
            capture,
            dialer,
            config,
            shared: Arc::new(VideoShared {
                pipeline: Mutex::new(None),
                transmitting: AtomicBool::new(false),
                want_keyframe: AtomicBool::new(false),
                state: state_tx,
            }),
            state_rx,
            cancel: CancellationToken::new(),
            pump: None,
            link_task: None,
            link: None,
            device_id: None,
            resolution: None,
            stopped: false,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.device_id
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    /// Phase one: acquire the device and learn its actual resolution
    /// from the first frame it produces. Touches nothing on the network.
    pub async fn start_local(&mut self) -> Result<Resolution, DeviceError> {
        let _ = self.shared.state.send(SessionState::LocalStarting);

        let (fps, _) = self.tuning();
        let constraints = CaptureConstraints {
            fps,
            ..CaptureConstraints::default()
        };
        let mut stream = match self.capture.acquire(self.kind, &constraints).await {
            Ok(s) => s,
            Err(e) => {
                let _ = self.shared.state.send(SessionState::Stopped);
                return Err(e);
            }
        };

        // Devices often answer with a different geometry than requested;
        // the first frame is authoritative.
        let resolution = match stream.next_frame().await {
            Some(RawFrame::Video(frame)) => frame.resolution,
            _ => {
                stream.release();
                let _ = self.shared.state.send(SessionState::Stopped);
                return Err(DeviceError::new(self.kind, DeviceFault::Unavailable));
            }
        };
        self.resolution = Some(resolution);

        self.pump = Some(tokio::spawn(video_pump(
            stream,
            Arc::clone(&self.shared),
            self.cancel.clone(),
        )));

        let _ = self.shared.state.send(SessionState::LocalActive);
        info!(
            kind = self.kind.label(),
            width = resolution.width,
            height = resolution.height,
            "local capture started"
        );
        Ok(resolution)
    }

    /// Phase two: the server assigned a stream identity. Configure the
    /// encoder to the learned geometry and bring up the media link.
    /// On failure the device is released before returning.
    pub async fn attach_remote(
        &mut self,
        identity: StreamIdentity,
        device_id: DeviceId,
        media_url: &str,
        access_token: &str,
        mut encoder: Box<dyn VideoEncoder>,
    ) -> anyhow::Result<()> {
        if self.stopped {
            anyhow::bail!("session already stopped");
        }
        let Some(resolution) = self.resolution else {
            anyhow::bail!("attach before local capture start");
        };
        let _ = self.shared.state.send(SessionState::Attaching);
        self.device_id = Some(device_id);

        let (fps, bitrate) = self.tuning();
        if let Err(e) = encoder.configure(&VideoEncoderConfig {
            resolution,
            fps,
            bitrate,
        }) {
            warn!(kind = self.kind.label(), "encoder configuration failed: {e}");
            self.stop().await;
            return Err(e);
        }

        let splitter = FrameSplitter::new(&identity);
        let (link, events) = link::spawn(
            Arc::clone(&self.dialer),
            LinkOptions {
                url: media_url.to_owned(),
                logon: ConnectRequest::media(access_token),
                backoff: self.config.backoff.clone(),
                watchdog: self.config.watchdog.clone(),
            },
        );

        *self.shared.pipeline.lock().await = Some(VideoPipeline {
            encoder,
            splitter,
            link: link.clone(),
            timestamp: 0,
            tick_step: video_frame_ticks(fps),
        });
        self.link = Some(link);
        self.link_task = Some(tokio::spawn(video_link_loop(
            events,
            Arc::clone(&self.shared),
        )));

        info!(
            kind = self.kind.label(),
            ssrc = identity.ssrc,
            device = device_id.0,
            "capture session attached"
        );
        Ok(())
    }

    /// Connectivity hint passthrough.
    pub fn kick(&self) {
        if let Some(link) = &self.link {
            link.kick();
        }
    }

    /// Reverse teardown: encoder flush (failure tolerated), device
    /// release, link close. Idempotent and safe from any state.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let _ = self.shared.state.send(SessionState::Stopping);
        self.shared.transmitting.store(false, Ordering::Release);

        if let Some(mut pipe) = self.shared.pipeline.lock().await.take() {
            if let Err(e) = pipe.encoder.flush() {
                warn!(kind = self.kind.label(), "encoder flush failed during stop: {e}");
            }
        }

        self.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }

        if let Some(link) = self.link.take() {
            link.shutdown();
        }
        if let Some(task) = self.link_task.take() {
            task.abort();
        }

        let _ = self.shared.state.send(SessionState::Stopped);
        info!(kind = self.kind.label(), "capture session stopped");
    }

    fn tuning(&self) -> (u32, u32) {
        match self.kind {
            DeviceKind::Screen => (self.config.media.screen_fps, self.config.media.screen_bitrate),
            _ => (self.config.media.video_fps, self.config.media.video_bitrate),
        }
    }
}

async fn video_pump(
    mut stream: Box<dyn CaptureStream>,
    shared: Arc<VideoShared>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next_frame() => frame,
        };
        let Some(frame) = frame else {
            debug!("capture stream ended");
            break;
        };
        let RawFrame::Video(frame) = frame else {
            continue;
        };
        if !shared.transmitting.load(Ordering::Acquire) {
            continue;
        }

        let mut guard = shared.pipeline.lock().await;
        let Some(pipe) = guard.as_mut() else {
            continue;
        };

        let force = shared.want_keyframe.swap(false, Ordering::AcqRel);
        let chunks = match pipe.encoder.encode(&frame, force) {
            Ok(chunks) => chunks,
            Err(e) => {
                if force {
                    // Keep the request armed for the next frame.
                    shared.want_keyframe.store(true, Ordering::Release);
                }
                warn!("video encode failed: {e}");
                continue;
            }
        };

        for chunk in &chunks {
            match pipe
                .splitter
                .split_frame(&chunk.data, pipe.timestamp, chunk.is_keyframe)
            {
                Ok(packets) => {
                    for packet in packets {
                        pipe.link.send_frame(packet);
                    }
                }
                Err(e) => warn!("video packetization failed: {e}"),
            }
        }
        pipe.timestamp = pipe.timestamp.wrapping_add(pipe.tick_step);
    }
    stream.release();
}

async fn video_link_loop(mut events: mpsc::Receiver<LinkEvent>, shared: Arc<VideoShared>) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Up(_) => {
                shared.want_keyframe.store(true, Ordering::Release);
                shared.transmitting.store(true, Ordering::Release);
                let _ = shared.state.send(SessionState::Connected);
                info!("media uplink open, starting with a forced keyframe");
            }
            LinkEvent::Down => {
                shared.transmitting.store(false, Ordering::Release);
                let _ = shared.state.send(SessionState::Reconnecting);
            }
            LinkEvent::Frame(data) => match WireFrame::decode(&data) {
                Some(frame) if frame.media_class == MediaClass::Rtcp => {
                    debug!("receiver requested a keyframe");
                    shared.want_keyframe.store(true, Ordering::Release);
                }
                Some(_) => {}
                None => trace!("undecodable frame on capture uplink"),
            },
            LinkEvent::Control(msg) => trace!(?msg, "ignoring control message on uplink"),
        }
    }
}

// ---------------------------------------------------------------------------
// Audio (microphone)
// ---------------------------------------------------------------------------

/// Actual capture format, learned from the first produced block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

struct AudioPipeline {
    encoder: Box<dyn AudioEncoder>,
    packetizer: AudioPacketizer,
    link: LinkHandle,
    timestamp: u32,
}

struct AudioShared {
    pipeline: Mutex<Option<AudioPipeline>>,
    transmitting: AtomicBool,
    muted: AtomicBool,
    state: Arc<watch::Sender<SessionState>>,
}

pub struct AudioCaptureSession {
    capture: Arc<dyn CaptureBackend>,
    dialer: Arc<dyn Dialer>,
    events: Arc<dyn SessionEvents>,
    config: ClientConfig,
    vad_config: VadConfig,
    shared: Arc<AudioShared>,
    state_rx: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
    link_task: Option<JoinHandle<()>>,
    link: Option<LinkHandle>,
    device_id: Option<DeviceId>,
    format: Option<AudioFormat>,
    stopped: bool,
}

impl AudioCaptureSession {
    pub fn new(
        capture: Arc<dyn CaptureBackend>,
        dialer: Arc<dyn Dialer>,
        events: Arc<dyn SessionEvents>,
        config: ClientConfig,
        vad_config: VadConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        Self {
            capture,
            dialer,
            events,
            config,
            vad_config,
            shared: Arc::new(AudioShared {
                pipeline: Mutex::new(None),
                transmitting: AtomicBool::new(false),
                muted: AtomicBool::new(false),
                state: Arc::new(state_tx),
            }),
            state_rx,
            cancel: CancellationToken::new(),
            pump: None,
            link_task: None,
            link: None,
            device_id: None,
            format: None,
            stopped: false,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.device_id
    }

    /// While muted, silence is encoded instead of microphone input and
    /// the voice detector reads zero energy.
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Release);
    }

    /// Phase one: open the microphone, learn its actual format from the
    /// first block, start the pump (with voice activity detection).
    pub async fn start_local(&mut self) -> Result<AudioFormat, DeviceError> {
        let _ = self.shared.state.send(SessionState::LocalStarting);

        let constraints = CaptureConstraints {
            channels: self.config.media.audio_channels,
            sample_rate: crate::adapters::media::clock::AUDIO_CLOCK_RATE,
            ..CaptureConstraints::default()
        };
        let mut stream = match self.capture.acquire(DeviceKind::Microphone, &constraints).await {
            Ok(s) => s,
            Err(e) => {
                let _ = self.shared.state.send(SessionState::Stopped);
                return Err(e);
            }
        };

        let format = match stream.next_frame().await {
            Some(RawFrame::Audio(block)) => AudioFormat {
                sample_rate: block.sample_rate,
                channels: block.channels.len() as u16,
            },
            _ => {
                stream.release();
                let _ = self.shared.state.send(SessionState::Stopped);
                return Err(DeviceError::new(DeviceKind::Microphone, DeviceFault::Unavailable));
            }
        };
        self.format = Some(format);

        let vad = VoiceActivityDetector::new(self.vad_config.clone());
        self.pump = Some(tokio::spawn(audio_pump(
            stream,
            Arc::clone(&self.shared),
            self.cancel.clone(),
            vad,
            Arc::clone(&self.events),
        )));

        let _ = self.shared.state.send(SessionState::LocalActive);
        info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            "microphone capture started"
        );
        Ok(format)
    }

    /// Phase two: wire encoder → packetizer → media link.
    pub async fn attach_remote(
        &mut self,
        identity: StreamIdentity,
        device_id: DeviceId,
        media_url: &str,
        access_token: &str,
        mut encoder: Box<dyn AudioEncoder>,
    ) -> anyhow::Result<()> {
        if self.stopped {
            anyhow::bail!("session already stopped");
        }
        let Some(format) = self.format else {
            anyhow::bail!("attach before local capture start");
        };
        let _ = self.shared.state.send(SessionState::Attaching);
        self.device_id = Some(device_id);

        if let Err(e) = encoder.configure(&AudioEncoderConfig {
            sample_rate: format.sample_rate,
            channels: format.channels,
            bitrate: self.config.media.audio_bitrate,
        }) {
            warn!("audio encoder configuration failed: {e}");
            self.stop().await;
            return Err(e);
        }

        let packetizer = AudioPacketizer::new(&identity);
        let (link, events) = link::spawn(
            Arc::clone(&self.dialer),
            LinkOptions {
                url: media_url.to_owned(),
                logon: ConnectRequest::media(access_token),
                backoff: self.config.backoff.clone(),
                watchdog: self.config.watchdog.clone(),
            },
        );

        *self.shared.pipeline.lock().await = Some(AudioPipeline {
            encoder,
            packetizer,
            link: link.clone(),
            timestamp: 0,
        });
        self.link = Some(link);
        self.link_task = Some(tokio::spawn(audio_link_loop(
            events,
            Arc::clone(&self.shared),
        )));

        info!(ssrc = identity.ssrc, device = device_id.0, "microphone attached");
        Ok(())
    }

    pub fn kick(&self) {
        if let Some(link) = &self.link {
            link.kick();
        }
    }

    /// Reverse teardown, idempotent. See [`VideoCaptureSession::stop`].
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let _ = self.shared.state.send(SessionState::Stopping);
        self.shared.transmitting.store(false, Ordering::Release);

        if let Some(mut pipe) = self.shared.pipeline.lock().await.take() {
            if let Err(e) = pipe.encoder.flush() {
                warn!("audio encoder flush failed during stop: {e}");
            }
        }

        self.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }

        if let Some(link) = self.link.take() {
            link.shutdown();
        }
        if let Some(task) = self.link_task.take() {
            task.abort();
        }

        let _ = self.shared.state.send(SessionState::Stopped);
        info!("microphone session stopped");
    }
}

async fn audio_pump(
    mut stream: Box<dyn CaptureStream>,
    shared: Arc<AudioShared>,
    cancel: CancellationToken,
    mut vad: VoiceActivityDetector,
    events: Arc<dyn SessionEvents>,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next_frame() => frame,
        };
        let Some(frame) = frame else {
            debug!("microphone stream ended");
            break;
        };
        let RawFrame::Audio(mut block) = frame else {
            continue;
        };

        let muted = shared.muted.load(Ordering::Acquire);
        if muted {
            for channel in &mut block.channels {
                channel.fill(0.0);
            }
        }

        let energy = block.channels.first().map_or(0.0, |c| rms(c));
        if let Some(transition) = vad.update(energy, Instant::now()) {
            let speaking = matches!(transition, SpeechTransition::Started);
            debug!(speaking, "voice activity transition");
            events.speaking_changed(speaking).await;
        }

        if !shared.transmitting.load(Ordering::Acquire) {
            continue;
        }
        let mut guard = shared.pipeline.lock().await;
        let Some(pipe) = guard.as_mut() else {
            continue;
        };

        let chunks = match pipe.encoder.encode(&block) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("audio encode failed: {e}");
                continue;
            }
        };
        for chunk in &chunks {
            match pipe.packetizer.packetize(&chunk.data, pipe.timestamp) {
                Ok(packet) => pipe.link.send_frame(packet),
                Err(e) => warn!("audio packetization failed: {e}"),
            }
        }
        // Timestamp advances by the encoder's per-frame sample step.
        pipe.timestamp = pipe
            .timestamp
            .wrapping_add(block.samples_per_channel() as u32);
    }
    stream.release();
}

async fn audio_link_loop(mut events: mpsc::Receiver<LinkEvent>, shared: Arc<AudioShared>) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Up(_) => {
                shared.transmitting.store(true, Ordering::Release);
                let _ = shared.state.send(SessionState::Connected);
                info!("audio uplink open");
            }
            LinkEvent::Down => {
                shared.transmitting.store(false, Ordering::Release);
                let _ = shared.state.send(SessionState::Reconnecting);
            }
            LinkEvent::Frame(_) | LinkEvent::Control(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::testutil::{
        socket_pair, DialScript, FakeAudioEncoder, FakeCapture, FakeCaptureStream, FakeDialer,
        FakeEvents, FakeVideoEncoder,
    };
    use crate::domain::wire::{header_len, PacketHeader, PT_AUDIO};
    use crate::application::ports::SocketMessage;

    fn identity() -> StreamIdentity {
        StreamIdentity {
            ssrc: 777,
            transport_port: 5004,
            cipher_key: None,
        }
    }

    fn quick_vad() -> VadConfig {
        VadConfig {
            tick: Duration::ZERO,
            start_hold: Duration::ZERO,
            end_hold: Duration::ZERO,
            ..VadConfig::default()
        }
    }

    async fn expect_media_logon(peer: &mut crate::application::testutil::FakePeer) {
        match peer.next_from_client().await.unwrap() {
            SocketMessage::Text(text) => {
                assert!(text.contains("connect_request"), "{text}");
                assert!(text.contains("channel_type"), "{text}");
            }
            other => panic!("expected media logon, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn video_two_phase_flow() {
        let stream = FakeCaptureStream::video_endless(Resolution::new(640, 480));
        let released = stream.release_probe();
        let capture = FakeCapture::with_stream(stream);
        let (socket, mut peer) = socket_pair();
        let dialer = FakeDialer::new(vec![DialScript::Accept(socket)]);

        let mut session = VideoCaptureSession::new(
            DeviceKind::Camera,
            capture,
            dialer.clone(),
            ClientConfig::default(),
        );

        // Phase one learns the real geometry without dialing anywhere.
        let resolution = session.start_local().await.unwrap();
        assert_eq!(resolution, Resolution::new(640, 480));
        assert_eq!(session.state(), SessionState::LocalActive);
        assert_eq!(dialer.dial_count(), 0);

        // Phase two: encoder configured to learned geometry, link up.
        let encoder = FakeVideoEncoder::default();
        let (configured, forced, _) = encoder.probes();
        session
            .attach_remote(identity(), DeviceId(9), "wss://media", "tok", Box::new(encoder))
            .await
            .unwrap();
        assert_eq!(
            configured.lock().unwrap().as_ref().unwrap().resolution,
            Resolution::new(640, 480)
        );

        expect_media_logon(&mut peer).await;
        peer.ack_logon();

        // Frames start flowing, the first one a forced keyframe.
        match peer.next_from_client().await.unwrap() {
            SocketMessage::Binary(data) => {
                let frame = WireFrame::decode(&data).unwrap();
                assert_eq!(frame.ssrc, 777);
                assert_eq!(frame.media_class, MediaClass::Rtp);
            }
            other => panic!("expected media frame, got {other:?}"),
        }
        assert!(forced.load(Ordering::SeqCst) >= 1);
        assert_eq!(session.state(), SessionState::Connected);

        session.stop().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn local_failure_never_contacts_the_server() {
        let capture = FakeCapture::failing(DeviceError::new(
            DeviceKind::Camera,
            DeviceFault::Denied,
        ));
        let dialer = FakeDialer::new(vec![]);
        let mut session = VideoCaptureSession::new(
            DeviceKind::Camera,
            capture,
            dialer.clone(),
            ClientConfig::default(),
        );

        let err = session.start_local().await.unwrap_err();
        assert_eq!(err.fault, DeviceFault::Denied);
        assert_eq!(dialer.dial_count(), 0);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn attach_failure_releases_the_device() {
        let stream = FakeCaptureStream::video(5, Resolution::new(864, 480));
        let released = stream.release_probe();
        let capture = FakeCapture::with_stream(stream);
        let dialer = FakeDialer::new(vec![]);
        let mut session = VideoCaptureSession::new(
            DeviceKind::Screen,
            capture,
            dialer.clone(),
            ClientConfig::default(),
        );
        session.start_local().await.unwrap();

        let encoder = FakeVideoEncoder {
            fail_configure: true,
            ..FakeVideoEncoder::default()
        };
        let result = session
            .attach_remote(identity(), DeviceId(1), "wss://media", "tok", Box::new(encoder))
            .await;
        assert!(result.is_err());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        // Encoder rejected the config before any dial happened.
        assert_eq!(dialer.dial_count(), 0);
    }

    #[tokio::test]
    async fn rtcp_on_uplink_forces_a_keyframe() {
        let stream = FakeCaptureStream::video_endless(Resolution::new(640, 480));
        let capture = FakeCapture::with_stream(stream);
        let (socket, mut peer) = socket_pair();
        let dialer = FakeDialer::new(vec![DialScript::Accept(socket)]);
        let mut session = VideoCaptureSession::new(
            DeviceKind::Camera,
            capture,
            dialer,
            ClientConfig::default(),
        );
        session.start_local().await.unwrap();

        let encoder = FakeVideoEncoder::default();
        let (_, forced, _) = encoder.probes();
        session
            .attach_remote(identity(), DeviceId(2), "wss://media", "tok", Box::new(encoder))
            .await
            .unwrap();
        expect_media_logon(&mut peer).await;
        peer.ack_logon();

        // Wait for the initial forced keyframe to pass.
        let _ = peer.next_from_client().await;
        let initial = forced.load(Ordering::SeqCst);

        // The receiver asks for a fresh keyframe via RTCP.
        let notice = crate::domain::wire::encode_keyframe_request(777);
        peer.send_binary(WireFrame::encode(777, 5004, MediaClass::Rtcp, &notice));

        // Eventually another forced keyframe is encoded.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if forced.load(Ordering::SeqCst) > initial {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("keyframe flag never honored");

        session.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_device_even_when_flush_fails() {
        let stream = FakeCaptureStream::video(5, Resolution::new(640, 480));
        let released = stream.release_probe();
        let capture = FakeCapture::with_stream(stream);
        let (socket, mut peer) = socket_pair();
        let dialer = FakeDialer::new(vec![DialScript::Accept(socket)]);
        let mut session = VideoCaptureSession::new(
            DeviceKind::Camera,
            capture,
            dialer,
            ClientConfig::default(),
        );
        session.start_local().await.unwrap();

        let encoder = FakeVideoEncoder {
            fail_flush: true,
            ..FakeVideoEncoder::default()
        };
        let (_, _, flushes) = encoder.probes();
        session
            .attach_remote(identity(), DeviceId(3), "wss://media", "tok", Box::new(encoder))
            .await
            .unwrap();
        expect_media_logon(&mut peer).await;

        session.stop().await;
        session.stop().await; // idempotent
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn microphone_learns_format_and_sends_packets() {
        let stream = FakeCaptureStream::audio_endless(44_100, 0.4);
        let capture = FakeCapture::with_stream(stream);
        let (socket, mut peer) = socket_pair();
        let dialer = FakeDialer::new(vec![DialScript::Accept(socket)]);
        let events = Arc::new(FakeEvents::default());

        let mut session = AudioCaptureSession::new(
            capture,
            dialer,
            events.clone(),
            ClientConfig::default(),
            quick_vad(),
        );

        let format = session.start_local().await.unwrap();
        assert_eq!(
            format,
            AudioFormat {
                sample_rate: 44_100,
                channels: 1
            }
        );

        let encoder = FakeAudioEncoder::default();
        let configured = Arc::clone(&encoder.configured);
        session
            .attach_remote(identity(), DeviceId(4), "wss://media", "tok", Box::new(encoder))
            .await
            .unwrap();
        expect_media_logon(&mut peer).await;
        peer.ack_logon();

        match peer.next_from_client().await.unwrap() {
            SocketMessage::Binary(data) => {
                let frame = WireFrame::decode(&data).unwrap();
                let hdr = PacketHeader::decode(&frame.payload).unwrap();
                assert_eq!(hdr.payload_type, PT_AUDIO);
                assert!(!hdr.has_extension);
            }
            other => panic!("expected audio packet, got {other:?}"),
        }
        // Encoder was configured to the learned device format.
        assert_eq!(
            configured.lock().unwrap().as_ref().unwrap().sample_rate,
            44_100
        );

        session.stop().await;
    }

    #[tokio::test]
    async fn vad_reports_speaking_transitions() {
        let stream = FakeCaptureStream::audio_endless(48_000, 0.8);
        let capture = FakeCapture::with_stream(stream);
        let dialer = FakeDialer::new(vec![]);
        let events = Arc::new(FakeEvents::default());

        let mut session = AudioCaptureSession::new(
            capture,
            dialer,
            events.clone(),
            ClientConfig::default(),
            quick_vad(),
        );
        session.start_local().await.unwrap();

        // Give the pump a moment to run the loud frames through the VAD.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if events.entries().contains(&"speaking:true".to_string()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("speaking transition never reported");

        session.stop().await;
    }

    #[tokio::test]
    async fn muted_microphone_encodes_silence() {
        let stream = FakeCaptureStream::audio_endless(48_000, 0.8);
        let capture = FakeCapture::with_stream(stream);
        let (socket, mut peer) = socket_pair();
        let dialer = FakeDialer::new(vec![DialScript::Accept(socket)]);
        let events = Arc::new(FakeEvents::default());

        let mut session = AudioCaptureSession::new(
            capture,
            dialer,
            events,
            ClientConfig::default(),
            quick_vad(),
        );
        session.start_local().await.unwrap();
        session.set_muted(true);

        session
            .attach_remote(identity(), DeviceId(5), "wss://media", "tok", Box::new(FakeAudioEncoder::default()))
            .await
            .unwrap();
        expect_media_logon(&mut peer).await;
        peer.ack_logon();

        match peer.next_from_client().await.unwrap() {
            SocketMessage::Binary(data) => {
                let frame = WireFrame::decode(&data).unwrap();
                let payload = &frame.payload[header_len(&frame.payload)..];
                // The fake encoder marks silent blocks with a zero byte.
                assert_eq!(payload[1], 0);
            }
            other => panic!("expected audio packet, got {other:?}"),
        }
        session.stop().await;
    }
}
