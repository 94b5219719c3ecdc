//! Inbound render channels — the receive-side counterpart of capture.
//!
//! Each remote stream gets its own media link whose frames are walked,
//! decrypted, reassembled (video) and decoded, ending at a presentation
//! surface or the playout ring. Decoder trouble is escalated upstream
//! as an RTCP keyframe request rather than a link reset. Backgrounding
//! suspends the link and decoder but keeps the surface, so resuming
//! needs no renegotiation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::adapters::crypto::PacketCipher;
use crate::adapters::media::collector::FrameCollector;
use crate::adapters::media::ring::{audio_ring, RingProducer};
use crate::config::ClientConfig;
use crate::domain::control::{ConnectRequest, ControlMsg};
use crate::domain::identity::{CipherKey, ClientId, DeviceId};
use crate::domain::wire::{
    encode_keyframe_request, header_len, MediaClass, PacketHeader, WireFrame, WireMsgType,
    PACKET_HEADER_LEN, PT_VIDEO,
};

use super::link::{self, LinkEvent, LinkHandle, LinkOptions};
use super::ports::{AudioDecoder, Dialer, MediaFactory, PresentationSurface, VideoDecoder};

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Everything a render channel needs, lifted from a `device_connect`
/// renderer notice.
#[derive(Debug, Clone)]
pub struct RenderParams {
    pub device_id: DeviceId,
    pub client_id: ClientId,
    /// Source `device_type`; anything but a microphone renders video.
    pub is_video: bool,
    pub label: String,
    pub receiver_ssrc: u32,
    pub port: u16,
    pub cipher_key: Option<CipherKey>,
    pub access_token: String,
    pub url: String,
}

#[derive(Debug)]
enum RenderCmd {
    Pause,
    Resume,
    Kick,
    Stop,
}

// ---------------------------------------------------------------------------
// RenderChannel
// ---------------------------------------------------------------------------

/// Handle to a running render task.
pub struct RenderChannel {
    cmd_tx: mpsc::UnboundedSender<RenderCmd>,
    device_id: DeviceId,
    client_id: ClientId,
    receiver_ssrc: u32,
    is_video: bool,
}

impl RenderChannel {
    /// Build the sink from the factory and start the channel task.
    pub fn spawn(
        params: RenderParams,
        dialer: Arc<dyn Dialer>,
        config: &ClientConfig,
        factory: &Arc<dyn MediaFactory>,
    ) -> Self {
        let sink = if params.is_video {
            RenderSink::Video {
                decoder: factory.video_decoder(),
                surface: factory.video_surface(params.device_id, params.client_id, &params.label),
                collector: FrameCollector::new(),
                keyframes: KeyframePolicy::default(),
                seen_drops: 0,
            }
        } else {
            let (producer, consumer) =
                audio_ring(config.media.ring_channels, config.media.ring_capacity);
            factory.bind_audio_output(params.device_id, params.client_id, consumer);
            RenderSink::Audio {
                decoder: factory.audio_decoder(),
                ring: producer,
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = Self {
            cmd_tx,
            device_id: params.device_id,
            client_id: params.client_id,
            receiver_ssrc: params.receiver_ssrc,
            is_video: params.is_video,
        };

        let pipeline = RenderPipeline {
            cipher: params.cipher_key.as_ref().map(PacketCipher::new),
            receiver_ssrc: params.receiver_ssrc,
            port: params.port,
            is_video: params.is_video,
            sink,
        };
        tokio::spawn(run_render(params, dialer, config.clone(), pipeline, cmd_rx));
        handle
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn receiver_ssrc(&self) -> u32 {
        self.receiver_ssrc
    }

    pub fn is_video(&self) -> bool {
        self.is_video
    }

    /// Suspend link and decoder, keep the presentation surface.
    /// Audio channels keep playing in the background.
    pub fn pause_for_background(&self) {
        if self.is_video {
            let _ = self.cmd_tx.send(RenderCmd::Pause);
        }
    }

    pub fn resume_from_foreground(&self) {
        let _ = self.cmd_tx.send(RenderCmd::Resume);
    }

    /// Connectivity hint passthrough.
    pub fn kick(&self) {
        let _ = self.cmd_tx.send(RenderCmd::Kick);
    }

    /// Idempotent; the task tears the link down and exits.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(RenderCmd::Stop);
    }
}

// ---------------------------------------------------------------------------
// Channel task
// ---------------------------------------------------------------------------

async fn run_render(
    params: RenderParams,
    dialer: Arc<dyn Dialer>,
    config: ClientConfig,
    mut pipeline: RenderPipeline,
    mut cmd_rx: mpsc::UnboundedReceiver<RenderCmd>,
) {
    info!(
        device = params.device_id.0,
        client = params.client_id.0,
        video = params.is_video,
        label = %params.label,
        "render channel started"
    );

    let make_link = |dialer: &Arc<dyn Dialer>| {
        link::spawn(
            Arc::clone(dialer),
            LinkOptions {
                url: params.url.clone(),
                logon: ConnectRequest::media(&params.access_token),
                backoff: config.backoff.clone(),
                watchdog: config.watchdog.clone(),
            },
        )
    };

    let mut link_pair = Some(make_link(&dialer));

    'outer: loop {
        // Suspended (or link gone): only commands matter.
        while link_pair.is_none() {
            match cmd_rx.recv().await {
                Some(RenderCmd::Resume) => {
                    debug!("render channel resuming from background");
                    link_pair = Some(make_link(&dialer));
                }
                Some(RenderCmd::Stop) | None => break 'outer,
                Some(_) => {}
            }
        }
        let Some((link, mut events)) = link_pair.take() else {
            continue;
        };

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(RenderCmd::Stop) | None => {
                        link.shutdown();
                        break 'outer;
                    }
                    Some(RenderCmd::Pause) => {
                        debug!("render channel pausing for background");
                        link.shutdown();
                        pipeline.suspend();
                        continue 'outer;
                    }
                    Some(RenderCmd::Resume) => {}
                    Some(RenderCmd::Kick) => link.kick(),
                },
                event = events.recv() => match event {
                    Some(event) => pipeline.on_event(event, &link),
                    None => continue 'outer,
                },
            }
        }
    }

    pipeline.finish();
    info!(device = params.device_id.0, "render channel stopped");
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

enum RenderSink {
    Video {
        decoder: Box<dyn VideoDecoder>,
        surface: Arc<dyn PresentationSurface>,
        collector: FrameCollector,
        keyframes: KeyframePolicy,
        /// Collector drop count already escalated.
        seen_drops: u64,
    },
    Audio {
        decoder: Box<dyn AudioDecoder>,
        ring: RingProducer,
    },
}

struct RenderPipeline {
    cipher: Option<PacketCipher>,
    receiver_ssrc: u32,
    port: u16,
    is_video: bool,
    sink: RenderSink,
}

impl RenderPipeline {
    fn on_event(&mut self, event: LinkEvent, link: &LinkHandle) {
        match event {
            LinkEvent::Up(_) => self.send_prologue(link),
            LinkEvent::Down => {
                // Resync from a fresh keyframe once the link is back.
                if let RenderSink::Video {
                    decoder, collector, ..
                } = &mut self.sink
                {
                    decoder.reset();
                    collector.reset();
                }
            }
            LinkEvent::Frame(data) => self.handle_frame(&data, link),
            LinkEvent::Control(msg) => trace!(?msg, "ignoring control message on render link"),
        }
    }

    /// After logon: an RTP init probe so the server learns our ssrc
    /// mapping, then a keyframe request (video) or a ping (audio).
    fn send_prologue(&self, link: &LinkHandle) {
        let probe = PacketHeader::new(PT_VIDEO, rand::random::<u16>(), 0, self.receiver_ssrc)
            .encode();
        link.send_frame(WireFrame::encode(
            self.receiver_ssrc,
            self.port,
            MediaClass::Rtp,
            &probe,
        ));

        if self.is_video {
            send_keyframe_request(link, self.receiver_ssrc, self.port);
        } else {
            link.send_msg(&ControlMsg::Ping {});
        }
        debug!(ssrc = self.receiver_ssrc, "render link prologue sent");
    }

    fn handle_frame(&mut self, data: &Bytes, link: &LinkHandle) {
        let Some(wire) = WireFrame::decode(data) else {
            warn!("undecodable wire frame dropped");
            return;
        };
        if wire.msg_type != WireMsgType::Media {
            trace!("non-media frame dropped");
            return;
        }
        if wire.media_class == MediaClass::Rtcp {
            trace!("rtcp on render link ignored");
            return;
        }

        let (ssrc, port) = (self.receiver_ssrc, self.port);
        let packet = &wire.payload;
        let hlen = header_len(packet);
        if hlen < PACKET_HEADER_LEN || packet.len() <= hlen {
            trace!(len = packet.len(), "short media packet dropped");
            return;
        }

        // Decrypt if the stream is keyed; a bad tag costs one packet.
        let plaintext: Vec<u8> = match &self.cipher {
            Some(cipher) => {
                match cipher.open(&packet[..PACKET_HEADER_LEN], &packet[hlen..]) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("packet dropped: {e}");
                        return;
                    }
                }
            }
            None => packet[hlen..].to_vec(),
        };

        match &mut self.sink {
            RenderSink::Video {
                decoder,
                surface,
                collector,
                keyframes,
                seen_drops,
            } => {
                // The collector wants the full packet with its header so
                // chunk placement can use the sequence distance.
                let mut full = Vec::with_capacity(hlen + plaintext.len());
                full.extend_from_slice(&packet[..hlen]);
                full.extend_from_slice(&plaintext);

                if let Some(frame) = collector.process(&full) {
                    match decoder.decode(&frame) {
                        Ok(frames) => {
                            keyframes.note_success();
                            for f in &frames {
                                surface.present(f);
                            }
                        }
                        Err(e) => {
                            warn!("video decode failed: {e}");
                            if keyframes.note_error(Instant::now()) {
                                info!("requesting keyframe after decoder errors");
                                send_keyframe_request(link, ssrc, port);
                            }
                        }
                    }
                }

                // Frames the collector had to drop (lost or corrupt
                // chunks) also warrant a fresh keyframe.
                let drops = collector.dropped_frames();
                if drops > *seen_drops {
                    *seen_drops = drops;
                    if keyframes.note_error(Instant::now()) {
                        info!("requesting keyframe after dropped frames");
                        send_keyframe_request(link, ssrc, port);
                    }
                }
            }
            RenderSink::Audio { decoder, ring } => match decoder.decode(&plaintext) {
                Ok(blocks) => {
                    for block in &blocks {
                        let planes: Vec<&[f32]> =
                            block.channels.iter().map(|c| c.as_slice()).collect();
                        if !planes.is_empty() {
                            ring.push(&planes);
                        }
                    }
                }
                Err(e) => warn!("audio decode failed: {e}"),
            },
        }
    }

    /// Background pause: drop codec and reassembly state, keep surface.
    fn suspend(&mut self) {
        if let RenderSink::Video {
            decoder, collector, ..
        } = &mut self.sink
        {
            decoder.reset();
            collector.reset();
        }
    }

    /// Stream end: flush the pending frame through the CRC gate.
    fn finish(&mut self) {
        if let RenderSink::Video {
            decoder,
            surface,
            collector,
            ..
        } = &mut self.sink
        {
            if let Some(frame) = collector.finish() {
                if let Ok(frames) = decoder.decode(&frame) {
                    for f in &frames {
                        surface.present(f);
                    }
                }
            }
        }
    }
}

fn send_keyframe_request(link: &LinkHandle, ssrc: u32, port: u16) {
    let notice = encode_keyframe_request(ssrc);
    link.send_frame(WireFrame::encode(ssrc, port, MediaClass::Rtcp, &notice));
}

// ---------------------------------------------------------------------------
// Keyframe-request policy
// ---------------------------------------------------------------------------

/// More than two consecutive decode errors, or trouble with no request
/// in the last five seconds, asks the sender for a keyframe. Never
/// resets the link.
struct KeyframePolicy {
    consecutive_errors: u32,
    last_request: Option<Instant>,
}

impl Default for KeyframePolicy {
    fn default() -> Self {
        Self {
            consecutive_errors: 0,
            last_request: None,
        }
    }
}

const KEYFRAME_ERROR_RUN: u32 = 2;
const KEYFRAME_REQUEST_COOLDOWN: Duration = Duration::from_secs(5);

impl KeyframePolicy {
    fn note_error(&mut self, now: Instant) -> bool {
        self.consecutive_errors += 1;
        let overdue = self
            .last_request
            .map_or(true, |t| now.duration_since(t) > KEYFRAME_REQUEST_COOLDOWN);
        if self.consecutive_errors > KEYFRAME_ERROR_RUN || overdue {
            self.last_request = Some(now);
            self.consecutive_errors = 0;
            true
        } else {
            false
        }
    }

    fn note_success(&mut self) {
        self.consecutive_errors = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
