//! ConferenceClient — the control-plane orchestrator.
//!
//! Owns the control TransportLink and the session registry, and runs as
//! one task on the event loop: every control message, link transition
//! and user command is handled to completion before the next, so no
//! locking is needed across sessions. Each device lifecycle notice
//! creates or tears down a capture session or render channel, each with
//! its own independent media link.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapters::media::vad::VadConfig;
use crate::config::{ClientConfig, CLIENT_VERSION};
use crate::domain::control::{
    ConferenceResponse, ConnectRequest, ConnectResponse, ConnectResult, ConnectType, ControlMsg,
    DeviceConnect, DeviceParams, CONFERENCE_OK,
};
use crate::domain::identity::{ClientId, DeviceId, DeviceKind, StreamIdentity};

use super::capture::{AudioCaptureSession, VideoCaptureSession};
use super::error::{DeviceError, DeviceFault, LoginFailure};
use super::link::{self, LinkEvent, LinkHandle, LinkOptions};
use super::ports::{CaptureBackend, Dialer, MediaFactory, SessionEvents};
use super::registry::{CaptureSlot, SessionRegistry};
use super::render::{RenderChannel, RenderParams};

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// External collaborators injected by the embedding application.
pub struct ConferenceDeps {
    pub dialer: Arc<dyn Dialer>,
    pub capture: Arc<dyn CaptureBackend>,
    pub media: Arc<dyn MediaFactory>,
    pub events: Arc<dyn SessionEvents>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

#[derive(Debug)]
enum ClientCmd {
    JoinConference(String),
    LeaveConference,
    StartCapture(DeviceKind),
    StopCapture(DeviceKind),
    SetMuted(bool),
    PauseBackground,
    ResumeForeground,
    ConnectivityHint,
    Shutdown,
}

/// Handle to a running conference client. All methods are non-blocking;
/// outcomes arrive through the [`SessionEvents`] port.
pub struct ConferenceClient {
    cmd_tx: mpsc::UnboundedSender<ClientCmd>,
}

impl ConferenceClient {
    /// Open the control link and start the dispatch task. The link
    /// logs on with the given credentials and keeps reconnecting (and
    /// re-logging-on) until [`shutdown`] or a fatal login rejection.
    pub fn connect(
        deps: ConferenceDeps,
        config: ClientConfig,
        credentials: Credentials,
    ) -> Self {
        let (control, control_events) = link::spawn(
            Arc::clone(&deps.dialer),
            LinkOptions {
                url: config.server_url.clone(),
                logon: ConnectRequest::control(
                    &credentials.login,
                    &credentials.password,
                    CLIENT_VERSION,
                ),
                backoff: config.backoff.clone(),
                watchdog: config.watchdog.clone(),
            },
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = ClientTask {
            deps,
            config,
            control: control.clone(),
            registry: SessionRegistry::new(),
            access_token: None,
            client_id: None,
            current_conference: None,
        };
        tokio::spawn(task.run(control_events, cmd_rx));

        Self { cmd_tx }
    }

    pub fn join_conference(&self, tag: &str) {
        let _ = self.cmd_tx.send(ClientCmd::JoinConference(tag.to_owned()));
    }

    pub fn leave_conference(&self) {
        let _ = self.cmd_tx.send(ClientCmd::LeaveConference);
    }

    pub fn start_camera(&self) {
        let _ = self.cmd_tx.send(ClientCmd::StartCapture(DeviceKind::Camera));
    }

    pub fn stop_camera(&self) {
        let _ = self.cmd_tx.send(ClientCmd::StopCapture(DeviceKind::Camera));
    }

    pub fn start_screen_share(&self) {
        let _ = self.cmd_tx.send(ClientCmd::StartCapture(DeviceKind::Screen));
    }

    pub fn stop_screen_share(&self) {
        let _ = self.cmd_tx.send(ClientCmd::StopCapture(DeviceKind::Screen));
    }

    pub fn start_microphone(&self) {
        let _ = self
            .cmd_tx
            .send(ClientCmd::StartCapture(DeviceKind::Microphone));
    }

    pub fn stop_microphone(&self) {
        let _ = self
            .cmd_tx
            .send(ClientCmd::StopCapture(DeviceKind::Microphone));
    }

    pub fn set_muted(&self, muted: bool) {
        let _ = self.cmd_tx.send(ClientCmd::SetMuted(muted));
    }

    /// The app went to background: suspend video rendering.
    pub fn pause_background(&self) {
        let _ = self.cmd_tx.send(ClientCmd::PauseBackground);
    }

    /// The app is visible again: resume rendering and refresh links.
    pub fn resume_foreground(&self) {
        let _ = self.cmd_tx.send(ClientCmd::ResumeForeground);
    }

    /// The OS reports connectivity restored: reconnect immediately.
    pub fn connectivity_hint(&self) {
        let _ = self.cmd_tx.send(ClientCmd::ConnectivityHint);
    }

    /// Tear everything down. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(ClientCmd::Shutdown);
    }
}

// ---------------------------------------------------------------------------
// Dispatch task
// ---------------------------------------------------------------------------

struct ClientTask {
    deps: ConferenceDeps,
    config: ClientConfig,
    control: LinkHandle,
    registry: SessionRegistry,
    access_token: Option<String>,
    client_id: Option<ClientId>,
    /// Tag of the conference we are (or were, across a reconnect) in.
    current_conference: Option<String>,
}

impl ClientTask {
    async fn run(
        mut self,
        mut control_events: mpsc::Receiver<LinkEvent>,
        mut cmd_rx: mpsc::UnboundedReceiver<ClientCmd>,
    ) {
        loop {
            tokio::select! {
                event = control_events.recv() => match event {
                    Some(event) => {
                        if !self.handle_link_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(ClientCmd::Shutdown) | None => {
                        self.teardown_all().await;
                        self.control.shutdown();
                        break;
                    }
                    Some(cmd) => self.handle_cmd(cmd).await,
                },
            }
        }
        debug!("conference client task ended");
    }

    // -- control link events --

    /// Returns false when the client must terminate (fatal login).
    async fn handle_link_event(&mut self, event: LinkEvent) -> bool {
        match event {
            LinkEvent::Up(resp) => self.handle_logon(resp).await,
            LinkEvent::Down => {
                warn!("control link lost, tearing down media sessions");
                self.teardown_media(false).await;
                self.deps.events.control_offline().await;
                true
            }
            LinkEvent::Control(msg) => {
                self.handle_control(msg).await;
                true
            }
            LinkEvent::Frame(_) => {
                debug!("unexpected binary frame on control link dropped");
                true
            }
        }
    }

    async fn handle_logon(&mut self, resp: ConnectResponse) -> bool {
        match LoginFailure::from_result(ConnectResult::from(resp.result)) {
            None => {
                self.access_token = resp.access_token.clone();
                self.client_id = resp.id.map(ClientId);
                info!(client_id = ?self.client_id, "control logon accepted");
                self.deps
                    .events
                    .login_succeeded(self.client_id.unwrap_or(ClientId(0)))
                    .await;

                // Back in a conference after a control-link drop.
                if let Some(tag) = self.current_conference.clone() {
                    info!(%tag, "rejoining conference after reconnect");
                    self.control
                        .send_msg(&ControlMsg::ConnectToConferenceRequest { tag });
                }
                true
            }
            Some(failure) => {
                warn!(%failure, "control logon rejected");
                self.deps.events.login_failed(&failure).await;
                self.teardown_all().await;
                self.control.shutdown();
                false
            }
        }
    }

    async fn handle_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::ConnectToConferenceResponse(resp) => {
                self.handle_conference_response(resp).await
            }
            ControlMsg::DisconnectFromConference {} => {
                info!("server asked us to leave the conference");
                self.leave().await;
            }
            ControlMsg::DeviceParams(dp) => self.acknowledge_assignment(dp),
            ControlMsg::DeviceConnect(d) => self.handle_device_connect(d).await,
            ControlMsg::DeviceDisconnect {
                device_id,
                client_id,
            } => {
                self.handle_device_disconnect(DeviceId(device_id), client_id.map(ClientId))
                    .await
            }
            ControlMsg::DeliveryMessages(payload) => {
                self.deps.events.chat_delivery(&payload).await;
            }
            other => debug!(?other, "ignoring control message"),
        }
    }

    async fn handle_conference_response(&mut self, resp: ConferenceResponse) {
        if resp.result == CONFERENCE_OK {
            info!(tag = %resp.tag, name = %resp.name, "joined conference");
            self.current_conference = Some(resp.tag.clone());
            self.deps.events.conference_joined(&resp.tag, &resp.name).await;
        } else {
            warn!(result = resp.result, "conference join refused");
            self.deps.events.conference_join_failed(resp.result).await;
        }
    }

    /// The server answered our `device_params` with assigned id and
    /// ssrc; confirm by announcing the created device.
    fn acknowledge_assignment(&self, dp: DeviceParams) {
        let notice = DeviceConnect {
            connect_type: ConnectType::CreatedDevice as u8,
            device_type: dp.device_type,
            device_id: dp.id,
            client_id: self.client_id.map_or(0, |c| c.0),
            author_ssrc: dp.ssrc,
            name: dp.name,
            metadata: dp.metadata,
            resolution: dp.resolution,
            ..DeviceConnect::default()
        };
        self.control.send_msg(&ControlMsg::DeviceConnect(notice));
    }

    async fn handle_device_connect(&mut self, d: DeviceConnect) {
        match ConnectType::try_from(d.connect_type) {
            Ok(ConnectType::CreatedDevice) => self.attach_own_device(d).await,
            Ok(ConnectType::Renderer) => self.spawn_renderer(d),
            Err(other) => warn!(connect_type = other, "unknown device_connect type"),
        }
    }

    async fn attach_own_device(&mut self, d: DeviceConnect) {
        let Ok(kind) = DeviceKind::try_from(d.device_type) else {
            warn!(device_type = d.device_type, "unknown device type in assignment");
            return;
        };
        let device_id = DeviceId(d.device_id);

        let identity = match StreamIdentity::from_assignment(d.author_ssrc, d.port, &d.secure_key)
        {
            Ok(identity) => identity,
            Err(e) => {
                warn!(device = device_id.0, "unusable stream key: {e}");
                self.refuse_device(device_id);
                self.clear_capture(kind).await;
                return;
            }
        };

        let token = d
            .access_token
            .clone()
            .or_else(|| self.access_token.clone())
            .unwrap_or_default();
        let url = self.config.server_url.clone();

        match kind {
            DeviceKind::Camera | DeviceKind::Screen => {
                let Some(slot_ref) = self.registry.video_slot_mut(kind) else {
                    return;
                };
                let Some(mut slot) = slot_ref.take() else {
                    warn!(
                        kind = kind.label(),
                        "assignment for a capture that is not running, refusing"
                    );
                    self.refuse_device(device_id);
                    return;
                };
                if slot.cancel_on_attach {
                    info!(kind = kind.label(), "capture stopped before attach, refusing");
                    self.refuse_device(device_id);
                    slot.session.stop().await;
                    return;
                }
                let encoder = self.deps.media.video_encoder(kind);
                match slot
                    .session
                    .attach_remote(identity, device_id, &url, &token, encoder)
                    .await
                {
                    Ok(()) => {
                        if let Some(slot_ref) = self.registry.video_slot_mut(kind) {
                            *slot_ref = Some(slot);
                        }
                    }
                    Err(e) => {
                        warn!(kind = kind.label(), "attach failed: {e}");
                        self.deps
                            .events
                            .device_failed(&DeviceError::new(kind, DeviceFault::Unsupported))
                            .await;
                    }
                }
            }
            DeviceKind::Microphone => {
                let Some(mut slot) = self.registry.microphone.take() else {
                    warn!("assignment for a microphone that is not running, refusing");
                    self.refuse_device(device_id);
                    return;
                };
                if slot.cancel_on_attach {
                    info!("microphone stopped before attach, refusing");
                    self.refuse_device(device_id);
                    slot.session.stop().await;
                    return;
                }
                let encoder = self.deps.media.audio_encoder();
                match slot
                    .session
                    .attach_remote(identity, device_id, &url, &token, encoder)
                    .await
                {
                    Ok(()) => self.registry.microphone = Some(slot),
                    Err(e) => {
                        warn!("microphone attach failed: {e}");
                        self.deps
                            .events
                            .device_failed(&DeviceError::new(
                                DeviceKind::Microphone,
                                DeviceFault::Unsupported,
                            ))
                            .await;
                    }
                }
            }
        }
    }

    fn spawn_renderer(&mut self, d: DeviceConnect) {
        // Our own streams come back as renderer notices too.
        if d.my != 0 {
            return;
        }
        let device_id = DeviceId(d.device_id);
        let client_id = ClientId(d.client_id);
        if self.registry.has_render(device_id, client_id) {
            debug!(device = device_id.0, "render channel already exists");
            return;
        }

        let cipher_key = match StreamIdentity::from_assignment(0, 0, &d.secure_key) {
            Ok(identity) => identity.cipher_key,
            Err(e) => {
                warn!(device = device_id.0, "render stream key unusable, skipping: {e}");
                return;
            }
        };

        let params = RenderParams {
            device_id,
            client_id,
            is_video: DeviceKind::try_from(d.device_type)
                .map_or(true, DeviceKind::is_video),
            label: if d.name.is_empty() {
                format!("stream {}", device_id.0)
            } else {
                d.name.clone()
            },
            receiver_ssrc: d.receiver_ssrc,
            port: d.port,
            cipher_key,
            access_token: d
                .access_token
                .clone()
                .or_else(|| self.access_token.clone())
                .unwrap_or_default(),
            url: self.config.server_url.clone(),
        };
        let channel = RenderChannel::spawn(
            params,
            Arc::clone(&self.deps.dialer),
            &self.config,
            &self.deps.media,
        );
        self.registry.insert_render(channel);
    }

    async fn handle_device_disconnect(
        &mut self,
        device_id: DeviceId,
        client_id: Option<ClientId>,
    ) {
        if let Some(channel) = self.registry.remove_render(device_id, client_id) {
            info!(device = device_id.0, "render channel closed by server");
            channel.stop();
            return;
        }

        // One of our own devices was disconnected server-side.
        for kind in [DeviceKind::Camera, DeviceKind::Screen] {
            let matches = self
                .registry
                .video_slot_mut(kind)
                .and_then(|s| s.as_ref())
                .is_some_and(|s| s.session.device_id() == Some(device_id));
            if matches {
                info!(kind = kind.label(), "capture disconnected by server");
                if let Some(Some(mut slot)) = self.registry.video_slot_mut(kind).map(Option::take)
                {
                    slot.session.stop().await;
                }
                return;
            }
        }
        let mic_matches = self
            .registry
            .microphone
            .as_ref()
            .is_some_and(|s| s.session.device_id() == Some(device_id));
        if mic_matches {
            info!("microphone disconnected by server");
            if let Some(mut slot) = self.registry.microphone.take() {
                slot.session.stop().await;
            }
        }
    }

    fn refuse_device(&self, device_id: DeviceId) {
        self.control.send_msg(&ControlMsg::DeviceDisconnect {
            device_id: device_id.0,
            client_id: None,
        });
    }

    async fn clear_capture(&mut self, kind: DeviceKind) {
        match kind {
            DeviceKind::Camera | DeviceKind::Screen => {
                if let Some(Some(mut slot)) = self.registry.video_slot_mut(kind).map(Option::take)
                {
                    slot.session.stop().await;
                }
            }
            DeviceKind::Microphone => {
                if let Some(mut slot) = self.registry.microphone.take() {
                    slot.session.stop().await;
                }
            }
        }
    }

    // -- user commands --

    async fn handle_cmd(&mut self, cmd: ClientCmd) {
        match cmd {
            ClientCmd::JoinConference(tag) => {
                self.control
                    .send_msg(&ControlMsg::ConnectToConferenceRequest { tag });
            }
            ClientCmd::LeaveConference => {
                self.leave().await;
            }
            ClientCmd::StartCapture(kind) => self.start_capture(kind).await,
            ClientCmd::StopCapture(kind) => self.stop_capture(kind).await,
            ClientCmd::SetMuted(muted) => {
                if let Some(slot) = &self.registry.microphone {
                    slot.session.set_muted(muted);
                }
            }
            ClientCmd::PauseBackground => {
                for channel in self.registry.renders() {
                    channel.pause_for_background();
                }
            }
            ClientCmd::ResumeForeground => {
                self.control.kick();
                for channel in self.registry.renders() {
                    channel.resume_from_foreground();
                }
            }
            ClientCmd::ConnectivityHint => {
                self.control.kick();
                for kind in [DeviceKind::Camera, DeviceKind::Screen] {
                    if let Some(Some(slot)) =
                        self.registry.video_slot_mut(kind).map(|s| s.as_ref())
                    {
                        slot.session.kick();
                    }
                }
                if let Some(slot) = &self.registry.microphone {
                    slot.session.kick();
                }
                for channel in self.registry.renders() {
                    channel.kick();
                }
            }
            ClientCmd::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    async fn start_capture(&mut self, kind: DeviceKind) {
        match kind {
            DeviceKind::Camera | DeviceKind::Screen => {
                let occupied = self
                    .registry
                    .video_slot_mut(kind)
                    .is_some_and(|s| s.is_some());
                if occupied {
                    debug!(kind = kind.label(), "capture already running");
                    return;
                }
                let mut session = VideoCaptureSession::new(
                    kind,
                    Arc::clone(&self.deps.capture),
                    Arc::clone(&self.deps.dialer),
                    self.config.clone(),
                );
                match session.start_local().await {
                    Ok(resolution) => {
                        self.announce_device(kind, resolution.pack());
                        if let Some(slot) = self.registry.video_slot_mut(kind) {
                            *slot = Some(CaptureSlot::new(session));
                        }
                    }
                    Err(e) => {
                        warn!(kind = kind.label(), "local capture failed: {e}");
                        self.deps.events.device_failed(&e).await;
                    }
                }
            }
            DeviceKind::Microphone => {
                if self.registry.microphone.is_some() {
                    debug!("microphone already running");
                    return;
                }
                let mut session = AudioCaptureSession::new(
                    Arc::clone(&self.deps.capture),
                    Arc::clone(&self.deps.dialer),
                    Arc::clone(&self.deps.events),
                    self.config.clone(),
                    VadConfig::default(),
                );
                match session.start_local().await {
                    Ok(_format) => {
                        self.announce_device(DeviceKind::Microphone, 0);
                        self.registry.microphone = Some(CaptureSlot::new(session));
                    }
                    Err(e) => {
                        warn!("microphone capture failed: {e}");
                        self.deps.events.device_failed(&e).await;
                    }
                }
            }
        }
    }

    fn announce_device(&self, kind: DeviceKind, resolution: u32) {
        let name = match kind {
            DeviceKind::Camera => "Camera",
            DeviceKind::Screen => "Screen Capture",
            DeviceKind::Microphone => "Microphone",
        };
        self.control.send_msg(&ControlMsg::DeviceParams(DeviceParams {
            device_type: kind as u8,
            name: name.to_owned(),
            resolution,
            ..DeviceParams::default()
        }));
    }

    async fn stop_capture(&mut self, kind: DeviceKind) {
        match kind {
            DeviceKind::Camera | DeviceKind::Screen => {
                let Some(slot_ref) = self.registry.video_slot_mut(kind) else {
                    return;
                };
                let Some(mut slot) = slot_ref.take() else {
                    return;
                };
                match slot.session.device_id() {
                    Some(device_id) => {
                        self.refuse_device(device_id);
                        slot.session.stop().await;
                    }
                    None => {
                        // Identity still in flight: refuse it on arrival.
                        slot.session.stop().await;
                        slot.cancel_on_attach = true;
                        if let Some(slot_ref) = self.registry.video_slot_mut(kind) {
                            *slot_ref = Some(slot);
                        }
                    }
                }
            }
            DeviceKind::Microphone => {
                let Some(mut slot) = self.registry.microphone.take() else {
                    return;
                };
                match slot.session.device_id() {
                    Some(device_id) => {
                        self.refuse_device(device_id);
                        slot.session.stop().await;
                    }
                    None => {
                        slot.session.stop().await;
                        slot.cancel_on_attach = true;
                        self.registry.microphone = Some(slot);
                    }
                }
            }
        }
    }

    // -- teardown --

    async fn leave(&mut self) {
        self.stop_capture(DeviceKind::Camera).await;
        self.stop_capture(DeviceKind::Screen).await;
        self.stop_capture(DeviceKind::Microphone).await;

        for channel in self.registry.drain_renders() {
            self.control.send_msg(&ControlMsg::RendererDisconnect {
                device_id: channel.device_id().0,
                ssrc: channel.receiver_ssrc(),
            });
            channel.stop();
        }

        self.control
            .send_msg(&ControlMsg::DisconnectFromConference {});
        self.current_conference = None;
        self.deps.events.conference_left().await;
        info!("left conference");
    }

    /// Stop all media without touching the conference membership —
    /// used when the control link drops so a later relogon can rejoin.
    async fn teardown_media(&mut self, announce: bool) {
        for kind in [DeviceKind::Camera, DeviceKind::Screen] {
            if let Some(Some(mut slot)) = self.registry.video_slot_mut(kind).map(Option::take) {
                if announce {
                    if let Some(id) = slot.session.device_id() {
                        self.refuse_device(id);
                    }
                }
                slot.session.stop().await;
            }
        }
        if let Some(mut slot) = self.registry.microphone.take() {
            if announce {
                if let Some(id) = slot.session.device_id() {
                    self.refuse_device(id);
                }
            }
            slot.session.stop().await;
        }
        for channel in self.registry.drain_renders() {
            channel.stop();
        }
    }

    async fn teardown_all(&mut self) {
        self.teardown_media(true).await;
        self.current_conference = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::application::ports::SocketMessage;
    use crate::domain::identity::Resolution;
    use crate::application::testutil::{
        socket_pair, DialScript, FakeCapture, FakeCaptureStream, FakeDialer, FakeEvents,
        FakeMediaFactory, FakePeer,
    };

    struct Harness {
        client: ConferenceClient,
        control: FakePeer,
        dialer: Arc<FakeDialer>,
        events: Arc<FakeEvents>,
    }

    async fn wait_for_event(events: &FakeEvents, needle: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if events.entries().iter().any(|e| e.contains(needle)) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("event {needle} never fired"));
    }

    async fn expect_text(peer: &mut FakePeer, needle: &str) -> String {
        let deadline = Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            loop {
                match peer.next_from_client().await {
                    Some(SocketMessage::Text(text)) if text.contains(needle) => return text,
                    Some(other) => {
                        panic!("expected text with {needle}, got {other:?}")
                    }
                    None => panic!("socket closed waiting for {needle}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {needle}"))
    }

    /// Control socket + N extra scripted media sockets.
    fn harness(extra_sockets: Vec<DialScript>, capture: Arc<FakeCapture>) -> Harness {
        let (control_socket, control_peer) = socket_pair();
        let mut scripts = vec![DialScript::Accept(control_socket)];
        scripts.extend(extra_sockets);
        let dialer = FakeDialer::new(scripts);
        let events = Arc::new(FakeEvents::default());
        let factory: Arc<FakeMediaFactory> = Arc::default();

        let deps = ConferenceDeps {
            dialer: dialer.clone(),
            capture,
            media: factory.clone(),
            events: events.clone(),
        };
        let config = ClientConfig {
            server_url: "wss://server".into(),
            ..ClientConfig::default()
        };
        let client = ConferenceClient::connect(
            deps,
            config,
            Credentials {
                login: "alice".into(),
                password: "pw".into(),
            },
        );
        Harness {
            client,
            control: control_peer,
            dialer,
            events,
        }
    }

    fn no_capture() -> Arc<FakeCapture> {
        FakeCapture::failing(DeviceError::new(DeviceKind::Camera, DeviceFault::Unavailable))
    }

    #[tokio::test]
    async fn login_join_and_rejoin_flow() {
        let mut h = harness(vec![], no_capture());

        let logon = expect_text(&mut h.control, "connect_request").await;
        assert!(logon.contains(r#""login":"alice""#));
        h.control
            .send_text(r#"{"connect_response":{"result":1,"access_token":"tok","id":7}}"#);
        wait_for_event(&h.events, "login_ok:7").await;

        h.client.join_conference("daily");
        expect_text(&mut h.control, "connect_to_conference_request").await;
        h.control.send_text(
            r#"{"connect_to_conference_response":{"result":1,"tag":"daily","name":"Daily"}}"#,
        );
        wait_for_event(&h.events, "joined:daily:Daily").await;
        h.client.shutdown();
    }

    #[tokio::test]
    async fn rejected_login_is_fatal() {
        let mut h = harness(vec![], no_capture());
        expect_text(&mut h.control, "connect_request").await;
        h.control.send_text(r#"{"connect_response":{"result":2}}"#);
        wait_for_event(&h.events, "login_failed:invalid login or password").await;
    }

    #[tokio::test]
    async fn camera_assignment_attaches_and_streams() {
        let stream = FakeCaptureStream::video_endless(Resolution::new(864, 480));
        let capture = FakeCapture::with_stream(stream);
        let (media_socket, mut media_peer) = socket_pair();
        let mut h = harness(vec![DialScript::Accept(media_socket)], capture);

        expect_text(&mut h.control, "connect_request").await;
        h.control
            .send_text(r#"{"connect_response":{"result":1,"access_token":"tok","id":7}}"#);
        wait_for_event(&h.events, "login_ok").await;

        h.client.start_camera();
        let params = expect_text(&mut h.control, "device_params").await;
        let packed = Resolution::new(864, 480).pack();
        assert!(params.contains(&format!(r#""resolution":{packed}"#)), "{params}");

        // Server echoes device_params with id/ssrc; client confirms.
        h.control.send_text(
            r#"{"device_params":{"id":21,"ssrc":9001,"device_type":1,"name":"Camera"}}"#,
        );
        let confirm = expect_text(&mut h.control, "device_connect").await;
        assert!(confirm.contains(r#""connect_type":1"#), "{confirm}");
        assert!(confirm.contains(r#""author_ssrc":9001"#), "{confirm}");

        // Final assignment brings up the media link.
        h.control.send_text(
            r#"{"device_connect":{"connect_type":1,"device_type":1,"device_id":21,
                "author_ssrc":9001,"port":5004,"secure_key":""}}"#,
        );
        let media_logon = tokio::time::timeout(
            Duration::from_secs(5),
            media_peer.next_from_client(),
        )
        .await
        .expect("no media dial")
        .unwrap();
        match media_logon {
            SocketMessage::Text(text) => {
                assert!(text.contains(r#""channel_type":1"#), "{text}");
                assert!(text.contains(r#""access_token":"tok""#), "{text}");
            }
            other => panic!("expected media logon, got {other:?}"),
        }
        media_peer.ack_logon();

        // Encoded camera frames start flowing on the media link.
        let frame = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match media_peer.next_from_client().await.unwrap() {
                    SocketMessage::Binary(data) => return data,
                    SocketMessage::Text(_) => {}
                }
            }
        })
        .await
        .expect("no media frames");
        let wire = crate::domain::wire::WireFrame::decode(&frame).unwrap();
        assert_eq!(wire.ssrc, 9001);
        assert_eq!(h.dialer.dial_count(), 2);

        h.client.shutdown();
    }

    #[tokio::test]
    async fn camera_stopped_before_attach_is_refused() {
        let stream = FakeCaptureStream::video(5, Resolution::new(640, 480));
        let released = stream.release_probe();
        let capture = FakeCapture::with_stream(stream);
        let mut h = harness(vec![], capture);

        expect_text(&mut h.control, "connect_request").await;
        h.control
            .send_text(r#"{"connect_response":{"result":1,"access_token":"tok","id":7}}"#);
        wait_for_event(&h.events, "login_ok").await;

        h.client.start_camera();
        expect_text(&mut h.control, "device_params").await;

        // User turns the camera off before the server answers.
        h.client.stop_camera();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if released.load(Ordering::SeqCst) > 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("device never released");

        // Assignment arrives late: must be refused, no media dial.
        h.control.send_text(
            r#"{"device_connect":{"connect_type":1,"device_type":1,"device_id":33,
                "author_ssrc":1,"port":5004,"secure_key":""}}"#,
        );
        let refusal = expect_text(&mut h.control, "device_disconnect").await;
        assert!(refusal.contains(r#""device_id":33"#), "{refusal}");
        assert_eq!(h.dialer.dial_count(), 1);

        h.client.shutdown();
    }

    #[tokio::test]
    async fn renderer_notice_spawns_channel_and_disconnect_stops_it() {
        let (media_socket, mut media_peer) = socket_pair();
        let mut h = harness(vec![DialScript::Accept(media_socket)], no_capture());

        expect_text(&mut h.control, "connect_request").await;
        h.control
            .send_text(r#"{"connect_response":{"result":1,"access_token":"tok","id":7}}"#);
        wait_for_event(&h.events, "login_ok").await;

        h.control.send_text(
            r#"{"device_connect":{"connect_type":2,"device_type":1,"device_id":40,
                "client_id":9,"author_ssrc":1234,"receiver_ssrc":5678,"port":5010,
                "secure_key":"","name":"Bob cam","my":0}}"#,
        );

        // The render channel dials its own media link and logs on.
        let logon = tokio::time::timeout(
            Duration::from_secs(5),
            media_peer.next_from_client(),
        )
        .await
        .expect("render channel never dialed")
        .unwrap();
        assert!(matches!(logon, SocketMessage::Text(t) if t.contains("channel_type")));
        media_peer.ack_logon();
        // Prologue: RTP probe + keyframe request for video.
        assert!(matches!(
            media_peer.next_from_client().await.unwrap(),
            SocketMessage::Binary(_)
        ));

        // Server ends the stream.
        h.control
            .send_text(r#"{"device_disconnect":{"device_id":40,"client_id":9}}"#);

        // Channel link closes: the peer's inbound stream ends.
        tokio::time::timeout(Duration::from_secs(5), async {
            while media_peer.next_from_client().await.is_some() {}
        })
        .await
        .expect("render link never closed");

        h.client.shutdown();
    }

    #[tokio::test]
    async fn control_drop_tears_down_media_and_relogon_rejoins() {
        let stream = FakeCaptureStream::video_endless(Resolution::new(640, 480));
        let released = stream.release_probe();
        let capture = FakeCapture::with_stream(stream);
        let (control2, mut control_peer2) = socket_pair();
        // Script: control #1, then the reconnected control #2.
        let mut h = harness(vec![DialScript::Accept(control2)], capture);

        expect_text(&mut h.control, "connect_request").await;
        h.control
            .send_text(r#"{"connect_response":{"result":1,"access_token":"tok","id":7}}"#);
        wait_for_event(&h.events, "login_ok").await;

        h.client.join_conference("daily");
        expect_text(&mut h.control, "connect_to_conference_request").await;
        h.control.send_text(
            r#"{"connect_to_conference_response":{"result":1,"tag":"daily","name":"Daily"}}"#,
        );
        wait_for_event(&h.events, "joined").await;

        h.client.start_camera();
        expect_text(&mut h.control, "device_params").await;

        // Control link dies: media goes down, client reports offline.
        drop(h.control);
        wait_for_event(&h.events, "offline").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if released.load(Ordering::SeqCst) > 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("camera never released after control loss");

        // The relogon on the fresh control socket rejoins the room.
        expect_text(&mut control_peer2, "connect_request").await;
        control_peer2
            .send_text(r#"{"connect_response":{"result":1,"access_token":"t2","id":7}}"#);
        expect_text(&mut control_peer2, "connect_to_conference_request").await;

        h.client.shutdown();
    }
}
