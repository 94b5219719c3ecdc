//! TransportLink — one persistent message-oriented connection.
//!
//! Owns the socket for its whole lifetime: application-level logon,
//! keepalive echo, stale-connection watchdog, and exponential-backoff
//! reconnection all live here. Both the control link and every media
//! link are instances of this machine; they differ only in their logon
//! payload and in who consumes the event stream.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{BackoffConfig, WatchdogConfig};
use crate::domain::control::{ConnectRequest, ConnectResponse, ControlMsg};

use super::ports::{Dialer, MessageSocket, SocketMessage};

// ---------------------------------------------------------------------------
// Backoff policy
// ---------------------------------------------------------------------------

/// Exponential backoff with jitter: `min(max, base * 2^attempt) + jitter`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_ms: u64,
    max_ms: u64,
    jitter_ms: u64,
}

impl BackoffPolicy {
    pub fn from_config(cfg: &BackoffConfig) -> Self {
        Self {
            base_ms: cfg.base_ms.max(1),
            max_ms: cfg.max_ms.max(cfg.base_ms),
            jitter_ms: cfg.jitter_ms,
        }
    }

    /// Deterministic part of the delay for a given attempt.
    pub fn bound(&self, attempt: u32) -> Duration {
        let ms = (0..attempt).fold(self.base_ms, |d, _| (d * 2).min(self.max_ms));
        Duration::from_millis(ms.min(self.max_ms))
    }

    /// Full delay including random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.bound(attempt) + Duration::from_millis(jitter)
    }
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Link lifecycle, observable through [`LinkHandle::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// What a link reports to its consumer.
#[derive(Debug)]
pub enum LinkEvent {
    /// Logon acknowledged; the link is usable for payload frames.
    Up(ConnectResponse),
    /// An open link was lost; reconnection is underway unless stopped.
    Down,
    /// A non-keepalive control message.
    Control(ControlMsg),
    /// A binary WSM frame.
    Frame(Bytes),
}

#[derive(Debug)]
enum Command {
    Send(SocketMessage),
    Kick,
    Shutdown,
}

/// Everything needed to run one link.
pub struct LinkOptions {
    pub url: String,
    pub logon: ConnectRequest,
    pub backoff: BackoffConfig,
    pub watchdog: WatchdogConfig,
}

/// Cheap, clonable handle to a running link task.
#[derive(Clone)]
pub struct LinkHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<LinkState>,
}

impl LinkHandle {
    /// Queue a binary frame. Dropped silently while the link is down —
    /// media is only meaningful on a live connection.
    pub fn send_frame(&self, frame: Bytes) {
        let _ = self.cmd_tx.send(Command::Send(SocketMessage::Binary(frame)));
    }

    /// Queue a control message.
    pub fn send_msg(&self, msg: &ControlMsg) {
        match msg.to_json() {
            Ok(json) => {
                let _ = self.cmd_tx.send(Command::Send(SocketMessage::Text(json)));
            }
            Err(e) => warn!("failed to serialize control message: {e}"),
        }
    }

    /// Connectivity hint (window focus, network restored): reconnect
    /// immediately, bypassing any backoff delay; on an open link, run a
    /// staleness check right now.
    pub fn kick(&self) {
        let _ = self.cmd_tx.send(Command::Kick);
    }

    /// Stop the link for good. Idempotent; never blocks.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }
}

// ---------------------------------------------------------------------------
// Link task
// ---------------------------------------------------------------------------

/// Spawn a link task. Events arrive on the returned receiver; dropping
/// it shuts the link down.
pub fn spawn(dialer: Arc<dyn Dialer>, opts: LinkOptions) -> (LinkHandle, mpsc::Receiver<LinkEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
    let (event_tx, event_rx) = mpsc::channel(1024);

    tokio::spawn(run_link(dialer, opts, cmd_rx, state_tx, event_tx));

    (LinkHandle { cmd_tx, state_rx }, event_rx)
}

enum ServeEnd {
    /// Explicit stop; do not reconnect.
    Stopped,
    /// Connection lost or stale; reconnect with backoff.
    Lost { was_open: bool },
}

async fn run_link(
    dialer: Arc<dyn Dialer>,
    opts: LinkOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<LinkState>,
    event_tx: mpsc::Sender<LinkEvent>,
) {
    let backoff = BackoffPolicy::from_config(&opts.backoff);
    let mut attempt: u32 = 0;

    loop {
        let _ = state_tx.send(LinkState::Connecting);

        let end = match dialer.dial(&opts.url).await {
            Ok(socket) => {
                debug!(url = %opts.url, "link connected, sending logon");
                serve(socket, &opts, &mut cmd_rx, &state_tx, &event_tx).await
            }
            Err(e) => {
                debug!(url = %opts.url, "dial failed: {e}");
                ServeEnd::Lost { was_open: false }
            }
        };

        match end {
            ServeEnd::Stopped => break,
            ServeEnd::Lost { was_open } => {
                let _ = state_tx.send(LinkState::Closed);
                if was_open {
                    attempt = 0;
                    if event_tx.send(LinkEvent::Down).await.is_err() {
                        break; // consumer gone
                    }
                }

                let delay = backoff.delay(attempt);
                attempt += 1;
                info!(url = %opts.url, ?delay, attempt, "link reconnect scheduled");

                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        cmd = cmd_rx.recv() => match cmd {
                            Some(Command::Kick) => {
                                info!(url = %opts.url, "connectivity hint, reconnecting now");
                                attempt = 0;
                                break;
                            }
                            Some(Command::Shutdown) | None => {
                                let _ = state_tx.send(LinkState::Closed);
                                return;
                            }
                            // Payload while down is dropped.
                            Some(Command::Send(_)) => {}
                        },
                    }
                }
            }
        }
    }

    let _ = state_tx.send(LinkState::Closed);
}

async fn serve(
    mut socket: Box<dyn MessageSocket>,
    opts: &LinkOptions,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    state_tx: &watch::Sender<LinkState>,
    event_tx: &mpsc::Sender<LinkEvent>,
) -> ServeEnd {
    let logon = ControlMsg::ConnectRequest(opts.logon.clone());
    let logon_json = match logon.to_json() {
        Ok(j) => j,
        Err(e) => {
            warn!("logon serialization failed: {e}");
            return ServeEnd::Stopped;
        }
    };
    if socket.send(SocketMessage::Text(logon_json)).await.is_err() {
        return ServeEnd::Lost { was_open: false };
    }

    let stale_after = opts.watchdog.stale_after();
    let mut watchdog = tokio::time::interval(opts.watchdog.period());
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut last_rx = Instant::now();
    let mut open = false;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(msg)) => {
                    if !open {
                        trace!("dropping outbound message, logon not acknowledged yet");
                        continue;
                    }
                    if socket.send(msg).await.is_err() {
                        socket.close().await;
                        return ServeEnd::Lost { was_open: open };
                    }
                }
                Some(Command::Kick) => {
                    if open && last_rx.elapsed() > stale_after {
                        warn!("stale link detected on connectivity hint, forcing reconnect");
                        socket.close().await;
                        return ServeEnd::Lost { was_open: open };
                    }
                }
                Some(Command::Shutdown) | None => {
                    let _ = state_tx.send(LinkState::Closing);
                    socket.close().await;
                    return ServeEnd::Stopped;
                }
            },

            inbound = socket.recv() => match inbound {
                Some(Ok(msg)) => {
                    last_rx = Instant::now();
                    match msg {
                        SocketMessage::Binary(data) => {
                            if event_tx.send(LinkEvent::Frame(data)).await.is_err() {
                                socket.close().await;
                                return ServeEnd::Stopped;
                            }
                        }
                        SocketMessage::Text(text) => {
                            match handle_text(&text, &mut open, &mut socket, state_tx, event_tx)
                                .await
                            {
                                TextOutcome::Continue => {}
                                TextOutcome::ConsumerGone => {
                                    socket.close().await;
                                    return ServeEnd::Stopped;
                                }
                                TextOutcome::SendFailed => {
                                    socket.close().await;
                                    return ServeEnd::Lost { was_open: open };
                                }
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!("link receive error: {e}");
                    socket.close().await;
                    return ServeEnd::Lost { was_open: open };
                }
                None => {
                    debug!("link closed by peer");
                    return ServeEnd::Lost { was_open: open };
                }
            },

            _ = watchdog.tick() => {
                if last_rx.elapsed() > stale_after {
                    warn!(
                        silent_for = ?last_rx.elapsed(),
                        "link stale, forcing reconnect instead of waiting for close"
                    );
                    socket.close().await;
                    return ServeEnd::Lost { was_open: open };
                }
            }
        }
    }
}

enum TextOutcome {
    Continue,
    ConsumerGone,
    SendFailed,
}

async fn handle_text(
    text: &str,
    open: &mut bool,
    socket: &mut Box<dyn MessageSocket>,
    state_tx: &watch::Sender<LinkState>,
    event_tx: &mpsc::Sender<LinkEvent>,
) -> TextOutcome {
    let msg = match ControlMsg::from_json(text) {
        Ok(m) => m,
        Err(e) => {
            // Unknown or malformed messages never affect the connection.
            warn!("unparseable control message dropped: {e}");
            return TextOutcome::Continue;
        }
    };

    match msg {
        ControlMsg::Ping {} => {
            // Answer immediately; the receive above already bumped the
            // staleness clock.
            let pong = ControlMsg::Ping {}.to_json().unwrap_or_default();
            if socket.send(SocketMessage::Text(pong)).await.is_err() {
                return TextOutcome::SendFailed;
            }
            TextOutcome::Continue
        }
        ControlMsg::ConnectResponse(resp) if !*open => {
            *open = true;
            let _ = state_tx.send(LinkState::Open);
            info!("link logon acknowledged");
            if event_tx.send(LinkEvent::Up(resp)).await.is_err() {
                return TextOutcome::ConsumerGone;
            }
            TextOutcome::Continue
        }
        other => {
            if event_tx.send(LinkEvent::Control(other)).await.is_err() {
                return TextOutcome::ConsumerGone;
            }
            TextOutcome::Continue
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
