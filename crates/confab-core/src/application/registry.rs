//! Session registry: who owns which live media session.
//!
//! One exclusive slot per capture kind (a client publishes at most one
//! camera, one screen, one microphone) plus the set of render channels
//! keyed by (device, client). Owned by the conference client task;
//! ownership of a session moves in on start and out on stop.

use std::collections::HashMap;

use crate::domain::identity::{ClientId, DeviceId, DeviceKind};

use super::capture::{AudioCaptureSession, VideoCaptureSession};
use super::render::RenderChannel;

/// A published capture device and its pending-cancel marker.
pub struct CaptureSlot<S> {
    pub session: S,
    /// The user stopped this device before the server assigned its
    /// identity; when the assignment arrives it must be refused.
    pub cancel_on_attach: bool,
}

impl<S> CaptureSlot<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            cancel_on_attach: false,
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    pub camera: Option<CaptureSlot<VideoCaptureSession>>,
    pub screen: Option<CaptureSlot<VideoCaptureSession>>,
    pub microphone: Option<CaptureSlot<AudioCaptureSession>>,
    renders: HashMap<(DeviceId, ClientId), RenderChannel>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot for a video capture kind; `None` for the microphone.
    pub fn video_slot_mut(
        &mut self,
        kind: DeviceKind,
    ) -> Option<&mut Option<CaptureSlot<VideoCaptureSession>>> {
        match kind {
            DeviceKind::Camera => Some(&mut self.camera),
            DeviceKind::Screen => Some(&mut self.screen),
            DeviceKind::Microphone => None,
        }
    }

    pub fn has_render(&self, device: DeviceId, client: ClientId) -> bool {
        self.renders.contains_key(&(device, client))
    }

    pub fn insert_render(&mut self, channel: RenderChannel) {
        self.renders
            .insert((channel.device_id(), channel.client_id()), channel);
    }

    /// Remove by device id, honoring the client id when the notice
    /// carries one.
    pub fn remove_render(
        &mut self,
        device: DeviceId,
        client: Option<ClientId>,
    ) -> Option<RenderChannel> {
        let key = match client {
            Some(client) => Some((device, client)),
            None => self
                .renders
                .keys()
                .find(|(d, _)| *d == device)
                .copied(),
        }?;
        self.renders.remove(&key)
    }

    pub fn renders(&self) -> impl Iterator<Item = &RenderChannel> {
        self.renders.values()
    }

    pub fn drain_renders(&mut self) -> Vec<RenderChannel> {
        self.renders.drain().map(|(_, ch)| ch).collect()
    }
}
