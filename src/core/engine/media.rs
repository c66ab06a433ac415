//! Local media control and fan-out to every live session.
//!
//! Camera and microphone ride the media connection. Screen video rides the
//! screen connection and is attached per peer only after the peer answers
//! the track-id announcement with "start sending".

use super::{EngineLoop, Internal, MediaCommand};
use crate::core::error::EngineError;
use crate::core::events::EngineEvent;
use crate::core::media::MediaTrack;
use crate::core::session::PeerSession;
use crate::core::signaling::SignalMessage;
use crate::core::types::{CameraConstraints, MediaSource, PeerId};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Put `track` on the session's sender for `source`, reusing the sender when
/// one exists so the remote side keeps its track id.
pub(super) async fn attach_track(
    session: &mut PeerSession,
    source: MediaSource,
    track: Arc<dyn MediaTrack>,
) -> Result<()> {
    let slot = session.slot_mut(source.connection());
    match slot.senders.get(&source).copied() {
        Some(sender) => slot
            .conn
            .replace_track(sender, track)
            .await
            .context("replacing track"),
        None => {
            let sender = slot.conn.add_track(track).await.context("adding track")?;
            slot.senders.insert(source, sender);
            Ok(())
        }
    }
}

async fn detach_track(session: &mut PeerSession, source: MediaSource) -> Result<()> {
    let slot = session.slot_mut(source.connection());
    match slot.senders.remove(&source) {
        Some(sender) => slot.conn.remove_track(sender).await.context("removing track"),
        None => Ok(()),
    }
}

impl EngineLoop {
    pub(super) async fn handle_media(&mut self, command: MediaCommand) {
        match command {
            MediaCommand::Start(source, constraints) => self.start_source(source, constraints).await,
            MediaCommand::Stop(source) => self.stop_source(source).await,
            MediaCommand::Toggle(source) => {
                if self.local.is_on(source) {
                    self.stop_source(source).await
                } else {
                    self.start_source(source, None).await
                }
            }
            MediaCommand::SwitchCamera => self.switch_camera().await,
        }
    }

    async fn acquire(&self, source: MediaSource) -> Result<Arc<dyn MediaTrack>> {
        match source {
            MediaSource::Camera => {
                self.provider
                    .camera_track(&self.local.camera_constraints())
                    .await
            }
            MediaSource::Microphone => self.provider.microphone_track().await,
            MediaSource::Screen => self.provider.display_track().await,
        }
    }

    pub(super) async fn start_source(&mut self, source: MediaSource, constraints: Option<CameraConstraints>) {
        if source == MediaSource::Camera {
            self.pending_camera_switch = None;
        }
        if let (MediaSource::Camera, Some(constraints)) = (source, constraints) {
            self.local.set_camera_constraints(constraints);
        }

        let track = match self.acquire(source).await {
            Ok(track) => track,
            Err(e) => {
                warn!(event = "capture_failed", source = %source, error = %e);
                self.events.error(EngineError::Device {
                    kind: source,
                    reason: format!("{e:#}"),
                });
                return;
            }
        };
        let track_id = track.id();

        let internal = self.internal_tx.clone();
        let ended_id = track_id.clone();
        track.on_ended(Box::new(move || {
            let _ = internal.send(Internal::CaptureEnded {
                source,
                track_id: ended_id,
            });
        }));
        self.local.install(source, track.clone());

        if source == MediaSource::Screen {
            let peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
            for peer in peers {
                self.send_signal(&peer, SignalMessage::ScreenShareTrackId(track_id.clone()))
                    .await;
            }
        } else {
            for session in self.sessions.values_mut() {
                if !session.is_alive() {
                    continue;
                }
                if let Err(e) = attach_track(session, source, track.clone()).await {
                    warn!(event = "track_attach_failed", peer = %session.id, source = %source, error = %e);
                }
            }
        }

        info!(event = "local_media_started", source = %source, track = %track_id);
        self.events.emit(EngineEvent::LocalMediaChanged {
            source,
            on: true,
            track: Some(track),
        });
    }

    pub(super) async fn stop_source(&mut self, source: MediaSource) {
        // An explicit stop also cancels a camera switch waiting to restart.
        if source == MediaSource::Camera && self.pending_camera_switch.take().is_some() {
            info!(event = "camera_switch_cancelled");
        }
        let Some(track) = self.local.release(source) else {
            debug!(event = "local_media_idle", source = %source, "Nothing to stop");
            return;
        };

        for session in self.sessions.values_mut() {
            if let Err(e) = detach_track(session, source).await {
                warn!(event = "track_detach_failed", peer = %session.id, source = %source, error = %e);
            }
        }

        let notice = match source {
            MediaSource::Screen => SignalMessage::ScreenShareOff,
            other => SignalMessage::TrackEnded(other),
        };
        let peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for peer in peers {
            self.send_signal(&peer, notice.clone()).await;
        }

        info!(event = "local_media_stopped", source = %source, track = %track.id());
        self.events.emit(EngineEvent::LocalMediaChanged {
            source,
            on: false,
            track: None,
        });
    }

    /// Flip the facing mode. An active camera is stopped now and restarted
    /// with the new facing once the device has had time to release.
    async fn switch_camera(&mut self) {
        let facing = self.local.flip_facing();
        if !self.local.is_on(MediaSource::Camera) {
            info!(event = "camera_facing", facing = ?facing, "Camera idle, facing updated");
            return;
        }
        self.stop_source(MediaSource::Camera).await;

        self.next_camera_switch += 1;
        let token = self.next_camera_switch;
        self.pending_camera_switch = Some(token);

        let delay = self.config.camera_switch_delay();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::CameraSwitchSettled(token));
        });
        info!(event = "camera_switching", facing = ?facing, delay_ms = delay.as_millis() as u64);
    }

    /// Restart the camera for the switch identified by `token`, unless a
    /// later start, stop or switch superseded it.
    pub(super) async fn on_camera_switch_settled(&mut self, token: u64) {
        if self.pending_camera_switch != Some(token) {
            debug!(event = "camera_switch_stale", token);
            return;
        }
        self.start_source(MediaSource::Camera, None).await;
    }

    /// Capture ended outside the engine (device lost, OS stop button).
    pub(super) async fn on_capture_ended(&mut self, source: MediaSource, track_id: String) {
        let current = self.local.track(source).map(|t| t.id());
        if current.as_deref() != Some(track_id.as_str()) {
            debug!(event = "capture_ended_stale", source = %source, track = %track_id);
            return;
        }
        info!(event = "capture_ended", source = %source, track = %track_id);
        self.stop_source(source).await;
    }

    // ── Screen-share handshake ──

    /// The peer is about to share its screen: remember which track id to
    /// expect and tell it to start sending.
    pub(super) async fn on_screen_share_announced(&mut self, peer: &PeerId, track_id: String) {
        let Some(session) = self.sessions.get_mut(peer) else {
            debug!(event = "screen_announce_ignored", peer = %peer, "No session");
            return;
        };
        session.remote_screen_track_id = Some(track_id.clone());
        info!(event = "remote_screen_announced", peer = %peer, track = %track_id);
        self.send_signal(peer, SignalMessage::StartSendingScreen).await;
    }

    pub(super) async fn on_start_sending_screen(&mut self, peer: &PeerId) {
        let Some(track) = self.local.track(MediaSource::Screen).cloned() else {
            debug!(event = "screen_request_ignored", peer = %peer, "Not sharing");
            return;
        };
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        match attach_track(session, MediaSource::Screen, track).await {
            Ok(()) => info!(event = "screen_attached", peer = %peer),
            Err(e) => {
                warn!(event = "screen_attach_failed", peer = %peer, error = %e);
                self.events.error(EngineError::negotiation(peer, format!("{e:#}")));
            }
        }
    }
}
