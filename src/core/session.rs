//! Per-remote-participant state.

use crate::core::connection::{DataChannel, PeerConnection, SenderId};
use crate::core::media::MediaTrack;
use crate::core::types::{ConnectionKind, MediaSource, PeerConnectionState, PeerId, Role};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// One peer connection plus its negotiation bookkeeping.
pub struct ConnectionSlot {
    pub conn: Arc<dyn PeerConnection>,
    /// We sent an offer and have not seen the answer yet.
    pub negotiating: bool,
    /// A negotiation trigger arrived while busy; replay it once stable.
    pub pending_renegotiation: bool,
    /// The replayed offer must request an ICE restart.
    pub restart_pending: bool,
    /// ICE restarts since the connection last reached "connected".
    pub ice_restarts: u32,
    pub senders: HashMap<MediaSource, SenderId>,
}

impl ConnectionSlot {
    pub fn new(conn: Arc<dyn PeerConnection>) -> Self {
        Self {
            conn,
            negotiating: false,
            pending_renegotiation: false,
            restart_pending: false,
            ice_restarts: 0,
            senders: HashMap::new(),
        }
    }
}

/// Remote track slots. Each holds at most one track; a newer track replaces
/// the older one instead of accumulating.
#[derive(Debug, Default)]
pub struct RemoteTracks {
    pub audio: Option<Arc<dyn MediaTrack>>,
    pub video: Option<Arc<dyn MediaTrack>>,
    pub screen: Option<Arc<dyn MediaTrack>>,
}

impl RemoteTracks {
    fn slot(&mut self, source: MediaSource) -> &mut Option<Arc<dyn MediaTrack>> {
        match source {
            MediaSource::Microphone => &mut self.audio,
            MediaSource::Camera => &mut self.video,
            MediaSource::Screen => &mut self.screen,
        }
    }

    pub fn get(&self, source: MediaSource) -> Option<&Arc<dyn MediaTrack>> {
        match source {
            MediaSource::Microphone => self.audio.as_ref(),
            MediaSource::Camera => self.video.as_ref(),
            MediaSource::Screen => self.screen.as_ref(),
        }
    }

    /// Install `track`, returning whatever it displaced.
    pub fn set(&mut self, source: MediaSource, track: Arc<dyn MediaTrack>) -> Option<Arc<dyn MediaTrack>> {
        self.slot(source).replace(track)
    }

    /// Empty the slot and stop its track. Returns whether anything was there.
    pub fn clear(&mut self, source: MediaSource) -> bool {
        match self.slot(source).take() {
            Some(track) => {
                track.stop();
                true
            }
            None => false,
        }
    }

    pub fn find(&self, track_id: &str) -> Option<MediaSource> {
        [MediaSource::Microphone, MediaSource::Camera, MediaSource::Screen]
            .into_iter()
            .find(|s| self.get(*s).is_some_and(|t| t.id() == track_id))
    }

    pub fn clear_all(&mut self) {
        for source in [MediaSource::Microphone, MediaSource::Camera, MediaSource::Screen] {
            self.clear(source);
        }
    }
}

pub struct PeerSession {
    pub id: PeerId,
    /// Tags connection callbacks; bumped whenever a session is recreated.
    pub generation: u64,
    pub role: Role,
    pub info: serde_json::Value,
    pub media: ConnectionSlot,
    pub screen: ConnectionSlot,
    pub remote_screen_track_id: Option<String>,
    pub remote: RemoteTracks,
    pub control_channel: Option<Arc<dyn DataChannel>>,
    /// Dedicated transfer channels keyed by label.
    pub file_channels: HashMap<String, Arc<dyn DataChannel>>,
}

impl PeerSession {
    pub fn new(
        id: PeerId,
        generation: u64,
        role: Role,
        info: serde_json::Value,
        media: Arc<dyn PeerConnection>,
        screen: Arc<dyn PeerConnection>,
    ) -> Self {
        Self {
            id,
            generation,
            role,
            info,
            media: ConnectionSlot::new(media),
            screen: ConnectionSlot::new(screen),
            remote_screen_track_id: None,
            remote: RemoteTracks::default(),
            control_channel: None,
            file_channels: HashMap::new(),
        }
    }

    pub fn slot(&self, kind: ConnectionKind) -> &ConnectionSlot {
        match kind {
            ConnectionKind::Media => &self.media,
            ConnectionKind::Screen => &self.screen,
        }
    }

    pub fn slot_mut(&mut self, kind: ConnectionKind) -> &mut ConnectionSlot {
        match kind {
            ConnectionKind::Media => &mut self.media,
            ConnectionKind::Screen => &mut self.screen,
        }
    }

    pub fn is_polite(&self) -> bool {
        self.role == Role::Polite
    }

    pub fn media_state(&self) -> PeerConnectionState {
        self.media.conn.connection_state()
    }

    /// Media connection can still carry traffic.
    pub fn is_alive(&self) -> bool {
        self.media_state().is_live()
    }

    /// Close channels and both connections, and stop remote tracks.
    pub async fn close(&mut self) {
        for (label, channel) in self.file_channels.drain() {
            if let Err(e) = channel.close().await {
                debug!(event = "channel_close_failed", peer = %self.id, label = %label, error = %e);
            }
        }
        if let Some(channel) = self.control_channel.take() {
            if let Err(e) = channel.close().await {
                debug!(event = "channel_close_failed", peer = %self.id, label = "control", error = %e);
            }
        }
        for (kind, slot) in [(ConnectionKind::Media, &self.media), (ConnectionKind::Screen, &self.screen)] {
            if let Err(e) = slot.conn.close().await {
                warn!(event = "connection_close_failed", peer = %self.id, kind = ?kind, error = %e);
            }
        }
        self.remote.clear_all();
        self.remote_screen_track_id = None;
    }
}
