//! Media tracks backed by webrtc-rs.
//!
//! [`RtcLocalTrack`] wraps a `TrackLocalStaticSample` that a capture
//! pipeline writes encoded samples into. [`RtcRemoteTrack`] wraps an
//! incoming `TrackRemote` and drains its RTP so the receiver keeps flowing;
//! when the stream ends the track is marked muted.

use super::convert::media_kind;
use crate::core::connection::{ConnectionEvent, EventSink};
use crate::core::media::{EndedCallback, MediaProvider, MediaTrack};
use crate::core::types::{CameraConstraints, MediaKind};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Sample track for `kind`, identified by `id` in stream `stream_id`.
pub fn sample_track(id: &str, kind: MediaKind, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    let mime_type = match kind {
        MediaKind::Audio => MIME_TYPE_OPUS,
        MediaKind::Video => MIME_TYPE_VP8,
    };
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        stream_id.to_owned(),
    ))
}

// ── Local ────────────────────────────────────────────────────────────────────

pub struct RtcLocalTrack {
    id: String,
    kind: MediaKind,
    sample: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    ended: Mutex<Option<EndedCallback>>,
}

impl RtcLocalTrack {
    pub fn new(kind: MediaKind) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let sample = sample_track(&id, kind, &id);
        Self {
            id,
            kind,
            sample,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            ended: Mutex::new(None),
        }
    }

    /// Where the capture pipeline writes encoded samples.
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.sample.clone()
    }

    /// Capture ended on its own (device lost, OS stop button).
    pub fn end(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(callback) = self.ended.lock().take() {
            callback();
        }
    }
}

impl fmt::Debug for RtcLocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcLocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl MediaTrack for RtcLocalTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn muted(&self) -> bool {
        false
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.ended.lock().take();
    }

    fn on_ended(&self, callback: EndedCallback) {
        if !self.stopped.load(Ordering::Acquire) {
            *self.ended.lock() = Some(callback);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands out sample-backed tracks. Capture and encoding live with the
/// caller, which feeds samples through [`RtcLocalTrack::sample_track`].
#[derive(Default)]
pub struct RtcMediaProvider {
    issued: Mutex<Vec<Arc<RtcLocalTrack>>>,
}

impl RtcMediaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every track handed out so far, oldest first.
    pub fn issued(&self) -> Vec<Arc<RtcLocalTrack>> {
        self.issued.lock().clone()
    }

    fn issue(&self, kind: MediaKind) -> Arc<dyn MediaTrack> {
        let track = Arc::new(RtcLocalTrack::new(kind));
        self.issued.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaProvider for RtcMediaProvider {
    async fn camera_track(&self, constraints: &CameraConstraints) -> Result<Arc<dyn MediaTrack>> {
        debug!(event = "camera_requested", width = constraints.width, height = constraints.height, facing = ?constraints.facing);
        Ok(self.issue(MediaKind::Video))
    }

    async fn microphone_track(&self) -> Result<Arc<dyn MediaTrack>> {
        Ok(self.issue(MediaKind::Audio))
    }

    async fn display_track(&self) -> Result<Arc<dyn MediaTrack>> {
        Ok(self.issue(MediaKind::Video))
    }
}

// ── Remote ───────────────────────────────────────────────────────────────────

pub struct RtcRemoteTrack {
    remote: Arc<TrackRemote>,
    enabled: AtomicBool,
    muted: AtomicBool,
}

impl RtcRemoteTrack {
    /// Wrap `remote` and start draining it. Emits `TrackMuted` into `sink`
    /// once the stream stops.
    pub fn spawn(remote: Arc<TrackRemote>, sink: EventSink) -> Arc<Self> {
        let track = Arc::new(Self {
            remote,
            enabled: AtomicBool::new(true),
            muted: AtomicBool::new(false),
        });

        let reader = track.clone();
        tokio::spawn(async move {
            while reader.remote.read_rtp().await.is_ok() {
                if reader.muted.swap(false, Ordering::AcqRel) {
                    debug!(event = "remote_track_unmuted", track = %reader.remote.id());
                }
            }
            reader.muted.store(true, Ordering::Release);
            sink.emit(ConnectionEvent::TrackMuted {
                track_id: reader.remote.id(),
            });
        });
        track
    }
}

impl fmt::Debug for RtcRemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcRemoteTrack")
            .field("id", &self.remote.id())
            .field("muted", &self.muted.load(Ordering::Relaxed))
            .finish()
    }
}

impl MediaTrack for RtcRemoteTrack {
    fn id(&self) -> String {
        self.remote.id()
    }

    fn kind(&self) -> MediaKind {
        media_kind(self.remote.kind())
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use webrtc::track::track_local::TrackLocal;

    #[test]
    fn local_track_end_fires_once_and_stop_is_silent() {
        let hits = Arc::new(AtomicUsize::new(0));

        let ended = RtcLocalTrack::new(MediaKind::Video);
        let h = hits.clone();
        ended.on_ended(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        ended.end();
        ended.end();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let stopped = RtcLocalTrack::new(MediaKind::Audio);
        let h = hits.clone();
        stopped.on_ended(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        stopped.stop();
        stopped.end();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_tracks_carry_their_id_into_the_sample_track() {
        let provider = RtcMediaProvider::new();
        let mic = provider.microphone_track().await.unwrap();
        assert_eq!(mic.kind(), MediaKind::Audio);

        let issued = provider.issued();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].sample_track().id(), mic.id());
        assert!(mic.as_any().downcast_ref::<RtcLocalTrack>().is_some());
    }
}
