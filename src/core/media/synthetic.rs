//! Generated capture tracks for the loopback network, the demo and tests.

use super::{EndedCallback, MediaProvider, MediaTrack};
use crate::core::types::{CameraConstraints, MediaKind, MediaSource};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub struct SyntheticTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    muted: AtomicBool,
    stopped: AtomicBool,
    ended: Mutex<Option<EndedCallback>>,
}

impl SyntheticTrack {
    pub fn new(kind: MediaKind) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            muted: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            ended: Mutex::new(None),
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Simulate capture ending on the device side.
    pub fn end(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(callback) = self.ended.lock().take() {
            callback();
        }
    }
}

impl Debug for SyntheticTrack {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled())
            .field("muted", &self.muted())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl MediaTrack for SyntheticTrack {
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
        self.muted.load(Ordering::Acquire)
    }

    fn stop(&self) {
        // Engine-initiated stop does not fire the ended hook.
        self.stopped.store(true, Ordering::Release);
        self.ended.lock().take();
    }

    fn on_ended(&self, callback: EndedCallback) {
        *self.ended.lock() = Some(callback);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands out [`SyntheticTrack`]s and remembers them so tests can poke at
/// the exact track the engine is holding.
#[derive(Default)]
pub struct SyntheticMediaProvider {
    failing: Mutex<HashSet<MediaSource>>,
    issued: Mutex<Vec<(MediaSource, Arc<SyntheticTrack>)>>,
    camera_requests: Mutex<Vec<CameraConstraints>>,
}

impl SyntheticMediaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make acquisition of `source` fail until cleared.
    pub fn set_failing(&self, source: MediaSource, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(source);
        } else {
            set.remove(&source);
        }
    }

    /// Most recently issued track for `source`.
    pub fn last(&self, source: MediaSource) -> Option<Arc<SyntheticTrack>> {
        self.issued
            .lock()
            .iter()
            .rev()
            .find(|(s, _)| *s == source)
            .map(|(_, t)| t.clone())
    }

    pub fn issued_count(&self, source: MediaSource) -> usize {
        self.issued.lock().iter().filter(|(s, _)| *s == source).count()
    }

    pub fn camera_requests(&self) -> Vec<CameraConstraints> {
        self.camera_requests.lock().clone()
    }

    fn issue(&self, source: MediaSource) -> Result<Arc<dyn MediaTrack>> {
        if self.failing.lock().contains(&source) {
            return Err(anyhow!("{} unavailable", source));
        }
        let track = Arc::new(SyntheticTrack::new(source.kind()));
        self.issued.lock().push((source, track.clone()));
        Ok(track)
    }
}

#[async_trait]
impl MediaProvider for SyntheticMediaProvider {
    async fn camera_track(&self, constraints: &CameraConstraints) -> Result<Arc<dyn MediaTrack>> {
        self.camera_requests.lock().push(*constraints);
        self.issue(MediaSource::Camera)
    }

    async fn microphone_track(&self) -> Result<Arc<dyn MediaTrack>> {
        self.issue(MediaSource::Microphone)
    }

    async fn display_track(&self) -> Result<Arc<dyn MediaTrack>> {
        self.issue(MediaSource::Screen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn end_fires_callback_once() {
        let track = SyntheticTrack::new(MediaKind::Video);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        track.on_ended(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        track.end();
        track.end();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(track.is_stopped());
    }

    #[test]
    fn stop_does_not_fire_callback() {
        let track = SyntheticTrack::new(MediaKind::Audio);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        track.on_ended(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        track.stop();
        track.end();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_source() {
        let provider = SyntheticMediaProvider::new();
        provider.set_failing(MediaSource::Microphone, true);
        assert!(provider.microphone_track().await.is_err());
        provider.set_failing(MediaSource::Microphone, false);
        let track = provider.microphone_track().await.unwrap();
        assert_eq!(track.kind(), MediaKind::Audio);
        assert_eq!(provider.issued_count(MediaSource::Microphone), 1);
    }
}
