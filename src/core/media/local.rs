//! Local capture state: at most one live track per source, plus the camera
//! facing selector.

use super::MediaTrack;
use crate::core::types::{CameraConstraints, FacingMode, MediaSource};
use std::sync::Arc;

#[derive(Debug)]
pub struct LocalMediaState {
    camera: Option<Arc<dyn MediaTrack>>,
    microphone: Option<Arc<dyn MediaTrack>>,
    screen: Option<Arc<dyn MediaTrack>>,
    camera_constraints: CameraConstraints,
}

impl LocalMediaState {
    pub fn new(camera_constraints: CameraConstraints) -> Self {
        Self {
            camera: None,
            microphone: None,
            screen: None,
            camera_constraints,
        }
    }

    fn slot(&mut self, source: MediaSource) -> &mut Option<Arc<dyn MediaTrack>> {
        match source {
            MediaSource::Camera => &mut self.camera,
            MediaSource::Microphone => &mut self.microphone,
            MediaSource::Screen => &mut self.screen,
        }
    }

    pub fn track(&self, source: MediaSource) -> Option<&Arc<dyn MediaTrack>> {
        match source {
            MediaSource::Camera => self.camera.as_ref(),
            MediaSource::Microphone => self.microphone.as_ref(),
            MediaSource::Screen => self.screen.as_ref(),
        }
    }

    pub fn is_on(&self, source: MediaSource) -> bool {
        self.track(source).is_some_and(|t| t.enabled())
    }

    /// Install `track`, stopping whatever was there before.
    pub fn install(&mut self, source: MediaSource, track: Arc<dyn MediaTrack>) {
        if let Some(old) = self.slot(source).replace(track) {
            old.stop();
        }
    }

    /// Remove, disable and stop the track for `source`.
    pub fn release(&mut self, source: MediaSource) -> Option<Arc<dyn MediaTrack>> {
        let track = self.slot(source).take()?;
        track.set_enabled(false);
        track.stop();
        Some(track)
    }

    /// Active tracks, in attach order.
    pub fn active(&self) -> Vec<(MediaSource, Arc<dyn MediaTrack>)> {
        [MediaSource::Microphone, MediaSource::Camera, MediaSource::Screen]
            .into_iter()
            .filter_map(|s| self.track(s).map(|t| (s, t.clone())))
            .collect()
    }

    pub fn camera_constraints(&self) -> CameraConstraints {
        self.camera_constraints
    }

    pub fn set_camera_constraints(&mut self, constraints: CameraConstraints) {
        self.camera_constraints = constraints;
    }

    pub fn facing(&self) -> FacingMode {
        self.camera_constraints.facing
    }

    pub fn flip_facing(&mut self) -> FacingMode {
        self.camera_constraints.facing = self.camera_constraints.facing.flipped();
        self.camera_constraints.facing
    }

    pub fn release_all(&mut self) {
        for source in [MediaSource::Camera, MediaSource::Microphone, MediaSource::Screen] {
            self.release(source);
        }
    }
}
