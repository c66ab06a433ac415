//! Media track abstraction and capture provider capability.
//!
//! Tracks are shared as `Arc<dyn MediaTrack>`: the local media state owns
//! local tracks, sessions own remote ones, and connections only see them
//! through senders.

pub mod local;
pub mod synthetic;

use crate::core::types::{CameraConstraints, MediaKind};
use anyhow::Result;
use async_trait::async_trait;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// Callback fired once when capture ends outside the engine's control
/// (device unplugged, OS "stop sharing" button).
pub type EndedCallback = Box<dyn FnOnce() + Send>;

pub trait MediaTrack: Debug + Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    /// Remote side stopped delivering media for this track.
    fn muted(&self) -> bool;
    /// Release the underlying capture. Idempotent.
    fn stop(&self);

    fn on_ended(&self, callback: EndedCallback) {
        drop(callback);
    }

    /// Lets connection adapters recover their concrete track type.
    fn as_any(&self) -> &dyn Any;
}

/// Acquires capture tracks. Permission prompts and device selection live
/// behind this trait.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn camera_track(&self, constraints: &CameraConstraints) -> Result<Arc<dyn MediaTrack>>;
    async fn microphone_track(&self) -> Result<Arc<dyn MediaTrack>>;
    async fn display_track(&self) -> Result<Arc<dyn MediaTrack>>;
}

/// A track counts as "on" only when present, enabled and flowing.
pub fn is_track_on(track: Option<&Arc<dyn MediaTrack>>) -> bool {
    track.is_some_and(|t| t.enabled() && !t.muted())
}
