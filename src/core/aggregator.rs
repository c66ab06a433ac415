//! Peer state aggregation: the externally visible view of each session.

use crate::core::media::{is_track_on, MediaTrack};
use crate::core::session::PeerSession;
use crate::core::types::{MediaSource, PeerConnectionState, PeerId, Role};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub info: serde_json::Value,
    pub role: Role,
    pub connection: PeerConnectionState,
    pub is_audio_on: bool,
    pub is_video_on: bool,
    pub is_screen_share_on: bool,
    pub audio: Option<Arc<dyn MediaTrack>>,
    pub video: Option<Arc<dyn MediaTrack>>,
    pub screen: Option<Arc<dyn MediaTrack>>,
}

pub fn snapshot(session: &PeerSession) -> PeerSnapshot {
    let remote = &session.remote;
    PeerSnapshot {
        peer_id: session.id.clone(),
        info: session.info.clone(),
        role: session.role,
        connection: session.media_state(),
        is_audio_on: is_track_on(remote.get(MediaSource::Microphone)),
        is_video_on: is_track_on(remote.get(MediaSource::Camera)),
        is_screen_share_on: is_track_on(remote.get(MediaSource::Screen)),
        audio: remote.audio.clone(),
        video: remote.video.clone(),
        screen: remote.screen.clone(),
    }
}

/// Snapshot of every session, ordered by peer id.
pub fn snapshot_all(sessions: &HashMap<PeerId, PeerSession>) -> Vec<PeerSnapshot> {
    let mut peers: Vec<PeerSnapshot> = sessions.values().map(snapshot).collect();
    peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    peers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::core::connection::loopback::LoopbackNetwork;
    use crate::core::connection::{EventSink, PeerConnectionFactory};
    use crate::core::media::synthetic::SyntheticTrack;
    use crate::core::types::{ConnectionKind, MediaKind};
    use tokio::sync::mpsc;

    async fn session(id: &str) -> PeerSession {
        let network = LoopbackNetwork::new();
        let factory = network.factory("local");
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = EngineConfig::default();
        let media = factory
            .create(&config, EventSink::new(id.into(), 1, ConnectionKind::Media, tx.clone()))
            .await
            .unwrap();
        let screen = factory
            .create(&config, EventSink::new(id.into(), 1, ConnectionKind::Screen, tx))
            .await
            .unwrap();
        PeerSession::new(id.into(), 1, Role::Polite, serde_json::json!({"name": id}), media, screen)
    }

    #[tokio::test]
    async fn flags_follow_enabled_and_muted() {
        let mut s = session("bob").await;
        let video = Arc::new(SyntheticTrack::new(MediaKind::Video));
        let screen = Arc::new(SyntheticTrack::new(MediaKind::Video));
        s.remote.set(MediaSource::Camera, video.clone());
        s.remote.set(MediaSource::Screen, screen.clone());

        let snap = snapshot(&s);
        assert!(snap.is_video_on);
        assert!(snap.is_screen_share_on);
        assert!(!snap.is_audio_on);
        assert_eq!(snap.info["name"], "bob");

        screen.set_muted(true);
        video.set_enabled(false);
        let snap = snapshot(&s);
        assert!(!snap.is_video_on);
        assert!(!snap.is_screen_share_on);
        assert!(snap.screen.is_some());
    }

    #[tokio::test]
    async fn sorted_by_peer_id() {
        let mut sessions = HashMap::new();
        for id in ["carol", "alice", "bob"] {
            sessions.insert(id.to_string(), session(id).await);
        }
        let ids: Vec<String> = snapshot_all(&sessions).into_iter().map(|p| p.peer_id).collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }
}
