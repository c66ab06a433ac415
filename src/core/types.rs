//! Shared value types: identifiers, connection/signaling states and the
//! wire shapes of session descriptions and ICE candidates.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Opaque participant identifier assigned by the relay.
pub type PeerId = String;

// ── Connections ──────────────────────────────────────────────────────────────

/// Which of the two per-peer connections an event or message concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Camera, microphone and data channels.
    Media,
    /// Screen-share video only.
    Screen,
}

impl ConnectionKind {
    pub fn is_screen(self) -> bool {
        self == ConnectionKind::Screen
    }

    pub fn from_screen_flag(for_screen_share: bool) -> Self {
        if for_screen_share {
            ConnectionKind::Screen
        } else {
            ConnectionKind::Media
        }
    }
}

/// Perfect-negotiation role. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Yields on offer collision (rolls back its own offer).
    Polite,
    /// Ignores colliding offers.
    Impolite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// New, connecting or connected: the connection can still carry media.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            PeerConnectionState::New
                | PeerConnectionState::Connecting
                | PeerConnectionState::Connected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

// ── Media ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Logical media slot. Used both for local capture and for the remote
/// track slots of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Camera,
    Microphone,
    Screen,
}

impl MediaSource {
    pub fn kind(self) -> MediaKind {
        match self {
            MediaSource::Microphone => MediaKind::Audio,
            MediaSource::Camera | MediaSource::Screen => MediaKind::Video,
        }
    }

    /// Connection that carries this source's sender.
    pub fn connection(self) -> ConnectionKind {
        match self {
            MediaSource::Screen => ConnectionKind::Screen,
            MediaSource::Camera | MediaSource::Microphone => ConnectionKind::Media,
        }
    }
}

impl Display for MediaSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaSource::Camera => write!(f, "camera"),
            MediaSource::Microphone => write!(f, "microphone"),
            MediaSource::Screen => write!(f, "screen"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

impl FacingMode {
    pub fn flipped(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

/// Capture request passed to the media provider for camera tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConstraints {
    pub width: u32,
    pub height: u32,
    pub facing: FacingMode,
}

// ── Wire shapes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// `{ "type": "offer" | "answer", "sdp": "..." }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser-compatible ICE candidate init dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_uses_browser_field_names() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }

    #[test]
    fn description_type_field() {
        let json = serde_json::to_string(&SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
    }

    #[test]
    fn live_states() {
        assert!(PeerConnectionState::New.is_live());
        assert!(PeerConnectionState::Connected.is_live());
        assert!(!PeerConnectionState::Failed.is_live());
        assert!(!PeerConnectionState::Closed.is_live());
    }

    #[test]
    fn screen_source_rides_screen_connection() {
        assert_eq!(MediaSource::Screen.connection(), ConnectionKind::Screen);
        assert_eq!(MediaSource::Camera.connection(), ConnectionKind::Media);
        assert_eq!(MediaSource::Microphone.kind(), MediaKind::Audio);
    }
}
