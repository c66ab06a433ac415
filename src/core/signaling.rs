//! Relay payloads and the transport seam.
//!
//! The relay forwards opaque strings between participant ids. Payloads are
//! JSON objects with exactly one "primary" key; anything else is rejected
//! before it reaches the negotiation code.

use crate::core::engine::Engine;
use crate::core::types::{IceCandidate, MediaSource, PeerId, SessionDescription};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, payload: String, destination: &PeerId) -> Result<()>;
}

// ── Relay payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    IceCandidate {
        candidate: IceCandidate,
        for_screen_share: bool,
    },
    Offer {
        description: SessionDescription,
        screen_id: Option<String>,
        for_screen_share: bool,
    },
    Answer {
        description: SessionDescription,
        screen_id: Option<String>,
        for_screen_share: bool,
    },
    /// Sharer announces the track id it is about to send.
    ScreenShareTrackId(String),
    /// Viewer is ready for the announced screen track.
    StartSendingScreen,
    ScreenShareOff,
    /// Sender released a camera or microphone track.
    TrackEnded(MediaSource),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("payload is not a JSON object: {0}")]
    Malformed(String),
    #[error("payload carries no known message")]
    Unknown,
    #[error("payload carries more than one message: {0:?}")]
    Ambiguous(Vec<&'static str>),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ice_candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer: Option<SessionDescription>,
    #[serde(rename = "screenid", default, skip_serializing_if = "Option::is_none")]
    screen_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    for_screen_share: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    screen_share_track_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_sending_screen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    screen_share_off: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    track_ended: Option<MediaSource>,
}

impl RawSignal {
    fn primaries(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if self.ice_candidate.is_some() {
            keys.push("iceCandidate");
        }
        if self.offer.is_some() {
            keys.push("offer");
        }
        if self.answer.is_some() {
            keys.push("answer");
        }
        if self.screen_share_track_id.is_some() {
            keys.push("screenShareTrackId");
        }
        if self.start_sending_screen == Some(true) {
            keys.push("startSendingScreen");
        }
        if self.screen_share_off == Some(true) {
            keys.push("screenShareOff");
        }
        if self.track_ended.is_some() {
            keys.push("trackEnded");
        }
        keys
    }
}

impl TryFrom<RawSignal> for SignalMessage {
    type Error = SignalError;

    fn try_from(raw: RawSignal) -> Result<Self, Self::Error> {
        let keys = raw.primaries();
        if keys.len() > 1 {
            return Err(SignalError::Ambiguous(keys));
        }
        let for_screen_share = raw.for_screen_share.unwrap_or(false);

        if let Some(candidate) = raw.ice_candidate {
            return Ok(SignalMessage::IceCandidate {
                candidate,
                for_screen_share,
            });
        }
        if let Some(description) = raw.offer {
            return Ok(SignalMessage::Offer {
                description,
                screen_id: raw.screen_id,
                for_screen_share,
            });
        }
        if let Some(description) = raw.answer {
            return Ok(SignalMessage::Answer {
                description,
                screen_id: raw.screen_id,
                for_screen_share,
            });
        }
        if let Some(id) = raw.screen_share_track_id {
            return Ok(SignalMessage::ScreenShareTrackId(id));
        }
        // Flags only count when set; `false` is the same as absent.
        if raw.start_sending_screen == Some(true) {
            return Ok(SignalMessage::StartSendingScreen);
        }
        if raw.screen_share_off == Some(true) {
            return Ok(SignalMessage::ScreenShareOff);
        }
        if let Some(source) = raw.track_ended {
            return Ok(SignalMessage::TrackEnded(source));
        }
        Err(SignalError::Unknown)
    }
}

impl From<&SignalMessage> for RawSignal {
    fn from(msg: &SignalMessage) -> Self {
        let flag = |b: bool| b.then_some(true);
        match msg.clone() {
            SignalMessage::IceCandidate {
                candidate,
                for_screen_share,
            } => RawSignal {
                ice_candidate: Some(candidate),
                for_screen_share: flag(for_screen_share),
                ..Default::default()
            },
            SignalMessage::Offer {
                description,
                screen_id,
                for_screen_share,
            } => RawSignal {
                offer: Some(description),
                screen_id,
                for_screen_share: flag(for_screen_share),
                ..Default::default()
            },
            SignalMessage::Answer {
                description,
                screen_id,
                for_screen_share,
            } => RawSignal {
                answer: Some(description),
                screen_id,
                for_screen_share: flag(for_screen_share),
                ..Default::default()
            },
            SignalMessage::ScreenShareTrackId(id) => RawSignal {
                screen_share_track_id: Some(id),
                ..Default::default()
            },
            SignalMessage::StartSendingScreen => RawSignal {
                start_sending_screen: Some(true),
                ..Default::default()
            },
            SignalMessage::ScreenShareOff => RawSignal {
                screen_share_off: Some(true),
                ..Default::default()
            },
            SignalMessage::TrackEnded(source) => RawSignal {
                track_ended: Some(source),
                ..Default::default()
            },
        }
    }
}

impl SignalMessage {
    pub fn parse(payload: &str) -> Result<Self, SignalError> {
        let raw: RawSignal =
            serde_json::from_str(payload).map_err(|e| SignalError::Malformed(e.to_string()))?;
        raw.try_into()
    }

    pub fn to_json(&self) -> String {
        // RawSignal holds only strings, numbers and bools; serialization cannot fail.
        serde_json::to_string(&RawSignal::from(self)).unwrap_or_default()
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignalMessage::IceCandidate { .. } => "iceCandidate",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::ScreenShareTrackId(_) => "screenShareTrackId",
            SignalMessage::StartSendingScreen => "startSendingScreen",
            SignalMessage::ScreenShareOff => "screenShareOff",
            SignalMessage::TrackEnded(_) => "trackEnded",
        }
    }
}

// ── Loopback relay ───────────────────────────────────────────────────────────

struct Envelope {
    payload: String,
    source: PeerId,
    destination: PeerId,
}

/// In-process relay. Delivery runs on a pump task so an engine sending a
/// message never waits on the receiving engine.
#[derive(Clone)]
pub struct LoopbackRelay {
    routes: Arc<Mutex<HashMap<PeerId, Engine>>>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl LoopbackRelay {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let routes: Arc<Mutex<HashMap<PeerId, Engine>>> = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let pump_routes = routes.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let target = pump_routes.lock().get(&envelope.destination).cloned();
                match target {
                    Some(engine) => {
                        if engine
                            .on_socket_message(envelope.payload, envelope.source, None)
                            .await
                            .is_err()
                        {
                            debug!(event = "relay_target_stopped", peer = %envelope.destination);
                        }
                    }
                    None => {
                        warn!(event = "relay_no_route", peer = %envelope.destination, "Dropping relay message");
                    }
                }
            }
        });

        Self { routes, tx }
    }

    pub fn register(&self, id: impl Into<PeerId>, engine: Engine) {
        self.routes.lock().insert(id.into(), engine);
    }

    pub fn unregister(&self, id: &str) {
        self.routes.lock().remove(id);
    }

    /// Transport handle that sends as `local`.
    pub fn endpoint(&self, local: impl Into<PeerId>) -> Arc<dyn MessageTransport> {
        Arc::new(RelayEndpoint {
            local: local.into(),
            tx: self.tx.clone(),
        })
    }
}

struct RelayEndpoint {
    local: PeerId,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[async_trait]
impl MessageTransport for RelayEndpoint {
    async fn send(&self, payload: String, destination: &PeerId) -> Result<()> {
        self.tx
            .send(Envelope {
                payload,
                source: self.local.clone(),
                destination: destination.clone(),
            })
            .map_err(|_| anyhow::anyhow!("relay stopped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SdpType;

    #[test]
    fn parses_offer_with_screen_id() {
        let msg = SignalMessage::parse(
            r#"{"offer":{"type":"offer","sdp":"v=0"},"screenid":"abc","forScreenShare":false}"#,
        )
        .unwrap();
        match msg {
            SignalMessage::Offer {
                description,
                screen_id,
                for_screen_share,
            } => {
                assert_eq!(description.sdp_type, SdpType::Offer);
                assert_eq!(screen_id.as_deref(), Some("abc"));
                assert!(!for_screen_share);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn candidate_defaults_to_media_connection() {
        let msg =
            SignalMessage::parse(r#"{"iceCandidate":{"candidate":"candidate:1","sdpMid":"0"}}"#)
                .unwrap();
        assert!(matches!(
            msg,
            SignalMessage::IceCandidate {
                for_screen_share: false,
                ..
            }
        ));
    }

    #[test]
    fn rejects_unknown_and_ambiguous() {
        assert_eq!(SignalMessage::parse(r#"{"hello":1}"#), Err(SignalError::Unknown));
        assert!(matches!(
            SignalMessage::parse(
                r#"{"offer":{"type":"offer","sdp":""},"answer":{"type":"answer","sdp":""}}"#
            ),
            Err(SignalError::Ambiguous(_))
        ));
        assert!(matches!(
            SignalMessage::parse("not json"),
            Err(SignalError::Malformed(_))
        ));
    }

    #[test]
    fn false_flags_are_not_messages() {
        for payload in [r#"{"startSendingScreen":false}"#, r#"{"screenShareOff":false}"#] {
            assert!(matches!(SignalMessage::parse(payload), Err(SignalError::Unknown)), "{payload}");
        }
        assert_eq!(
            SignalMessage::parse(r#"{"screenShareOff":true}"#).unwrap(),
            SignalMessage::ScreenShareOff
        );
        assert_eq!(
            SignalMessage::parse(r#"{"screenShareTrackId":"t1","startSendingScreen":false}"#).unwrap(),
            SignalMessage::ScreenShareTrackId("t1".into())
        );
    }

    #[test]
    fn wire_names_match_browser_peers() {
        let json = SignalMessage::ScreenShareTrackId("t1".into()).to_json();
        assert_eq!(json, r#"{"screenShareTrackId":"t1"}"#);
        let json = SignalMessage::StartSendingScreen.to_json();
        assert_eq!(json, r#"{"startSendingScreen":true}"#);
        let json = SignalMessage::TrackEnded(MediaSource::Camera).to_json();
        assert_eq!(json, r#"{"trackEnded":"camera"}"#);
    }

    #[test]
    fn answer_survives_encoding() {
        let msg = SignalMessage::Answer {
            description: SessionDescription::answer("v=0"),
            screen_id: None,
            for_screen_share: true,
        };
        assert_eq!(SignalMessage::parse(&msg.to_json()).unwrap(), msg);
    }
}
