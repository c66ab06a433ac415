//! Peer-connection primitive seam.
//!
//! The engine drives connections only through these traits. Callbacks from
//! the primitive are funnelled through an [`EventSink`] into the engine's
//! single event queue, tagged with the owning peer, the session generation
//! and the connection kind so stale callbacks can be dropped.

pub mod loopback;
pub mod webrtc;

use crate::core::config::EngineConfig;
use crate::core::media::MediaTrack;
use crate::core::types::{
    ChannelState, ConnectionKind, IceCandidate, IceConnectionState, PeerConnectionState, PeerId,
    SessionDescription, SignalingState,
};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handle to an RTP sender created by [`PeerConnection::add_track`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    /// Applying a remote description also flushes queued ICE candidates.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    /// Discard a pending local offer and return to `Stable`.
    async fn rollback(&self) -> Result<()>;
    /// Queued until a remote description exists.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> PeerConnectionState;

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<SenderId>;
    async fn replace_track(&self, sender: SenderId, track: Arc<dyn MediaTrack>) -> Result<()>;
    async fn remove_track(&self, sender: SenderId) -> Result<()>;

    /// Reliable, ordered channel.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn ready_state(&self) -> ChannelState;
    /// Bytes queued locally and not yet handed to the transport.
    async fn buffered_amount(&self) -> usize;
    async fn send_text(&self, text: String) -> Result<()>;
    async fn send_binary(&self, data: Bytes) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, config: &EngineConfig, sink: EventSink)
        -> Result<Arc<dyn PeerConnection>>;
}

// ── Connection events ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

pub enum ConnectionEvent {
    NegotiationNeeded,
    IceCandidate(IceCandidate),
    IceStateChanged(IceConnectionState),
    StateChanged(PeerConnectionState),
    Track(Arc<dyn MediaTrack>),
    /// Remote track stopped or resumed delivering media. The track's own
    /// `muted()` already reflects the new value.
    TrackMuted { track_id: String },
    /// Channel opened by the remote side.
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen { label: String },
    ChannelMessage { label: String, message: ChannelMessage },
    ChannelClosed { label: String },
    ChannelError { label: String, reason: String },
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            ConnectionEvent::IceCandidate(_) => write!(f, "IceCandidate"),
            ConnectionEvent::IceStateChanged(s) => write!(f, "IceStateChanged({s:?})"),
            ConnectionEvent::StateChanged(s) => write!(f, "StateChanged({s:?})"),
            ConnectionEvent::Track(t) => write!(f, "Track({})", t.id()),
            ConnectionEvent::TrackMuted { track_id } => write!(f, "TrackMuted({track_id})"),
            ConnectionEvent::DataChannel(c) => write!(f, "DataChannel({})", c.label()),
            ConnectionEvent::ChannelOpen { label } => write!(f, "ChannelOpen({label})"),
            ConnectionEvent::ChannelMessage { label, .. } => write!(f, "ChannelMessage({label})"),
            ConnectionEvent::ChannelClosed { label } => write!(f, "ChannelClosed({label})"),
            ConnectionEvent::ChannelError { label, reason } => {
                write!(f, "ChannelError({label}: {reason})")
            }
        }
    }
}

/// A connection callback tagged with its origin.
#[derive(Debug)]
pub struct SessionEvent {
    pub peer: PeerId,
    pub generation: u64,
    pub kind: ConnectionKind,
    pub event: ConnectionEvent,
}

/// Where a connection delivers its callbacks.
#[derive(Debug, Clone)]
pub struct EventSink {
    pub peer: PeerId,
    pub generation: u64,
    pub kind: ConnectionKind,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(
        peer: PeerId,
        generation: u64,
        kind: ConnectionKind,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            peer,
            generation,
            kind,
            tx,
        }
    }

    /// Deliver an event. Silently dropped once the engine is gone.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.tx.send(SessionEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            kind: self.kind,
            event,
        });
    }
}
