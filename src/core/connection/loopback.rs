//! In-process peer-connection primitive.
//!
//! Connections created through one [`LoopbackNetwork`] find their remote
//! counterpart by `(owner, remote, kind)`. SDP is a small JSON document
//! listing the offering side's senders, so applying a remote description
//! surfaces `Track` and `TrackMuted` events the way a browser would.
//! A connection reports "connected" once both descriptions are applied and
//! it is back in `Stable`. Data channels are linked pairwise at that point.
//!
//! Channel send buffers drain at a fixed byte rate, which makes the
//! backpressure path observable: [`LoopbackNetwork::max_buffered`] records
//! the highest buffered amount seen right after any send.

use super::{
    ChannelMessage, ConnectionEvent, DataChannel, EventSink, PeerConnection,
    PeerConnectionFactory, SenderId,
};
use crate::core::config::EngineConfig;
use crate::core::media::synthetic::SyntheticTrack;
use crate::core::media::MediaTrack;
use crate::core::types::{
    ChannelState, ConnectionKind, IceCandidate, IceConnectionState, MediaKind,
    PeerConnectionState, PeerId, SdpType, SessionDescription, SignalingState,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::debug;

/// Default drain rate of simulated channel buffers (64 MiB/s).
pub const DEFAULT_DRAIN_RATE: u64 = 64 * 1024 * 1024;

type EndpointKey = (PeerId, PeerId, ConnectionKind);

// ── Network ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

struct NetworkInner {
    endpoints: HashMap<EndpointKey, Weak<LoopbackConnection>>,
    drain_rate: u64,
    max_buffered: usize,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::with_drain_rate(DEFAULT_DRAIN_RATE)
    }

    /// Channel buffers drain at `bytes_per_sec`.
    pub fn with_drain_rate(bytes_per_sec: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                endpoints: HashMap::new(),
                drain_rate: bytes_per_sec.max(1),
                max_buffered: 0,
            })),
        }
    }

    pub fn factory(&self, owner: impl Into<PeerId>) -> LoopbackFactory {
        LoopbackFactory {
            network: self.clone(),
            owner: owner.into(),
        }
    }

    /// Highest buffered amount observed on any channel right after a send.
    pub fn max_buffered(&self) -> usize {
        self.inner.lock().max_buffered
    }

    /// Simulate an ICE failure on one side of a connection pair.
    pub fn fail_ice(&self, owner: &str, remote: &str, kind: ConnectionKind) -> bool {
        match self.endpoint(owner, remote, kind) {
            Some(conn) => {
                conn.state.lock().ice_failed = true;
                conn.sink.emit(ConnectionEvent::IceStateChanged(IceConnectionState::Failed));
                true
            }
            None => false,
        }
    }

    /// Track ids currently attached to `owner`'s senders towards `remote`.
    pub fn sender_tracks(&self, owner: &str, remote: &str, kind: ConnectionKind) -> Vec<String> {
        self.endpoint(owner, remote, kind)
            .map(|c| c.state.lock().senders.values().map(|s| s.track.id()).collect())
            .unwrap_or_default()
    }

    pub fn applied_candidates(&self, owner: &str, remote: &str, kind: ConnectionKind) -> usize {
        self.endpoint(owner, remote, kind)
            .map(|c| c.state.lock().applied_candidates.len())
            .unwrap_or(0)
    }

    /// Remote offers seen by `owner` that requested an ICE restart.
    pub fn restart_offers(&self, owner: &str, remote: &str, kind: ConnectionKind) -> usize {
        self.endpoint(owner, remote, kind)
            .map(|c| c.state.lock().restart_offers)
            .unwrap_or(0)
    }

    pub fn connection_state(
        &self,
        owner: &str,
        remote: &str,
        kind: ConnectionKind,
    ) -> Option<PeerConnectionState> {
        self.endpoint(owner, remote, kind)
            .map(|c| c.state.lock().connection)
    }

    fn endpoint(&self, owner: &str, remote: &str, kind: ConnectionKind) -> Option<Arc<LoopbackConnection>> {
        self.inner
            .lock()
            .endpoints
            .get(&(owner.to_string(), remote.to_string(), kind))
            .and_then(Weak::upgrade)
    }

    fn register(&self, conn: &Arc<LoopbackConnection>) {
        self.inner.lock().endpoints.insert(
            (conn.owner.clone(), conn.sink.peer.clone(), conn.sink.kind),
            Arc::downgrade(conn),
        );
    }

    fn unregister(&self, conn: &LoopbackConnection) {
        let key = (conn.owner.clone(), conn.sink.peer.clone(), conn.sink.kind);
        let mut inner = self.inner.lock();
        let is_self = inner
            .endpoints
            .get(&key)
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), conn));
        if is_self {
            inner.endpoints.remove(&key);
        }
    }

    fn drain_rate(&self) -> u64 {
        self.inner.lock().drain_rate
    }

    fn record_buffered(&self, buffered: usize) {
        let mut inner = self.inner.lock();
        inner.max_buffered = inner.max_buffered.max(buffered);
    }
}

pub struct LoopbackFactory {
    network: LoopbackNetwork,
    owner: PeerId,
}

#[async_trait]
impl PeerConnectionFactory for LoopbackFactory {
    async fn create(&self, _config: &EngineConfig, sink: EventSink) -> Result<Arc<dyn PeerConnection>> {
        let conn = Arc::new(LoopbackConnection {
            owner: self.owner.clone(),
            network: self.network.clone(),
            sink,
            state: Mutex::new(ConnState::default()),
        });
        self.network.register(&conn);
        Ok(conn)
    }
}

// ── SDP ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SdpBody {
    origin: PeerId,
    tracks: Vec<SdpTrack>,
    data: bool,
    ice_restart: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SdpTrack {
    id: String,
    kind: MediaKind,
}

// ── Connection ───────────────────────────────────────────────────────────────

struct SenderEntry {
    /// Stream id advertised in SDP. Survives `replace_track`, like a transceiver's mid.
    msid: String,
    kind: MediaKind,
    track: Arc<dyn MediaTrack>,
}

struct ConnState {
    signaling: SignalingState,
    connection: PeerConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: BTreeMap<u64, SenderEntry>,
    next_sender: u64,
    remote_tracks: HashMap<String, Arc<SyntheticTrack>>,
    queued_candidates: Vec<IceCandidate>,
    applied_candidates: Vec<IceCandidate>,
    channels: HashMap<String, Arc<LoopbackChannel>>,
    data_negotiated: bool,
    candidate_sent: bool,
    ice_failed: bool,
    restart_offers: usize,
}

impl Default for ConnState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: PeerConnectionState::New,
            local: None,
            remote: None,
            senders: BTreeMap::new(),
            next_sender: 1,
            remote_tracks: HashMap::new(),
            queued_candidates: Vec::new(),
            applied_candidates: Vec::new(),
            channels: HashMap::new(),
            data_negotiated: false,
            candidate_sent: false,
            ice_failed: false,
            restart_offers: 0,
        }
    }
}

pub struct LoopbackConnection {
    owner: PeerId,
    network: LoopbackNetwork,
    sink: EventSink,
    state: Mutex<ConnState>,
}

impl LoopbackConnection {
    fn describe(&self, state: &ConnState, sdp_type: SdpType, ice_restart: bool) -> Result<SessionDescription> {
        let body = SdpBody {
            origin: self.owner.clone(),
            tracks: state
                .senders
                .values()
                .map(|s| SdpTrack {
                    id: s.msid.clone(),
                    kind: s.kind,
                })
                .collect(),
            data: state.data_negotiated || !state.channels.is_empty(),
            ice_restart,
        };
        Ok(SessionDescription {
            sdp_type,
            sdp: serde_json::to_string(&body)?,
        })
    }

    /// Diff the remote sender list against known remote tracks.
    fn apply_remote_tracks(&self, state: &mut ConnState, desc: &SessionDescription) -> Result<Vec<ConnectionEvent>> {
        let body: SdpBody = serde_json::from_str(&desc.sdp).context("malformed loopback SDP")?;
        if body.data {
            state.data_negotiated = true;
        }
        if body.ice_restart {
            state.restart_offers += 1;
        }

        let mut events = Vec::new();
        let advertised: HashSet<&str> = body.tracks.iter().map(|t| t.id.as_str()).collect();

        let gone: Vec<String> = state
            .remote_tracks
            .keys()
            .filter(|id| !advertised.contains(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            if let Some(track) = state.remote_tracks.remove(&id) {
                track.set_muted(true);
                events.push(ConnectionEvent::TrackMuted { track_id: id });
            }
        }

        for t in &body.tracks {
            if !state.remote_tracks.contains_key(&t.id) {
                let track = Arc::new(SyntheticTrack::with_id(t.id.clone(), t.kind));
                state.remote_tracks.insert(t.id.clone(), track.clone());
                events.push(ConnectionEvent::Track(track));
            }
        }

        state.applied_candidates.append(&mut state.queued_candidates);
        Ok(events)
    }

    /// Back in `Stable` with both descriptions applied.
    fn settle(&self, state: &mut ConnState) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        if state.local.is_none() || state.remote.is_none() {
            return events;
        }
        if state.connection != PeerConnectionState::Connected {
            state.connection = PeerConnectionState::Connected;
            state.ice_failed = false;
            events.push(ConnectionEvent::StateChanged(PeerConnectionState::Connecting));
            events.push(ConnectionEvent::IceStateChanged(IceConnectionState::Checking));
            events.push(ConnectionEvent::IceStateChanged(IceConnectionState::Connected));
            events.push(ConnectionEvent::StateChanged(PeerConnectionState::Connected));
        } else if state.ice_failed {
            state.ice_failed = false;
            events.push(ConnectionEvent::IceStateChanged(IceConnectionState::Connected));
        }
        events
    }

    fn counterpart(&self) -> Option<Arc<LoopbackConnection>> {
        self.network.endpoint(&self.sink.peer, &self.owner, self.sink.kind)
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connection == PeerConnectionState::Connected
    }

    /// Pair up every unlinked channel on both sides once both are connected.
    fn link_channels(&self) {
        let Some(peer) = self.counterpart() else {
            return;
        };
        if !self.is_connected() || !peer.is_connected() {
            return;
        }
        link_pending(self, &peer);
        link_pending(&peer, self);
    }

    fn emit_all(&self, events: Vec<ConnectionEvent>) {
        for event in events {
            self.sink.emit(event);
        }
    }

    fn remote_closed(&self) {
        let mut state = self.state.lock();
        if state.connection == PeerConnectionState::Closed {
            return;
        }
        state.connection = PeerConnectionState::Disconnected;
        drop(state);
        self.sink
            .emit(ConnectionEvent::IceStateChanged(IceConnectionState::Disconnected));
        self.sink
            .emit(ConnectionEvent::StateChanged(PeerConnectionState::Disconnected));
    }
}

/// Link `from`'s pending channels to freshly created counterparts on `to`.
fn link_pending(from: &LoopbackConnection, to: &LoopbackConnection) {
    let pending: Vec<Arc<LoopbackChannel>> = from
        .state
        .lock()
        .channels
        .values()
        .filter(|c| c.is_unlinked_local())
        .cloned()
        .collect();

    for local in pending {
        if !local.claim() {
            continue;
        }
        let remote = Arc::new(LoopbackChannel::new(
            local.label.clone(),
            to.sink.clone(),
            to.network.clone(),
            false,
        ));
        remote.claim();
        to.state
            .lock()
            .channels
            .insert(remote.label.clone(), remote.clone());

        local.open_with(&remote);
        remote.open_with(&local);

        debug!(event = "loopback_channel_linked", label = %local.label, from = %from.owner, to = %to.owner);
        let dyn_remote: Arc<dyn DataChannel> = remote.clone();
        to.sink.emit(ConnectionEvent::DataChannel(dyn_remote));
        to.sink.emit(ConnectionEvent::ChannelOpen {
            label: remote.label.clone(),
        });
        from.sink.emit(ConnectionEvent::ChannelOpen {
            label: local.label.clone(),
        });
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let state = self.state.lock();
        match state.signaling {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {
                self.describe(&state, SdpType::Offer, ice_restart)
            }
            other => bail!("cannot create offer in {:?}", other),
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        match state.signaling {
            SignalingState::HaveRemoteOffer => self.describe(&state, SdpType::Answer, false),
            other => bail!("cannot create answer in {:?}", other),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        if desc.sdp_type == SdpType::Rollback {
            return self.rollback().await;
        }
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                    state.local = Some(desc);
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.local = Some(desc);
                    events.extend(self.settle(&mut state));
                }
                (t, s) => bail!("set_local_description({:?}) invalid in {:?}", t, s),
            }
            if !state.candidate_sent {
                state.candidate_sent = true;
                events.push(ConnectionEvent::IceCandidate(IceCandidate {
                    candidate: format!(
                        "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host generation 0 ufrag {}",
                        self.owner
                    ),
                    sdp_mid: Some("0".into()),
                    sdp_m_line_index: Some(0),
                    username_fragment: None,
                }));
            }
        }
        self.emit_all(events);
        self.link_channels();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    events.extend(self.apply_remote_tracks(&mut state, &desc)?);
                    state.signaling = SignalingState::HaveRemoteOffer;
                    state.remote = Some(desc);
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    events.extend(self.apply_remote_tracks(&mut state, &desc)?);
                    state.signaling = SignalingState::Stable;
                    state.remote = Some(desc);
                    events.extend(self.settle(&mut state));
                }
                (t, s) => bail!("set_remote_description({:?}) invalid in {:?}", t, s),
            }
        }
        self.emit_all(events);
        self.link_channels();
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveLocalOffer {
            bail!("nothing to roll back in {:?}", state.signaling);
        }
        state.signaling = SignalingState::Stable;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !candidate.candidate.is_empty() && !candidate.candidate.starts_with("candidate:") {
            bail!("malformed candidate '{}'", candidate.candidate);
        }
        let mut state = self.state.lock();
        if state.remote.is_none() {
            state.queued_candidates.push(candidate);
        } else {
            state.applied_candidates.push(candidate);
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<SenderId> {
        let id = {
            let mut state = self.state.lock();
            if state.connection == PeerConnectionState::Closed {
                bail!("connection closed");
            }
            let id = state.next_sender;
            state.next_sender += 1;
            state.senders.insert(
                id,
                SenderEntry {
                    msid: track.id(),
                    kind: track.kind(),
                    track,
                },
            );
            id
        };
        self.sink.emit(ConnectionEvent::NegotiationNeeded);
        Ok(SenderId(id))
    }

    async fn replace_track(&self, sender: SenderId, track: Arc<dyn MediaTrack>) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .senders
            .get_mut(&sender.0)
            .ok_or_else(|| anyhow!("unknown sender {:?}", sender))?;
        if entry.kind != track.kind() {
            bail!("cannot replace {:?} track with {:?}", entry.kind, track.kind());
        }
        entry.track = track;
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let removed = self.state.lock().senders.remove(&sender.0);
        if removed.is_none() {
            bail!("unknown sender {:?}", sender);
        }
        self.sink.emit(ConnectionEvent::NegotiationNeeded);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let channel = Arc::new(LoopbackChannel::new(
            label.to_string(),
            self.sink.clone(),
            self.network.clone(),
            true,
        ));
        let needs_negotiation = {
            let mut state = self.state.lock();
            if state.connection == PeerConnectionState::Closed {
                bail!("connection closed");
            }
            if state.channels.contains_key(label) {
                bail!("duplicate channel label '{}'", label);
            }
            state.channels.insert(label.to_string(), channel.clone());
            !state.data_negotiated
        };
        if needs_negotiation {
            self.sink.emit(ConnectionEvent::NegotiationNeeded);
        } else {
            self.link_channels();
        }
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        let channels: Vec<Arc<LoopbackChannel>> = {
            let mut state = self.state.lock();
            if state.connection == PeerConnectionState::Closed {
                return Ok(());
            }
            state.connection = PeerConnectionState::Closed;
            state.signaling = SignalingState::Closed;
            state.channels.drain().map(|(_, c)| c).collect()
        };
        for channel in channels {
            channel.shutdown();
        }
        if let Some(peer) = self.counterpart() {
            peer.remote_closed();
        }
        self.network.unregister(self);
        Ok(())
    }
}

// ── Data channel ─────────────────────────────────────────────────────────────

pub struct LoopbackChannel {
    label: String,
    sink: EventSink,
    network: LoopbackNetwork,
    locally_created: bool,
    inner: Mutex<ChannelInner>,
}

struct ChannelInner {
    state: ChannelState,
    linked: bool,
    buffered: f64,
    last_drain: Instant,
    peer: Weak<LoopbackChannel>,
}

impl LoopbackChannel {
    fn new(label: String, sink: EventSink, network: LoopbackNetwork, locally_created: bool) -> Self {
        Self {
            label,
            sink,
            network,
            locally_created,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Connecting,
                linked: false,
                buffered: 0.0,
                last_drain: Instant::now(),
                peer: Weak::new(),
            }),
        }
    }

    fn is_unlinked_local(&self) -> bool {
        let inner = self.inner.lock();
        self.locally_created && !inner.linked && inner.state == ChannelState::Connecting
    }

    /// Returns false if someone else already linked this channel.
    fn claim(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.linked {
            return false;
        }
        inner.linked = true;
        true
    }

    fn open_with(&self, peer: &Arc<LoopbackChannel>) {
        let mut inner = self.inner.lock();
        inner.peer = Arc::downgrade(peer);
        inner.state = ChannelState::Open;
        inner.last_drain = Instant::now();
    }

    fn drain(&self, inner: &mut ChannelInner) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_drain).as_secs_f64();
        inner.last_drain = now;
        let drained = elapsed * self.network.drain_rate() as f64;
        inner.buffered = (inner.buffered - drained).max(0.0);
    }

    fn deliver(&self, message: ChannelMessage, len: usize) -> Result<()> {
        let peer = {
            let mut inner = self.inner.lock();
            if inner.state != ChannelState::Open {
                bail!("channel '{}' is not open ({:?})", self.label, inner.state);
            }
            self.drain(&mut inner);
            inner.buffered += len as f64;
            self.network.record_buffered(inner.buffered.ceil() as usize);
            inner.peer.upgrade()
        };
        let peer = peer.ok_or_else(|| anyhow!("channel '{}' has no remote end", self.label))?;
        peer.sink.emit(ConnectionEvent::ChannelMessage {
            label: peer.label.clone(),
            message,
        });
        Ok(())
    }

    /// Close this end only, reporting it locally.
    fn mark_closed(&self) -> Option<Weak<LoopbackChannel>> {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Closed {
            return None;
        }
        inner.state = ChannelState::Closed;
        inner.buffered = 0.0;
        Some(inner.peer.clone())
    }

    /// Close both ends.
    fn shutdown(&self) {
        let Some(peer) = self.mark_closed() else {
            return;
        };
        self.sink.emit(ConnectionEvent::ChannelClosed {
            label: self.label.clone(),
        });
        if let Some(peer) = peer.upgrade() {
            if peer.mark_closed().is_some() {
                peer.sink.emit(ConnectionEvent::ChannelClosed {
                    label: peer.label.clone(),
                });
            }
        }
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> ChannelState {
        self.inner.lock().state
    }

    async fn buffered_amount(&self) -> usize {
        let mut inner = self.inner.lock();
        self.drain(&mut inner);
        inner.buffered.ceil() as usize
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let len = text.len();
        self.deliver(ChannelMessage::Text(text), len)
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        let len = data.len();
        self.deliver(ChannelMessage::Binary(data), len)
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}
