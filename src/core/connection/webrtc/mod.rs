//! webrtc-rs implementation of the connection seam.
//!
//! One `API` instance is shared by every connection a factory creates.
//! webrtc-rs rejects remote candidates that arrive before the remote
//! description, so those are queued here and flushed once it is applied.

mod channel;
mod convert;
mod track;

pub use channel::RtcDataChannel;
pub use track::{sample_track, RtcLocalTrack, RtcMediaProvider, RtcRemoteTrack};

use crate::core::config::{EngineConfig, SCTP_MAX_MESSAGE_SIZE};
use crate::core::connection::{
    ConnectionEvent, DataChannel, EventSink, PeerConnection, PeerConnectionFactory, SenderId,
};
use crate::core::media::MediaTrack;
use crate::core::types::{
    IceCandidate, PeerConnectionState, SdpType, SessionDescription, SignalingState,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn create_webrtc_api() -> Result<API> {
    let mut me = MediaEngine::default();
    me.register_default_codecs()?;
    let reg = register_default_interceptors(Registry::new(), &mut me)?;

    let mut se = SettingEngine::default();
    se.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(SCTP_MAX_MESSAGE_SIZE));

    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub struct RtcConnectionFactory {
    api: Arc<API>,
}

impl RtcConnectionFactory {
    pub fn new() -> Result<Self> {
        Ok(Self {
            api: Arc::new(create_webrtc_api().context("building WebRTC API")?),
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcConnectionFactory {
    async fn create(&self, config: &EngineConfig, sink: EventSink) -> Result<Arc<dyn PeerConnection>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: convert::ice_servers(&config.ice_servers),
                    ..Default::default()
                })
                .await
                .context("creating peer connection")?,
        );
        attach_handlers(&pc, &sink);
        debug!(event = "webrtc_pc_created", peer = %sink.peer, kind = ?sink.kind);

        Ok(Arc::new(RtcPeerConnection {
            pc,
            sink,
            pending_candidates: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
        }))
    }
}

fn attach_handlers(pc: &Arc<RTCPeerConnection>, sink: &EventSink) {
    let s = sink.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let s = s.clone();
        Box::pin(async move { s.emit(ConnectionEvent::NegotiationNeeded) })
    }));

    let s = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let s = s.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => s.emit(ConnectionEvent::IceCandidate(convert::from_rtc_candidate(init))),
                Err(e) => warn!(event = "ice_candidate_encode_failed", peer = %s.peer, error = %e),
            }
        })
    }));

    let s = sink.clone();
    pc.on_ice_connection_state_change(Box::new(move |state| {
        let s = s.clone();
        Box::pin(async move { s.emit(ConnectionEvent::IceStateChanged(convert::ice_state(state))) })
    }));

    let s = sink.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let s = s.clone();
        Box::pin(async move {
            s.emit(ConnectionEvent::StateChanged(convert::connection_state(state)))
        })
    }));

    let s = sink.clone();
    pc.on_track(Box::new(move |remote: Arc<TrackRemote>, _receiver, _transceiver| {
        let s = s.clone();
        Box::pin(async move {
            let track = RtcRemoteTrack::spawn(remote, s.clone());
            s.emit(ConnectionEvent::Track(track));
        })
    }));

    let s = sink.clone();
    pc.on_data_channel(Box::new(move |dc| {
        let s = s.clone();
        Box::pin(async move {
            let already_open = dc.ready_state() == RTCDataChannelState::Open;
            let label = dc.label().to_string();
            let channel = RtcDataChannel::attach(dc, &s);
            s.emit(ConnectionEvent::DataChannel(channel));
            if already_open {
                s.emit(ConnectionEvent::ChannelOpen { label });
            }
        })
    }));
}

// ── Connection ───────────────────────────────────────────────────────────────

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    sink: EventSink,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    senders: Mutex<HashMap<u64, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
}

/// The webrtc-rs track to send for `track`: its own sample track when it
/// has one, otherwise a fresh sample track carrying the same id.
fn local_track(track: &Arc<dyn MediaTrack>) -> Arc<dyn TrackLocal + Send + Sync> {
    match track.as_any().downcast_ref::<RtcLocalTrack>() {
        Some(rtc) => rtc.sample_track(),
        None => {
            let id = track.id();
            sample_track(&id, track.kind(), &id)
        }
    }
}

impl RtcPeerConnection {
    async fn flush_candidates(&self) {
        let queued = std::mem::take(&mut *self.pending_candidates.lock());
        for candidate in queued {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!(event = "ice_candidate_rejected", peer = %self.sink.peer, error = %e);
            }
        }
    }

    fn sender(&self, id: SenderId) -> Result<Arc<RTCRtpSender>> {
        self.senders
            .lock()
            .get(&id.0)
            .cloned()
            .ok_or_else(|| anyhow!("unknown sender {:?}", id))
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart,
                ..Default::default()
            }))
            .await?;
        Ok(convert::from_rtc_description(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(convert::from_rtc_description(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        if desc.sdp_type == SdpType::Rollback {
            return self.rollback().await;
        }
        self.pc
            .set_local_description(convert::to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(convert::to_rtc_description(desc)?)
            .await?;
        self.flush_candidates().await;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let pending = self
            .pc
            .pending_local_description()
            .await
            .ok_or_else(|| anyhow!("no local offer to roll back"))?;
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = pending.sdp;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = convert::to_rtc_candidate(candidate);
        if self.pc.remote_description().await.is_none() {
            self.pending_candidates.lock().push(init);
            return Ok(());
        }
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        convert::signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> PeerConnectionState {
        convert::connection_state(self.pc.connection_state())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<SenderId> {
        let sender = self.pc.add_track(local_track(&track)).await?;
        let id = self.next_sender.fetch_add(1, Ordering::Relaxed);
        self.senders.lock().insert(id, sender);
        Ok(SenderId(id))
    }

    async fn replace_track(&self, sender: SenderId, track: Arc<dyn MediaTrack>) -> Result<()> {
        let sender = self.sender(sender)?;
        sender.replace_track(Some(local_track(&track))).await?;
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let removed = self
            .senders
            .lock()
            .remove(&sender.0)
            .ok_or_else(|| anyhow!("unknown sender {:?}", sender))?;
        self.pc.remove_track(&removed).await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        // Ordered and fully reliable (SCTP default, no partial reliability).
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(RtcDataChannel::attach(dc, &self.sink))
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
