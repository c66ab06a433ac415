//! Session lifecycle, relay dispatch and connection callbacks.

use super::EngineLoop;
use crate::core::config::CONTROL_CHANNEL_LABEL;
use crate::core::connection::{ConnectionEvent, EventSink, SessionEvent};
use crate::core::error::EngineError;
use crate::core::negotiation::{
    apply_candidate, classify_track, Negotiator, OfferDisposition, RestartOutcome,
};
use crate::core::session::PeerSession;
use crate::core::signaling::{MessageTransport, SignalMessage};
use crate::core::types::{
    ConnectionKind, IceConnectionState, MediaSource, PeerConnectionState, PeerId, Role,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl EngineLoop {
    /// Transport handle and advertised screen id for a [`Negotiator`]; owned
    /// so the negotiator does not borrow `self` while a session is mutated.
    fn negotiator(&self) -> (Arc<dyn MessageTransport>, Option<String>) {
        (self.transport.clone(), self.screen_track_id())
    }

    pub(super) async fn send_signal(&self, peer: &PeerId, msg: SignalMessage) {
        if let Err(e) = self.transport.send(msg.to_json(), peer).await {
            warn!(event = "relay_send_failed", peer = %peer, kind = msg.name(), error = %e);
        }
    }

    // ── Lifecycle ──

    pub(super) async fn join_peer(&mut self, id: PeerId, is_new_participant: bool, info: serde_json::Value) {
        if id == self.local_id {
            warn!(event = "join_self_ignored", peer = %id);
            return;
        }
        if let Some(existing) = self.sessions.get(&id) {
            if existing.is_alive() {
                debug!(event = "join_ignored", peer = %id, "Session already live");
                return;
            }
            self.teardown_session(&id, "replaced by rejoin").await;
        }

        let role = if is_new_participant {
            Role::Polite
        } else {
            Role::Impolite
        };
        match self.create_session(id.clone(), role, info).await {
            Ok(()) => self.emit_peers(),
            Err(e) => {
                error!(event = "session_create_failed", peer = %id, error = %e);
                self.events.error(EngineError::negotiation(&id, format!("{e:#}")));
            }
        }
    }

    pub(super) async fn create_session(&mut self, id: PeerId, role: Role, info: serde_json::Value) -> Result<()> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = |kind| EventSink::new(id.clone(), generation, kind, self.session_tx.clone());

        let media = self
            .factory
            .create(&self.config, sink(ConnectionKind::Media))
            .await
            .context("creating media connection")?;
        let screen = match self.factory.create(&self.config, sink(ConnectionKind::Screen)).await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = media.close().await;
                return Err(e.context("creating screen connection"));
            }
        };

        let mut session = PeerSession::new(id.clone(), generation, role, info, media, screen);
        if role == Role::Polite {
            match session.media.conn.create_data_channel(CONTROL_CHANNEL_LABEL).await {
                Ok(channel) => session.control_channel = Some(channel),
                Err(e) => {
                    session.close().await;
                    return Err(e.context("creating control channel"));
                }
            }
        }

        for (source, track) in self.local.active() {
            if source == MediaSource::Screen {
                continue;
            }
            if let Err(e) = super::media::attach_track(&mut session, source, track).await {
                warn!(event = "track_attach_failed", peer = %id, source = %source, error = %e);
            }
        }

        info!(event = "session_created", peer = %id, role = ?role, generation);
        self.sessions.insert(id.clone(), session);

        if let Some(track_id) = self.screen_track_id() {
            self.send_signal(&id, SignalMessage::ScreenShareTrackId(track_id)).await;
        }
        Ok(())
    }

    pub(super) async fn leave_peer(&mut self, id: &str) {
        if !self.sessions.contains_key(id) {
            debug!(event = "leave_ignored", peer = %id, "No session");
            return;
        }
        self.teardown_session(id, "peer left").await;
    }

    pub(super) async fn teardown_session(&mut self, id: &str, reason: &str) {
        let Some(mut session) = self.sessions.remove(id) else {
            return;
        };
        self.abort_transfers_for(id, reason);
        session.close().await;
        info!(event = "session_closed", peer = %id, reason);
        self.emit_peers();
    }

    async fn ensure_session(&mut self, id: &PeerId, extra: Option<serde_json::Value>) -> bool {
        if self.sessions.contains_key(id) {
            return true;
        }
        if *id == self.local_id {
            return false;
        }
        match self
            .create_session(id.clone(), Role::Impolite, extra.unwrap_or_default())
            .await
        {
            Ok(()) => {
                self.emit_peers();
                true
            }
            Err(e) => {
                error!(event = "session_create_failed", peer = %id, error = %e);
                self.events.error(EngineError::negotiation(id, format!("{e:#}")));
                false
            }
        }
    }

    // ── Relay messages ──

    pub(super) async fn on_socket_message(
        &mut self,
        payload: String,
        source: PeerId,
        extra: Option<serde_json::Value>,
    ) {
        let msg = match SignalMessage::parse(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(event = "signal_rejected", peer = %source, error = %e);
                return;
            }
        };
        debug!(event = "signal_received", peer = %source, kind = msg.name());

        match msg {
            SignalMessage::Offer {
                description,
                screen_id,
                for_screen_share,
            } => {
                if !self.ensure_session(&source, extra).await {
                    return;
                }
                let kind = ConnectionKind::from_screen_flag(for_screen_share);
                let (transport, screen_track_id) = self.negotiator();
                let negotiator = Negotiator {
                    transport: transport.as_ref(),
                    screen_track_id,
                };
                let Some(session) = self.sessions.get_mut(&source) else {
                    return;
                };
                match negotiator.handle_offer(session, kind, description, screen_id).await {
                    Ok(OfferDisposition::Answered) | Ok(OfferDisposition::Ignored) => {}
                    Err(e) => {
                        warn!(event = "offer_failed", peer = %source, kind = ?kind, error = %e);
                        self.events.error(EngineError::negotiation(&source, format!("{e:#}")));
                    }
                }
            }
            SignalMessage::Answer {
                description,
                screen_id,
                for_screen_share,
            } => {
                let kind = ConnectionKind::from_screen_flag(for_screen_share);
                let (transport, screen_track_id) = self.negotiator();
                let negotiator = Negotiator {
                    transport: transport.as_ref(),
                    screen_track_id,
                };
                let Some(session) = self.sessions.get_mut(&source) else {
                    warn!(event = "answer_without_session", peer = %source);
                    return;
                };
                if let Err(e) = negotiator.handle_answer(session, kind, description, screen_id).await {
                    warn!(event = "answer_failed", peer = %source, kind = ?kind, error = %e);
                    self.events.error(EngineError::negotiation(&source, format!("{e:#}")));
                }
            }
            SignalMessage::IceCandidate {
                candidate,
                for_screen_share,
            } => {
                if !self.ensure_session(&source, extra).await {
                    return;
                }
                if let Some(session) = self.sessions.get(&source) {
                    apply_candidate(session, ConnectionKind::from_screen_flag(for_screen_share), candidate)
                        .await;
                }
            }
            SignalMessage::ScreenShareTrackId(track_id) => {
                self.on_screen_share_announced(&source, track_id).await
            }
            SignalMessage::StartSendingScreen => self.on_start_sending_screen(&source).await,
            SignalMessage::ScreenShareOff => self.clear_remote(&source, MediaSource::Screen),
            SignalMessage::TrackEnded(kind) => self.clear_remote(&source, kind),
        }
    }

    fn clear_remote(&mut self, peer: &str, source: MediaSource) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if source == MediaSource::Screen {
            session.remote_screen_track_id = None;
        }
        if session.remote.clear(source) {
            info!(event = "remote_track_ended", peer = %peer, source = %source);
            self.emit_peers();
        }
    }

    // ── Connection callbacks ──

    pub(super) async fn handle_session_event(&mut self, event: SessionEvent) {
        let SessionEvent {
            peer,
            generation,
            kind,
            event,
        } = event;
        match self.sessions.get(&peer) {
            Some(session) if session.generation == generation => {}
            _ => {
                debug!(event = "stale_callback", peer = %peer, generation, callback = ?event);
                return;
            }
        }

        match event {
            ConnectionEvent::NegotiationNeeded => {
                let (transport, screen_track_id) = self.negotiator();
                let negotiator = Negotiator {
                    transport: transport.as_ref(),
                    screen_track_id,
                };
                let Some(session) = self.sessions.get_mut(&peer) else {
                    return;
                };
                if let Err(e) = negotiator.negotiate(session, kind, false).await {
                    warn!(event = "negotiation_failed", peer = %peer, kind = ?kind, error = %e);
                    self.events.error(EngineError::negotiation(&peer, format!("{e:#}")));
                }
            }
            ConnectionEvent::IceCandidate(candidate) => {
                let (transport, screen_track_id) = self.negotiator();
                let negotiator = Negotiator {
                    transport: transport.as_ref(),
                    screen_track_id,
                };
                if let Err(e) = negotiator.send_candidate(&peer, kind, candidate).await {
                    warn!(event = "ice_candidate_send_failed", peer = %peer, kind = ?kind, error = %e);
                }
            }
            ConnectionEvent::IceStateChanged(state) => self.on_ice_state(&peer, kind, state).await,
            ConnectionEvent::StateChanged(state) => self.on_connection_state(&peer, kind, state).await,
            ConnectionEvent::Track(track) => {
                let Some(session) = self.sessions.get_mut(&peer) else {
                    return;
                };
                let track_id = track.id();
                let source = classify_track(
                    kind,
                    track.kind(),
                    &track_id,
                    session.remote_screen_track_id.as_deref(),
                );
                if let Some(old) = session.remote.set(source, track) {
                    if old.id() != track_id {
                        old.stop();
                    }
                }
                info!(event = "remote_track", peer = %peer, source = %source, track = %track_id);
                self.emit_peers();
            }
            ConnectionEvent::TrackMuted { track_id } => {
                let known = self
                    .sessions
                    .get(&peer)
                    .and_then(|s| s.remote.find(&track_id));
                if let Some(source) = known {
                    debug!(event = "remote_track_muted", peer = %peer, source = %source);
                    self.emit_peers();
                }
            }
            ConnectionEvent::DataChannel(channel) => self.on_remote_channel(&peer, kind, channel).await,
            ConnectionEvent::ChannelOpen { label } => {
                info!(event = "channel_open", peer = %peer, label = %label);
            }
            ConnectionEvent::ChannelMessage { label, message } => {
                self.on_channel_message(&peer, &label, message).await
            }
            ConnectionEvent::ChannelClosed { label } => self.on_channel_closed(&peer, &label),
            ConnectionEvent::ChannelError { label, reason } => {
                warn!(event = "channel_error", peer = %peer, label = %label, reason = %reason);
                self.events.error(EngineError::channel(&peer, &label, reason));
            }
        }
    }

    async fn on_ice_state(&mut self, peer: &PeerId, kind: ConnectionKind, state: IceConnectionState) {
        match state {
            IceConnectionState::Failed => {
                let limit = self.config.ice_restart_limit;
                let (transport, screen_track_id) = self.negotiator();
                let negotiator = Negotiator {
                    transport: transport.as_ref(),
                    screen_track_id,
                };
                let Some(session) = self.sessions.get_mut(peer) else {
                    return;
                };
                match negotiator.restart_ice(session, kind, limit).await {
                    Ok(RestartOutcome::Restarting) => {}
                    Ok(RestartOutcome::GaveUp) => {
                        self.events.error(EngineError::negotiation(
                            peer,
                            format!("ICE failed after {limit} restarts"),
                        ));
                        if kind == ConnectionKind::Media {
                            self.teardown_session(peer, "ICE failed").await;
                        }
                    }
                    Err(e) => {
                        warn!(event = "ice_restart_failed", peer = %peer, kind = ?kind, error = %e);
                        self.events.error(EngineError::negotiation(peer, format!("{e:#}")));
                    }
                }
            }
            IceConnectionState::Connected | IceConnectionState::Completed => {
                if let Some(session) = self.sessions.get_mut(peer) {
                    session.slot_mut(kind).ice_restarts = 0;
                }
            }
            _ => debug!(event = "ice_state", peer = %peer, kind = ?kind, state = ?state),
        }
    }

    async fn on_connection_state(&mut self, peer: &PeerId, kind: ConnectionKind, state: PeerConnectionState) {
        match state {
            PeerConnectionState::Connected => info!(event = "webrtc_connected", peer = %peer, kind = ?kind),
            PeerConnectionState::Disconnected => {
                warn!(event = "webrtc_disconnected", peer = %peer, kind = ?kind, "Transient disconnect (ICE may recover)")
            }
            PeerConnectionState::Failed => error!(event = "webrtc_failed", peer = %peer, kind = ?kind),
            PeerConnectionState::Closed => info!(event = "webrtc_closed", peer = %peer, kind = ?kind),
            _ => debug!(event = "webrtc_state", peer = %peer, kind = ?kind, state = ?state),
        }
        if kind != ConnectionKind::Media {
            return;
        }
        if state == PeerConnectionState::Closed {
            self.teardown_session(peer, "connection closed").await;
        } else {
            self.emit_peers();
        }
    }
}
