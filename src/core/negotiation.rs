//! Perfect-negotiation coordinator.
//!
//! Runs offer/answer/ICE independently for a session's media and screen
//! connections. Glare is resolved by role: the impolite side drops a
//! colliding offer, the polite side rolls back its own and answers. A
//! trigger that arrives while a connection is busy is remembered and
//! replayed once the connection is stable again.

use crate::core::session::PeerSession;
use crate::core::signaling::{MessageTransport, SignalMessage};
use crate::core::types::{
    ConnectionKind, IceCandidate, MediaKind, MediaSource, PeerId, SessionDescription,
    SignalingState,
};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Sent,
    /// Connection busy; the offer will be replayed once stable.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    Answered,
    /// Impolite side on collision.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarting,
    /// Too many restarts without reaching "connected".
    GaveUp,
}

pub struct Negotiator<'a> {
    pub transport: &'a dyn MessageTransport,
    /// Local screen track id, advertised on media-connection descriptions.
    pub screen_track_id: Option<String>,
}

impl Negotiator<'_> {
    fn screen_id_for(&self, kind: ConnectionKind) -> Option<String> {
        match kind {
            ConnectionKind::Media => self.screen_track_id.clone(),
            ConnectionKind::Screen => None,
        }
    }

    async fn send(&self, peer: &PeerId, msg: SignalMessage) -> Result<()> {
        self.transport
            .send(msg.to_json(), peer)
            .await
            .with_context(|| format!("relaying {}", msg.name()))
    }

    /// Create, apply and send an offer, unless the connection is busy.
    pub async fn negotiate(
        &self,
        session: &mut PeerSession,
        kind: ConnectionKind,
        ice_restart: bool,
    ) -> Result<OfferOutcome> {
        let peer = session.id.clone();
        let slot = session.slot_mut(kind);
        let signaling = slot.conn.signaling_state();
        if slot.negotiating || signaling != SignalingState::Stable {
            slot.pending_renegotiation = true;
            slot.restart_pending |= ice_restart;
            debug!(event = "offer_deferred", peer = %peer, kind = ?kind, signaling = ?signaling);
            return Ok(OfferOutcome::Deferred);
        }

        let ice_restart = ice_restart || std::mem::take(&mut slot.restart_pending);
        slot.pending_renegotiation = false;
        slot.negotiating = true;
        let conn = slot.conn.clone();

        let result: Result<()> = async {
            let offer = conn.create_offer(ice_restart).await.context("creating offer")?;
            conn.set_local_description(offer.clone())
                .await
                .context("applying local offer")?;
            self.send(
                &peer,
                SignalMessage::Offer {
                    description: offer,
                    screen_id: self.screen_id_for(kind),
                    for_screen_share: kind.is_screen(),
                },
            )
            .await
        }
        .await;

        match result {
            Ok(()) => {
                info!(event = "offer_sent", peer = %peer, kind = ?kind, ice_restart);
                Ok(OfferOutcome::Sent)
            }
            Err(e) => {
                session.slot_mut(kind).negotiating = false;
                Err(e)
            }
        }
    }

    pub async fn handle_offer(
        &self,
        session: &mut PeerSession,
        kind: ConnectionKind,
        description: SessionDescription,
        screen_id: Option<String>,
    ) -> Result<OfferDisposition> {
        if kind == ConnectionKind::Media && screen_id.is_some() {
            session.remote_screen_track_id = screen_id;
        }
        let peer = session.id.clone();
        let polite = session.is_polite();
        let slot = session.slot_mut(kind);
        let signaling = slot.conn.signaling_state();
        let collision = slot.negotiating || signaling != SignalingState::Stable;

        if collision && !polite {
            info!(event = "offer_ignored", peer = %peer, kind = ?kind, signaling = ?signaling, "Offer collision, keeping our own");
            return Ok(OfferDisposition::Ignored);
        }

        if signaling == SignalingState::HaveLocalOffer {
            slot.conn.rollback().await.context("rolling back local offer")?;
            if slot.negotiating {
                slot.pending_renegotiation = true;
            }
            slot.negotiating = false;
            info!(event = "offer_rolled_back", peer = %peer, kind = ?kind);
        }

        let conn = slot.conn.clone();
        conn.set_remote_description(description)
            .await
            .context("applying remote offer")?;
        let answer = conn.create_answer().await.context("creating answer")?;
        conn.set_local_description(answer.clone())
            .await
            .context("applying local answer")?;
        self.send(
            &peer,
            SignalMessage::Answer {
                description: answer,
                screen_id: self.screen_id_for(kind),
                for_screen_share: kind.is_screen(),
            },
        )
        .await?;
        info!(event = "answer_sent", peer = %peer, kind = ?kind);

        self.replay_pending(session, kind).await?;
        Ok(OfferDisposition::Answered)
    }

    pub async fn handle_answer(
        &self,
        session: &mut PeerSession,
        kind: ConnectionKind,
        description: SessionDescription,
        screen_id: Option<String>,
    ) -> Result<()> {
        if kind == ConnectionKind::Media && screen_id.is_some() {
            session.remote_screen_track_id = screen_id;
        }
        let slot = session.slot_mut(kind);
        let result = slot.conn.set_remote_description(description).await;
        slot.negotiating = false;
        result.context("applying remote answer")?;
        info!(event = "answer_applied", peer = %session.id, kind = ?kind);

        self.replay_pending(session, kind).await
    }

    async fn replay_pending(&self, session: &mut PeerSession, kind: ConnectionKind) -> Result<()> {
        let slot = session.slot(kind);
        if slot.pending_renegotiation
            && !slot.negotiating
            && slot.conn.signaling_state() == SignalingState::Stable
        {
            self.negotiate(session, kind, false).await?;
        }
        Ok(())
    }

    pub async fn send_candidate(
        &self,
        peer: &PeerId,
        kind: ConnectionKind,
        candidate: IceCandidate,
    ) -> Result<()> {
        self.send(
            peer,
            SignalMessage::IceCandidate {
                candidate,
                for_screen_share: kind.is_screen(),
            },
        )
        .await
    }

    /// ICE restart after a failure, bounded by `limit` consecutive attempts.
    pub async fn restart_ice(
        &self,
        session: &mut PeerSession,
        kind: ConnectionKind,
        limit: u32,
    ) -> Result<RestartOutcome> {
        let peer = session.id.clone();
        let slot = session.slot_mut(kind);
        slot.ice_restarts += 1;
        let attempt = slot.ice_restarts;
        if attempt > limit {
            warn!(event = "ice_restart_exhausted", peer = %peer, kind = ?kind, attempts = attempt - 1);
            return Ok(RestartOutcome::GaveUp);
        }
        info!(event = "ice_restart", peer = %peer, kind = ?kind, attempt);
        self.negotiate(session, kind, true).await?;
        Ok(RestartOutcome::Restarting)
    }
}

/// Apply a remote candidate. Failures are logged and otherwise ignored.
pub async fn apply_candidate(session: &PeerSession, kind: ConnectionKind, candidate: IceCandidate) {
    if let Err(e) = session.slot(kind).conn.add_ice_candidate(candidate).await {
        warn!(event = "ice_candidate_rejected", peer = %session.id, kind = ?kind, error = %e);
    }
}

/// Which remote slot an incoming track belongs to.
pub fn classify_track(
    kind: ConnectionKind,
    track_kind: MediaKind,
    track_id: &str,
    remote_screen_track_id: Option<&str>,
) -> MediaSource {
    match (kind, track_kind) {
        (_, MediaKind::Audio) => MediaSource::Microphone,
        (ConnectionKind::Screen, MediaKind::Video) => MediaSource::Screen,
        (ConnectionKind::Media, MediaKind::Video) => {
            if remote_screen_track_id == Some(track_id) {
                MediaSource::Screen
            } else {
                MediaSource::Camera
            }
        }
    }
}
