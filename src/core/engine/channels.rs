//! Control channel traffic and file transfers.
//!
//! A transfer is offered over the control channel; once accepted the sender
//! opens a dedicated `file-<id>` channel on the media connection and streams
//! binary chunks through it. The receiving side closes that channel when the
//! last byte arrives.

use super::{EngineLoop, IncomingEntry, OutgoingStage, OutgoingTransfer, Target};
use crate::core::config::{CONTROL_CHANNEL_LABEL, FILE_CHANNEL_PREFIX};
use crate::core::connection::{ChannelMessage, DataChannel};
use crate::core::error::EngineError;
use crate::core::events::EngineEvent;
use crate::core::pipeline::{FileSource, IncomingTransfer, OutgoingStream, ReceiveProgress};
use crate::core::protocol::{now_ms, ControlMessage, FileTransfer, TransferDirection};
use crate::core::types::{ChannelState, ConnectionKind, PeerId};
use crate::utils::hash::{sha3_256, Digest256};
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn file_channel_label(file_id: Uuid) -> String {
    format!("{FILE_CHANNEL_PREFIX}{file_id}")
}

fn file_id_from_label(label: &str) -> Option<Uuid> {
    label
        .strip_prefix(FILE_CHANNEL_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

impl EngineLoop {
    // ── Control channel ──

    async fn send_control_text(&self, peer: &str, text: String) -> Result<(), EngineError> {
        let session = self
            .sessions
            .get(peer)
            .ok_or_else(|| EngineError::channel(peer, CONTROL_CHANNEL_LABEL, "no session"))?;
        let channel = session
            .control_channel
            .as_ref()
            .ok_or_else(|| EngineError::channel(peer, CONTROL_CHANNEL_LABEL, "not established"))?;
        if channel.ready_state() != ChannelState::Open {
            return Err(EngineError::channel(
                peer,
                CONTROL_CHANNEL_LABEL,
                format!("channel is {:?}", channel.ready_state()),
            ));
        }
        channel
            .send_text(text)
            .await
            .map_err(|e| EngineError::channel(peer, CONTROL_CHANNEL_LABEL, format!("{e:#}")))
    }

    async fn send_control_frame(&self, peer: &str, frame: ControlMessage) -> Result<(), EngineError> {
        let text = frame
            .to_json()
            .map_err(|e| EngineError::channel(peer, CONTROL_CHANNEL_LABEL, e))?;
        self.send_control_text(peer, text).await
    }

    pub(super) async fn send_control(&mut self, target: Target, payload: serde_json::Value) {
        let text = payload.to_string();
        let peers: Vec<PeerId> = match target {
            Target::All => self.sessions.keys().cloned().collect(),
            Target::Peer(id) => vec![id],
        };
        for peer in peers {
            if let Err(e) = self.send_control_text(&peer, text.clone()).await {
                warn!(event = "control_send_failed", peer = %peer, error = %e);
                self.events.error(e);
            }
        }
    }

    async fn on_control_text(&mut self, peer: &PeerId, text: String) {
        match ControlMessage::parse(&text) {
            ControlMessage::FileRequest(transfer) => self.on_file_request(peer, transfer).await,
            ControlMessage::FileResponse(transfer) => self.on_file_response(peer, transfer).await,
            ControlMessage::FileRejected(transfer) => self.on_file_rejected(peer, transfer),
            ControlMessage::ScreenShareTrackId(id) => self.on_screen_share_announced(peer, id).await,
            ControlMessage::StartSendingScreen => self.on_start_sending_screen(peer).await,
            ControlMessage::Application(text) => self.events.emit(EngineEvent::ControlMessage {
                from: peer.clone(),
                text,
            }),
        }
    }

    pub(super) async fn on_remote_channel(
        &mut self,
        peer: &PeerId,
        kind: ConnectionKind,
        channel: Arc<dyn DataChannel>,
    ) {
        let label = channel.label();
        let expected_file = file_id_from_label(&label)
            .is_some_and(|id| self.incoming.get(&id).is_some_and(|e| e.peer == *peer));
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };

        if kind == ConnectionKind::Media && label == CONTROL_CHANNEL_LABEL {
            info!(event = "control_channel_attached", peer = %peer);
            session.control_channel = Some(channel);
        } else if kind == ConnectionKind::Media && expected_file {
            debug!(event = "file_channel_attached", peer = %peer, label = %label);
            session.file_channels.insert(label, channel);
        } else {
            warn!(event = "channel_refused", peer = %peer, kind = ?kind, label = %label, "Unexpected data channel");
            let _ = channel.close().await;
        }
    }

    pub(super) async fn on_channel_message(&mut self, peer: &PeerId, label: &str, message: ChannelMessage) {
        match message {
            ChannelMessage::Text(text) if label == CONTROL_CHANNEL_LABEL => {
                self.on_control_text(peer, text).await
            }
            ChannelMessage::Binary(data) => match file_id_from_label(label) {
                Some(file_id) => self.on_file_fragment(peer, file_id, label, data).await,
                None => warn!(event = "binary_ignored", peer = %peer, label = %label),
            },
            ChannelMessage::Text(_) => warn!(event = "text_ignored", peer = %peer, label = %label),
        }
    }

    pub(super) fn on_channel_closed(&mut self, peer: &PeerId, label: &str) {
        if let Some(session) = self.sessions.get_mut(peer) {
            if label == CONTROL_CHANNEL_LABEL {
                session.control_channel = None;
                info!(event = "control_channel_closed", peer = %peer);
            } else {
                session.file_channels.remove(label);
            }
        }
        if let Some(file_id) = file_id_from_label(label) {
            if let Some(entry) = self.incoming.remove(&file_id) {
                warn!(event = "transfer_interrupted", peer = %peer, file_id = %file_id);
                self.events.error(EngineError::transfer(
                    file_id,
                    format!("channel closed after {} bytes", entry.transfer.transfer.completed_size),
                ));
            }
        }
    }

    // ── Outgoing ──

    pub(super) async fn send_file(&mut self, to: PeerId, source: FileSource) -> Uuid {
        let size = match source.len().await {
            Ok(size) => size,
            Err(e) => {
                let transfer = FileTransfer::new(source.name(), 0, to);
                self.events.error(EngineError::transfer(transfer.file_id, format!("{e:#}")));
                return transfer.file_id;
            }
        };
        let transfer = FileTransfer::new(source.name(), size, to.clone());
        let file_id = transfer.file_id;

        if let Err(e) = self
            .send_control_frame(&to, ControlMessage::FileRequest(transfer.clone()))
            .await
        {
            warn!(event = "file_offer_failed", peer = %to, file_id = %file_id, error = %e);
            self.events.error(e);
            self.events.error(EngineError::transfer(file_id, "request not delivered"));
            return file_id;
        }

        info!(event = "file_offer_sent", peer = %to, file_id = %file_id, name = %transfer.file_name, size);
        self.outgoing.insert(
            file_id,
            OutgoingTransfer {
                peer: to,
                transfer,
                stage: OutgoingStage::AwaitingResponse(source),
            },
        );
        file_id
    }

    async fn on_file_response(&mut self, peer: &PeerId, response: FileTransfer) {
        let file_id = response.file_id;
        let awaiting = self.outgoing.get(&file_id).is_some_and(|o| {
            o.peer == *peer && matches!(o.stage, OutgoingStage::AwaitingResponse(_))
        });
        if !awaiting {
            warn!(event = "file_response_unexpected", peer = %peer, file_id = %file_id);
            return;
        }
        let Some(OutgoingTransfer {
            peer,
            transfer,
            stage: OutgoingStage::AwaitingResponse(source),
        }) = self.outgoing.remove(&file_id)
        else {
            return;
        };
        info!(event = "file_offer_accepted", peer = %peer, file_id = %file_id);

        if transfer.total_size == 0 {
            let mut done = transfer;
            done.reset(now_ms());
            self.events.emit(EngineEvent::TransferCompleted {
                transfer: done,
                direction: TransferDirection::Outgoing,
                digest: sha3_256(&[]),
                data: None,
            });
            return;
        }

        let label = file_channel_label(file_id);
        let Some(session) = self.sessions.get_mut(&peer) else {
            self.events.error(EngineError::transfer(file_id, "peer left"));
            return;
        };
        let channel = match session.media.conn.create_data_channel(&label).await {
            Ok(channel) => channel,
            Err(e) => {
                self.events.error(EngineError::channel(&peer, &label, format!("{e:#}")));
                self.events.error(EngineError::transfer(file_id, "could not open channel"));
                return;
            }
        };
        session.file_channels.insert(label, channel.clone());

        let sos = SignalOfStop::new();
        let stream = OutgoingStream {
            transfer: transfer.clone(),
            channel,
            source,
            chunk_size: self.config.chunk_size,
            high_water: self.config.high_water_mark,
            sos: sos.clone(),
            events: self.events.clone(),
        };
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let outcome = stream.run().await.map_err(|e| format!("{e:#}"));
            let _ = internal.send(super::Internal::OutgoingFinished { file_id, outcome });
        });

        self.outgoing.insert(
            file_id,
            OutgoingTransfer {
                peer,
                transfer,
                stage: OutgoingStage::Streaming(sos),
            },
        );
    }

    fn on_file_rejected(&mut self, peer: &PeerId, rejected: FileTransfer) {
        let file_id = rejected.file_id;
        if !self.outgoing.get(&file_id).is_some_and(|o| o.peer == *peer) {
            warn!(event = "file_reject_unexpected", peer = %peer, file_id = %file_id);
            return;
        }
        if let Some(OutgoingTransfer {
            stage: OutgoingStage::Streaming(sos),
            ..
        }) = self.outgoing.remove(&file_id)
        {
            sos.cancel();
        }
        info!(event = "file_offer_rejected", peer = %peer, file_id = %file_id);
        self.events
            .error(EngineError::transfer(file_id, format!("rejected by {peer}")));
    }

    pub(super) async fn on_outgoing_finished(
        &mut self,
        file_id: Uuid,
        outcome: std::result::Result<(FileTransfer, Digest256), String>,
    ) {
        let Some(entry) = self.outgoing.remove(&file_id) else {
            return;
        };
        match outcome {
            Ok((transfer, digest)) => {
                info!(event = "transfer_sent", peer = %entry.peer, file_id = %file_id, size = transfer.total_size);
                self.events.emit(EngineEvent::TransferCompleted {
                    transfer,
                    direction: TransferDirection::Outgoing,
                    digest,
                    data: None,
                });
            }
            Err(reason) => {
                warn!(event = "transfer_failed", peer = %entry.peer, file_id = %file_id, reason = %reason);
                let label = file_channel_label(file_id);
                if let Some(channel) = self
                    .sessions
                    .get_mut(&entry.peer)
                    .and_then(|s| s.file_channels.remove(&label))
                {
                    let _ = channel.close().await;
                }
                self.events.error(EngineError::transfer(file_id, reason));
            }
        }
    }

    /// Fail or cancel every transfer involving `peer`.
    pub(super) fn abort_transfers_for(&mut self, peer: &str, reason: &str) {
        let outgoing: Vec<Uuid> = self
            .outgoing
            .iter()
            .filter(|(_, o)| o.peer == peer)
            .map(|(id, _)| *id)
            .collect();
        for file_id in outgoing {
            let streaming = match self.outgoing.get(&file_id).map(|o| &o.stage) {
                Some(OutgoingStage::Streaming(sos)) => {
                    sos.cancel();
                    true
                }
                _ => false,
            };
            // Streaming transfers report once their task winds down.
            if !streaming {
                self.outgoing.remove(&file_id);
                self.events.error(EngineError::transfer(file_id, reason));
            }
        }

        let incoming: Vec<Uuid> = self
            .incoming
            .iter()
            .filter(|(_, e)| e.peer == peer)
            .map(|(id, _)| *id)
            .collect();
        for file_id in incoming {
            self.incoming.remove(&file_id);
            self.events.error(EngineError::transfer(file_id, reason));
        }
    }

    // ── Incoming ──

    async fn on_file_request(&mut self, peer: &PeerId, mut transfer: FileTransfer) {
        transfer.peer_id = peer.clone();
        let file_id = transfer.file_id;

        if self.incoming.contains_key(&file_id) || self.outgoing.contains_key(&file_id) {
            warn!(event = "file_request_duplicate", peer = %peer, file_id = %file_id);
            return;
        }

        if !(self.file_filter)(&transfer.file_name, peer) {
            info!(event = "file_request_rejected", peer = %peer, file_id = %file_id, name = %transfer.file_name);
            if let Err(e) = self
                .send_control_frame(peer, ControlMessage::FileRejected(transfer))
                .await
            {
                self.events.error(e);
            }
            return;
        }

        let mut incoming = IncomingTransfer::new(transfer.clone(), now_ms());
        if let Err(e) = self
            .send_control_frame(peer, ControlMessage::FileResponse(transfer))
            .await
        {
            self.events.error(e);
            return;
        }
        info!(event = "file_request_accepted", peer = %peer, file_id = %file_id, size = incoming.transfer.total_size);

        if let ReceiveProgress::Complete { data, digest } = incoming.finish() {
            self.complete_incoming(incoming.transfer, data, digest);
            return;
        }
        self.incoming.insert(
            file_id,
            IncomingEntry {
                peer: peer.clone(),
                transfer: incoming,
            },
        );
    }

    async fn on_file_fragment(&mut self, peer: &PeerId, file_id: Uuid, label: &str, data: Bytes) {
        let Some(entry) = self.incoming.get_mut(&file_id) else {
            debug!(event = "fragment_unexpected", peer = %peer, label = %label);
            return;
        };
        if entry.peer != *peer {
            warn!(event = "fragment_wrong_peer", peer = %peer, file_id = %file_id);
            return;
        }

        let outcome = entry.transfer.push(data, now_ms());
        let transfer = entry.transfer.transfer.clone();
        match outcome {
            Ok(ReceiveProgress::Partial) => self.events.emit(EngineEvent::TransferProgress {
                transfer,
                direction: TransferDirection::Incoming,
            }),
            Ok(ReceiveProgress::Complete { data, digest }) => {
                self.incoming.remove(&file_id);
                self.events.emit(EngineEvent::TransferProgress {
                    transfer: transfer.clone(),
                    direction: TransferDirection::Incoming,
                });
                self.complete_incoming(transfer, data, digest);
                self.close_file_channel(peer, label).await;
            }
            Err(e) => {
                self.incoming.remove(&file_id);
                warn!(event = "transfer_corrupt", peer = %peer, file_id = %file_id, error = %e);
                self.events.error(EngineError::transfer(file_id, format!("{e:#}")));
                self.close_file_channel(peer, label).await;
            }
        }
    }

    fn complete_incoming(&self, transfer: FileTransfer, data: Bytes, digest: Digest256) {
        info!(event = "transfer_received", peer = %transfer.peer_id, file_id = %transfer.file_id, size = transfer.total_size);
        self.events.emit(EngineEvent::TransferCompleted {
            transfer,
            direction: TransferDirection::Incoming,
            digest,
            data: Some(data),
        });
    }

    async fn close_file_channel(&mut self, peer: &PeerId, label: &str) {
        let channel = self
            .sessions
            .get_mut(peer)
            .and_then(|s| s.file_channels.remove(label));
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!(event = "channel_close_failed", peer = %peer, label = %label, error = %e);
            }
        }
    }
}
