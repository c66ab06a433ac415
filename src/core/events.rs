//! Outbound event stream.
//!
//! Every subscriber gets its own unbounded queue, so a slow consumer never
//! stalls the engine. Order is preserved per subscriber.

use crate::core::aggregator::PeerSnapshot;
use crate::core::error::EngineError;
use crate::core::media::MediaTrack;
use crate::core::protocol::{FileTransfer, TransferDirection};
use crate::core::types::{MediaSource, PeerId};
use crate::utils::hash::Digest256;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Error(EngineError),
    PeersChanged(Vec<PeerSnapshot>),
    LocalMediaChanged {
        source: MediaSource,
        on: bool,
        track: Option<Arc<dyn MediaTrack>>,
    },
    /// Application payload received on a control channel.
    ControlMessage { from: PeerId, text: String },
    TransferProgress {
        transfer: FileTransfer,
        direction: TransferDirection,
    },
    TransferCompleted {
        transfer: FileTransfer,
        direction: TransferDirection,
        digest: Digest256,
        /// Reassembled bytes; present for incoming transfers only.
        data: Option<Bytes>,
    },
}

#[derive(Clone, Default)]
pub struct EventHub {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber, dropping the ones that went away.
    pub fn emit(&self, event: EngineEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn error(&self, err: EngineError) {
        self.emit(EngineEvent::Error(err));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
