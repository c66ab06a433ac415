//! Error taxonomy surfaced to applications.
//!
//! Only [`EngineError::System`] is ever returned from an engine call; the
//! other variants are delivered as `EngineEvent::Error` on the event stream.

use crate::core::types::{MediaSource, PeerId};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine is not running")]
    System,

    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: PeerId, reason: String },

    #[error("could not acquire {kind} track: {reason}")]
    Device { kind: MediaSource, reason: String },

    #[error("channel '{label}' to {peer}: {reason}")]
    Channel {
        peer: PeerId,
        label: String,
        reason: String,
    },

    #[error("transfer {file_id} failed: {reason}")]
    Transfer { file_id: Uuid, reason: String },
}

impl EngineError {
    pub fn negotiation(peer: &str, err: impl std::fmt::Display) -> Self {
        EngineError::Negotiation {
            peer: peer.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn channel(peer: &str, label: &str, err: impl std::fmt::Display) -> Self {
        EngineError::Channel {
            peer: peer.to_string(),
            label: label.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn transfer(file_id: Uuid, err: impl std::fmt::Display) -> Self {
        EngineError::Transfer {
            file_id,
            reason: err.to_string(),
        }
    }

    /// Whether repeating the user action can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Device { .. } | EngineError::Negotiation { .. }
        )
    }
}
