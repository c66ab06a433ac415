//! File transfer record shared by both ends of a transfer.

use crate::core::types::PeerId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

/// Wire shape: camelCase JSON carried in control frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransfer {
    pub file_id: Uuid,
    pub file_name: String,
    pub total_size: u64,
    pub completed_size: u64,
    /// Percent, `0.0..=100.0`.
    pub progress: f64,
    /// Bytes per second over the last update.
    pub transfer_speed: f64,
    pub last_time_stamp: u64,
    /// The other end of the transfer, from the holder's point of view.
    pub peer_id: PeerId,
}

impl FileTransfer {
    pub fn new(file_name: impl Into<String>, total_size: u64, peer_id: impl Into<PeerId>) -> Self {
        Self {
            file_id: Uuid::new_v4(),
            file_name: file_name.into(),
            total_size,
            completed_size: 0,
            progress: if total_size == 0 { 100.0 } else { 0.0 },
            transfer_speed: 0.0,
            last_time_stamp: now_ms(),
            peer_id: peer_id.into(),
        }
    }

    /// Restart accounting, as the receiving side does when it accepts.
    pub fn reset(&mut self, now: u64) {
        self.completed_size = 0;
        self.progress = if self.total_size == 0 { 100.0 } else { 0.0 };
        self.transfer_speed = 0.0;
        self.last_time_stamp = now;
    }

    /// Fold `bytes` more into the record. Progress never decreases.
    pub fn advance(&mut self, bytes: u64, now: u64) {
        self.completed_size = self.completed_size.saturating_add(bytes);
        let elapsed = now.saturating_sub(self.last_time_stamp);
        if elapsed > 0 {
            self.transfer_speed = bytes as f64 * 1000.0 / elapsed as f64;
            self.last_time_stamp = now;
        }
        let progress = if self.total_size == 0 {
            100.0
        } else {
            (self.completed_size as f64 / self.total_size as f64 * 100.0).min(100.0)
        };
        self.progress = self.progress.max(progress);
    }

    pub fn is_complete(&self) -> bool {
        self.completed_size >= self.total_size
    }

    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.completed_size)
    }
}
