//! Receiver pipeline: reassembles an incoming transfer from ordered
//! fragments.
//!
//! Completion is reported exactly once, when `completed == total`. Bytes
//! past the announced size are a protocol violation.

use crate::core::protocol::FileTransfer;
use crate::utils::hash::{Digest256, TransferHasher};
use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};

#[derive(Debug)]
pub enum ReceiveProgress {
    Partial,
    Complete { data: Bytes, digest: Digest256 },
}

pub struct IncomingTransfer {
    pub transfer: FileTransfer,
    fragments: Vec<Bytes>,
    hasher: TransferHasher,
    finished: bool,
}

impl IncomingTransfer {
    pub fn new(mut transfer: FileTransfer, now: u64) -> Self {
        transfer.reset(now);
        Self {
            transfer,
            fragments: Vec::new(),
            hasher: TransferHasher::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Append a fragment and fold it into progress.
    pub fn push(&mut self, fragment: Bytes, now: u64) -> Result<ReceiveProgress> {
        if self.finished {
            bail!("fragment after completion");
        }
        let len = fragment.len() as u64;
        if len > self.transfer.remaining() {
            bail!(
                "received {} bytes past the announced size of {}",
                self.transfer.completed_size + len - self.transfer.total_size,
                self.transfer.total_size
            );
        }
        self.hasher.update(&fragment);
        self.fragments.push(fragment);
        self.transfer.advance(len, now);

        if self.transfer.is_complete() {
            Ok(self.finish())
        } else {
            Ok(ReceiveProgress::Partial)
        }
    }

    /// Assemble the artifact. Only valid once; later calls yield `Partial`.
    pub fn finish(&mut self) -> ReceiveProgress {
        if self.finished || !self.transfer.is_complete() {
            return ReceiveProgress::Partial;
        }
        self.finished = true;
        let mut out = BytesMut::with_capacity(self.transfer.total_size as usize);
        for fragment in self.fragments.drain(..) {
            out.extend_from_slice(&fragment);
        }
        let digest = std::mem::take(&mut self.hasher).finalize();
        ReceiveProgress::Complete {
            data: out.freeze(),
            digest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hash::sha3_256;

    #[test]
    fn completes_once_with_exact_bytes() {
        let data: Vec<u8> = (0..25_000u32).map(|i| (i % 251) as u8).collect();
        let mut incoming = IncomingTransfer::new(FileTransfer::new("f", data.len() as u64, "p"), 0);

        let chunks: Vec<&[u8]> = data.chunks(10_240).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let progress = incoming
                .push(Bytes::copy_from_slice(chunk), (i as u64 + 1) * 10)
                .unwrap();
            if i + 1 < chunks.len() {
                assert!(matches!(progress, ReceiveProgress::Partial));
            } else {
                match progress {
                    ReceiveProgress::Complete { data: out, digest } => {
                        assert_eq!(out.as_ref(), data.as_slice());
                        assert_eq!(digest, sha3_256(&data));
                    }
                    ReceiveProgress::Partial => panic!("expected completion"),
                }
            }
        }
        assert_eq!(incoming.transfer.progress, 100.0);
        assert!(incoming.is_finished());
        assert!(incoming.push(Bytes::from_static(b"x"), 100).is_err());
        assert!(matches!(incoming.finish(), ReceiveProgress::Partial));
    }

    #[test]
    fn overflow_is_rejected() {
        let mut incoming = IncomingTransfer::new(FileTransfer::new("f", 4, "p"), 0);
        incoming.push(Bytes::from_static(b"ab"), 1).unwrap();
        assert!(incoming.push(Bytes::from_static(b"cde"), 2).is_err());
        assert_eq!(incoming.transfer.completed_size, 2);
    }

    #[test]
    fn zero_size_finishes_immediately() {
        let mut incoming = IncomingTransfer::new(FileTransfer::new("empty", 0, "p"), 0);
        match incoming.finish() {
            ReceiveProgress::Complete { data, .. } => assert!(data.is_empty()),
            ReceiveProgress::Partial => panic!("expected completion"),
        }
    }
}
