//! Sender pipeline: streams a file over its dedicated data channel.
//!
//! ```text
//! ┌──────────┐  bounded chan  ┌──────────────────────────┐
//! │ Reader   │ ──────────────►│ Send loop                │──► DataChannel
//! │ (async)  │   read-ahead   │ (backpressure + progress)│
//! └──────────┘                └──────────────────────────┘
//! ```
//!
//! Before each chunk the send loop checks the channel's buffered amount and
//! only queues when `buffered + chunk <= high_water_mark`. Otherwise it
//! polls with exponential backoff until the buffer drains, the channel
//! closes, or the transfer is cancelled.

use crate::core::config::{BACKPRESSURE_POLL_MAX, BACKPRESSURE_POLL_MIN, SENDER_READ_AHEAD_CHUNKS};
use crate::core::connection::DataChannel;
use crate::core::events::{EngineEvent, EventHub};
use crate::core::protocol::{now_ms, FileTransfer, TransferDirection};
use crate::core::types::ChannelState;
use crate::utils::hash::{Digest256, TransferHasher};
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

// ── Sources ────────────────────────────────────────────────────────────────────

/// What to send.
#[derive(Debug, Clone)]
pub enum FileSource {
    Bytes { name: String, data: Bytes },
    Path(PathBuf),
}

impl FileSource {
    pub fn name(&self) -> String {
        match self {
            FileSource::Bytes { name, .. } => name.clone(),
            FileSource::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }

    pub async fn len(&self) -> Result<u64> {
        match self {
            FileSource::Bytes { data, .. } => Ok(data.len() as u64),
            FileSource::Path(path) => Ok(tokio::fs::metadata(path)
                .await
                .with_context(|| format!("reading metadata of {}", path.display()))?
                .len()),
        }
    }
}

// ── Reader ─────────────────────────────────────────────────────────────────────

/// Spawn a reader that prefetches `chunk_size` pieces into a bounded channel.
///
/// The reader stops early if the receiving side is dropped. A read error is
/// forwarded as the last item.
pub fn spawn_reader(
    source: FileSource,
    chunk_size: usize,
) -> (mpsc::Receiver<Result<Bytes>>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(SENDER_READ_AHEAD_CHUNKS);

    let handle = tokio::spawn(async move {
        match source {
            FileSource::Bytes { data, .. } => {
                let mut offset = 0;
                while offset < data.len() {
                    let end = (offset + chunk_size).min(data.len());
                    if tx.send(Ok(data.slice(offset..end))).await.is_err() {
                        return;
                    }
                    offset = end;
                }
            }
            FileSource::Path(path) => {
                let mut file = match tokio::fs::File::open(&path).await {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = tx
                            .send(Err(anyhow!(e).context(format!("opening {}", path.display()))))
                            .await;
                        return;
                    }
                };
                loop {
                    let mut buf = vec![0u8; chunk_size];
                    let mut filled = 0;
                    // Fill a whole chunk unless EOF comes first.
                    while filled < chunk_size {
                        match file.read(&mut buf[filled..]).await {
                            Ok(0) => break,
                            Ok(n) => filled += n,
                            Err(e) => {
                                let _ = tx.send(Err(e.into())).await;
                                return;
                            }
                        }
                    }
                    if filled == 0 {
                        return;
                    }
                    buf.truncate(filled);
                    if tx.send(Ok(Bytes::from(buf))).await.is_err() {
                        return;
                    }
                    if filled < chunk_size {
                        return;
                    }
                }
            }
        }
    });

    (rx, handle)
}

// ── Flow control ───────────────────────────────────────────────────────────────

/// Wait until `next_len` more bytes fit under `high_water`.
///
/// Retries without limit; only a closed channel or cancellation ends the wait.
pub async fn wait_for_buffer_space(
    channel: &dyn DataChannel,
    next_len: usize,
    high_water: usize,
    sos: &SignalOfStop,
) -> Result<()> {
    let mut delay = BACKPRESSURE_POLL_MIN;
    let mut announced = false;
    loop {
        if sos.cancelled() {
            bail!("transfer cancelled");
        }
        let state = channel.ready_state();
        if state != ChannelState::Open {
            bail!("channel '{}' closed during backpressure wait ({:?})", channel.label(), state);
        }
        let buffered = channel.buffered_amount().await;
        if buffered + next_len <= high_water {
            return Ok(());
        }
        if !announced {
            debug!(
                event = "backpressure",
                channel = %channel.label(),
                buffered,
                next = next_len,
                high_watermark = high_water,
                "Waiting for buffer to drain"
            );
            announced = true;
        }
        if sos.select(tokio::time::sleep(delay)).await.is_none() {
            bail!("transfer cancelled");
        }
        delay = (delay * 2).min(BACKPRESSURE_POLL_MAX);
    }
}

/// Wait for a freshly created channel to open.
pub async fn wait_for_open(channel: &dyn DataChannel, sos: &SignalOfStop) -> Result<()> {
    let mut delay = BACKPRESSURE_POLL_MIN;
    loop {
        match channel.ready_state() {
            ChannelState::Open => return Ok(()),
            ChannelState::Closing | ChannelState::Closed => {
                bail!("channel '{}' closed before opening", channel.label())
            }
            ChannelState::Connecting => {}
        }
        if sos.select(tokio::time::sleep(delay)).await.is_none() {
            bail!("transfer cancelled");
        }
        delay = (delay * 2).min(BACKPRESSURE_POLL_MAX);
    }
}

// ── Stream ─────────────────────────────────────────────────────────────────────

pub struct OutgoingStream {
    pub transfer: FileTransfer,
    pub channel: Arc<dyn DataChannel>,
    pub source: FileSource,
    pub chunk_size: usize,
    pub high_water: usize,
    pub sos: SignalOfStop,
    pub events: EventHub,
}

impl OutgoingStream {
    /// Stream every chunk, emitting progress after each one.
    ///
    /// Returns the final record and the SHA3-256 of the bytes sent. Once
    /// cancelled, no further progress is emitted.
    pub async fn run(self) -> Result<(FileTransfer, Digest256)> {
        let OutgoingStream {
            mut transfer,
            channel,
            source,
            chunk_size,
            high_water,
            sos,
            events,
        } = self;

        wait_for_open(channel.as_ref(), &sos).await?;
        info!(event = "transfer_stream_start", file_id = %transfer.file_id, size = transfer.total_size, channel = %channel.label());

        let (mut rx, reader) = spawn_reader(source, chunk_size);
        let mut hasher = TransferHasher::new();
        transfer.reset(now_ms());

        let result: Result<()> = async {
            while let Some(chunk) = rx.recv().await {
                let chunk = chunk?;
                if transfer.completed_size + chunk.len() as u64 > transfer.total_size {
                    bail!("source grew beyond the announced {} bytes", transfer.total_size);
                }
                wait_for_buffer_space(channel.as_ref(), chunk.len(), high_water, &sos).await?;
                channel
                    .send_binary(chunk.clone())
                    .await
                    .context("sending chunk")?;
                hasher.update(&chunk);
                transfer.advance(chunk.len() as u64, now_ms());

                if sos.cancelled() {
                    bail!("transfer cancelled");
                }
                events.emit(EngineEvent::TransferProgress {
                    transfer: transfer.clone(),
                    direction: TransferDirection::Outgoing,
                });
            }
            if transfer.completed_size != transfer.total_size {
                bail!(
                    "source ended after {} of {} bytes",
                    transfer.completed_size,
                    transfer.total_size
                );
            }
            Ok(())
        }
        .await;

        reader.abort();
        result?;
        Ok((transfer, hasher.finalize()))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("peermesh_test")
            .join("sender")
            .join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn cleanup(path: &std::path::Path) {
        let _ = std::fs::remove_dir_all(path);
    }

    /// Channel whose buffer drains by a fixed amount per poll.
    struct MeteredChannel {
        state: Mutex<(ChannelState, usize, usize, Vec<Bytes>)>,
        drain_per_poll: usize,
    }

    impl MeteredChannel {
        fn new(drain_per_poll: usize) -> Self {
            Self {
                state: Mutex::new((ChannelState::Open, 0, 0, Vec::new())),
                drain_per_poll,
            }
        }

        fn peak(&self) -> usize {
            self.state.lock().2
        }

        fn received(&self) -> Vec<Bytes> {
            self.state.lock().3.clone()
        }

        fn set_state(&self, state: ChannelState) {
            self.state.lock().0 = state;
        }
    }

    #[async_trait]
    impl DataChannel for MeteredChannel {
        fn label(&self) -> String {
            "file-test".into()
        }

        fn ready_state(&self) -> ChannelState {
            self.state.lock().0
        }

        async fn buffered_amount(&self) -> usize {
            let mut s = self.state.lock();
            s.1 = s.1.saturating_sub(self.drain_per_poll);
            s.1
        }

        async fn send_text(&self, _text: String) -> Result<()> {
            Ok(())
        }

        async fn send_binary(&self, data: Bytes) -> Result<()> {
            let mut s = self.state.lock();
            if s.0 != ChannelState::Open {
                bail!("closed");
            }
            s.1 += data.len();
            s.2 = s.2.max(s.1);
            s.3.push(data);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.set_state(ChannelState::Closed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn reader_produces_all_chunks_from_file() {
        let dir = test_dir("reader_all");
        let file_path = dir.join("test.bin");
        let data = vec![0xABu8; 4096 * 3 + 100];
        std::fs::write(&file_path, &data).unwrap();

        let (mut rx, _handle) = spawn_reader(FileSource::Path(file_path), 4096);
        let mut received = Vec::new();
        while let Some(chunk) = rx.recv().await {
            received.push(chunk.unwrap());
        }

        assert_eq!(received.len(), 4);
        assert_eq!(received.last().unwrap().len(), 100);
        assert_eq!(received.iter().map(|c| c.len()).sum::<usize>(), data.len());

        cleanup(&dir);
    }

    #[tokio::test]
    async fn reader_reports_missing_file() {
        let (mut rx, _handle) =
            spawn_reader(FileSource::Path(PathBuf::from("/nonexistent/peermesh.bin")), 1024);
        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_respects_high_water_mark() {
        let channel = Arc::new(MeteredChannel::new(6 * 1024));
        let data = Bytes::from((0..200_000u32).map(|i| i as u8).collect::<Vec<_>>());
        let transfer = FileTransfer::new("blob", data.len() as u64, "peer");
        let hub = EventHub::new();
        let mut events = hub.subscribe();

        let stream = OutgoingStream {
            transfer,
            channel: channel.clone(),
            source: FileSource::Bytes {
                name: "blob".into(),
                data: data.clone(),
            },
            chunk_size: 10 * 1024,
            high_water: 32 * 1024,
            sos: SignalOfStop::new(),
            events: hub,
        };
        let (done, digest) = stream.run().await.unwrap();

        assert_eq!(done.completed_size, data.len() as u64);
        assert_eq!(done.progress, 100.0);
        assert!(channel.peak() <= 32 * 1024);
        let sent: Vec<u8> = channel.received().iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(sent, data.to_vec());
        assert_eq!(digest, crate::utils::hash::sha3_256(&data));

        let mut last = 0.0;
        while let Ok(EngineEvent::TransferProgress { transfer, .. }) = events.try_recv() {
            assert!(transfer.progress >= last);
            last = transfer.progress;
        }
        assert_eq!(last, 100.0);
    }

    #[tokio::test]
    async fn closed_channel_aborts_wait() {
        let channel = MeteredChannel::new(0);
        channel.send_binary(Bytes::from(vec![0u8; 1000])).await.unwrap();
        let sos = SignalOfStop::new();

        let waiter = wait_for_buffer_space(&channel, 100, 1000, &sos);
        tokio::pin!(waiter);
        tokio::select! {
            _ = &mut waiter => panic!("should still be waiting"),
            _ = tokio::time::sleep(Duration::from_millis(30)) => {}
        }
        channel.set_state(ChannelState::Closed);
        assert!(waiter.await.is_err());
    }

    #[tokio::test]
    async fn cancellation_stops_stream_without_progress() {
        let channel = Arc::new(MeteredChannel::new(0));
        let hub = EventHub::new();
        let mut events = hub.subscribe();
        let sos = SignalOfStop::new();
        let data = Bytes::from(vec![7u8; 64 * 1024]);

        let stream = OutgoingStream {
            transfer: FileTransfer::new("x", data.len() as u64, "peer"),
            channel: channel.clone(),
            source: FileSource::Bytes { name: "x".into(), data },
            chunk_size: 8 * 1024,
            high_water: 16 * 1024,
            sos: sos.clone(),
            events: hub,
        };
        let handle = tokio::spawn(stream.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        sos.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        let mut progress = 0;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, EngineEvent::TransferProgress { .. }) {
                progress += 1;
            }
        }
        // Two chunks fit under the mark before the buffer stalls.
        assert_eq!(progress, 2);
    }
}
