//! `RTCDataChannel` adapter. Transport callbacks become [`ConnectionEvent`]s.

use super::convert::channel_state;
use crate::core::connection::{ChannelMessage, ConnectionEvent, DataChannel, EventSink};
use crate::core::types::ChannelState;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{error, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

pub struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    /// Wrap `dc` and route its callbacks into `sink`.
    pub fn attach(dc: Arc<RTCDataChannel>, sink: &EventSink) -> Arc<Self> {
        let label = dc.label().to_string();

        let (s, l) = (sink.clone(), label.clone());
        dc.on_open(Box::new(move || {
            let (s, l) = (s.clone(), l.clone());
            Box::pin(async move {
                s.emit(ConnectionEvent::ChannelOpen { label: l });
            })
        }));

        let (s, l) = (sink.clone(), label.clone());
        dc.on_close(Box::new(move || {
            let (s, l) = (s.clone(), l.clone());
            Box::pin(async move {
                warn!(event = "dc_closed", channel = %l, "DataChannel closed by transport");
                s.emit(ConnectionEvent::ChannelClosed { label: l });
            })
        }));

        let (s, l) = (sink.clone(), label.clone());
        dc.on_error(Box::new(move |err| {
            let (s, l) = (s.clone(), l.clone());
            Box::pin(async move {
                error!(event = "dc_error", channel = %l, %err, "DataChannel transport error");
                s.emit(ConnectionEvent::ChannelError {
                    label: l,
                    reason: err.to_string(),
                });
            })
        }));

        let (s, l) = (sink.clone(), label);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let (s, l) = (s.clone(), l.clone());
            Box::pin(async move {
                let message = if msg.is_string {
                    ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    ChannelMessage::Binary(msg.data)
                };
                s.emit(ConnectionEvent::ChannelMessage { label: l, message });
            })
        }));

        Arc::new(Self { inner: dc })
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn ready_state(&self) -> ChannelState {
        channel_state(self.inner.ready_state())
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount().await
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.inner
            .send_text(text)
            .await
            .with_context(|| format!("sending text on '{}'", self.inner.label()))?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.inner
            .send(&data)
            .await
            .with_context(|| format!("sending {} bytes on '{}'", data.len(), self.inner.label()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await.context("closing data channel")
    }
}
