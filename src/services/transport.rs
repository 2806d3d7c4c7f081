//! Outbound frame accumulator and inbound dispatch.
//!
//! Handlers never talk to the socket directly. They push [`OutboundFrame`]s
//! into the [`OutboundQueue`], and a single pump drains it into a
//! [`FrameSink`], one JSON line per frame.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::crypto::provider::Envelope;
use crate::error::{QuorumError, Result};
use crate::services::types::EncryptedMessage;

/// Wire frame. Sealed envelopes are spliced next to the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundFrame {
    Listen { inbox_addresses: Vec<String> },
    Direct(Envelope),
    Group(Envelope),
    Sync(Envelope),
}

impl OutboundFrame {
    pub fn listen(inbox_address: &str) -> Self {
        OutboundFrame::Listen {
            inbox_addresses: vec![inbox_address.to_string()],
        }
    }

    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::Listen { .. } => "listen",
            OutboundFrame::Direct(_) => "direct",
            OutboundFrame::Group(_) => "group",
            OutboundFrame::Sync(_) => "sync",
        }
    }
}

/// The socket side of the transport.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, line: String) -> Result<()>;
}

/// Receives raw inbound frames from the transport.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_encrypted(&self, message: EncryptedMessage) -> Result<()>;
}

/// Single FIFO accumulator of frames waiting for the socket.
#[derive(Default)]
pub struct OutboundQueue {
    frames: Mutex<VecDeque<OutboundFrame>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, frame: OutboundFrame) {
        self.frames.lock().await.push_back(frame);
    }

    pub async fn extend(&self, frames: impl IntoIterator<Item = OutboundFrame> + Send) {
        let mut queue = self.frames.lock().await;
        queue.extend(frames);
    }

    pub async fn len(&self) -> usize {
        self.frames.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.frames.lock().await.is_empty()
    }

    /// Snapshot of queued frames, oldest first.
    pub async fn pending(&self) -> Vec<OutboundFrame> {
        self.frames.lock().await.iter().cloned().collect()
    }

    /// Drain every queued frame into `sink` in order.
    ///
    /// On a failed write the unsent frame and everything behind it go back
    /// to the front of the queue and the error is returned.
    pub async fn flush(&self, sink: &dyn FrameSink) -> Result<usize> {
        let batch: Vec<OutboundFrame> = {
            let mut queue = self.frames.lock().await;
            queue.drain(..).collect()
        };

        let mut sent = 0;
        let mut iter = batch.into_iter();
        while let Some(frame) = iter.next() {
            let line = frame.to_line()?;
            if let Err(e) = sink.send(line).await {
                log::warn!("Outbound {} frame failed, re-queueing: {}", frame.kind(), e);
                let mut queue = self.frames.lock().await;
                let tail: Vec<OutboundFrame> = std::iter::once(frame).chain(iter).collect();
                for f in tail.into_iter().rev() {
                    queue.push_front(f);
                }
                return Err(e);
            }
            sent += 1;
        }
        if sent > 0 {
            log::debug!("Flushed {} outbound frames", sent);
        }
        Ok(sent)
    }
}

/// Feed inbound frames to `handler` one at a time until the channel closes.
///
/// Handler errors are logged and never stop the loop.
pub async fn run_inbound(
    mut rx: mpsc::Receiver<EncryptedMessage>,
    handler: Arc<dyn InboundHandler>,
) {
    while let Some(message) = rx.recv().await {
        let ts = message.timestamp;
        if let Err(e) = handler.handle_encrypted(message).await {
            log::warn!("Inbound message at {} not applied: {}", ts, e);
        }
    }
    log::info!("Inbound channel closed");
}

/// Periodically drain `queue` into `sink`.
pub async fn run_outbound(queue: Arc<OutboundQueue>, sink: Arc<dyn FrameSink>, interval_ms: u64) {
    loop {
        if let Err(e) = queue.flush(sink.as_ref()).await {
            log::warn!("Outbound flush interrupted: {}", e);
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(interval_ms)).await;
    }
}

/// Parse a stored envelope string back into its map form.
pub fn parse_envelope(raw: &str) -> Result<Envelope> {
    serde_json::from_str(raw).map_err(|e| QuorumError::Crypto(format!("parse envelope: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    fn sealed(tag: &str) -> Envelope {
        let mut map = Envelope::new();
        map.insert("envelope".into(), serde_json::Value::String(tag.into()));
        map
    }

    #[test]
    fn test_frame_wire_shape() {
        let listen = OutboundFrame::listen("QmInbox").to_line().unwrap();
        assert_eq!(listen, r#"{"type":"listen","inbox_addresses":["QmInbox"]}"#);

        let direct: serde_json::Value =
            serde_json::from_str(&OutboundFrame::Direct(sealed("e1")).to_line().unwrap()).unwrap();
        assert_eq!(direct["type"], "direct");
        assert_eq!(direct["envelope"], "e1");
    }

    #[tokio::test]
    async fn test_flush_preserves_fifo_order() {
        let queue = OutboundQueue::new();
        queue.push(OutboundFrame::listen("a")).await;
        queue
            .extend(vec![
                OutboundFrame::Group(sealed("g")),
                OutboundFrame::Sync(sealed("s")),
            ])
            .await;

        let mut sink = MockFrameSink::new();
        let mut seq = Sequence::new();
        for kind in ["listen", "group", "sync"] {
            sink.expect_send()
                .withf(move |line| line.contains(&format!(r#""type":"{}""#, kind)))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }

        assert_eq!(queue.flush(&sink).await.unwrap(), 3);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_write_requeues_tail() {
        let queue = OutboundQueue::new();
        queue.push(OutboundFrame::listen("a")).await;
        queue.push(OutboundFrame::Direct(sealed("d"))).await;
        queue.push(OutboundFrame::Group(sealed("g"))).await;

        let mut sink = MockFrameSink::new();
        let mut calls = 0;
        sink.expect_send().returning(move |_| {
            calls += 1;
            if calls == 2 {
                Err(QuorumError::Network("socket closed".into()))
            } else {
                Ok(())
            }
        });

        assert!(queue.flush(&sink).await.is_err());
        let left = queue.pending().await;
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].kind(), "direct");
        assert_eq!(left[1].kind(), "group");
    }

    struct Counting(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl InboundHandler for Counting {
        async fn handle_encrypted(&self, message: EncryptedMessage) -> Result<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if message.timestamp == 2 {
                return Err(QuorumError::Crypto("undecryptable".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_inbound_loop_survives_handler_errors() {
        let (tx, rx) = mpsc::channel(8);
        let handler = Arc::new(Counting(Default::default()));
        for ts in 1..=3 {
            tx.send(EncryptedMessage {
                inbox_address: "QmI".into(),
                encrypted_content: "{}".into(),
                timestamp: ts,
            })
            .await
            .unwrap();
        }
        drop(tx);
        run_inbound(rx, handler.clone()).await;
        assert_eq!(handler.0.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
