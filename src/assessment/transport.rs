//! Transport seam between a session and its client connection.
//!
//! The session never touches actix directly. The WebSocket actor feeds inbound frames
//! into a bounded channel and drains outbound commands from another one; the session sees
//! only [`FrameReceiver`] and [`FrameSender`]. Tests drive sessions through the same
//! channel-backed implementations.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One inbound frame, already stripped of WebSocket control traffic (ping/pong).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Text(String),
    Binary(Vec<u8>),
    /// The client sent a close frame
    Close(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Instructions for the connection owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCommand {
    Text(String),
    Close,
}

#[async_trait]
pub trait FrameReceiver: Send {
    /// Next inbound frame. `None` means the connection is gone.
    async fn recv(&mut self) -> Option<Result<TransportMessage, TransportError>>;
}

#[async_trait]
pub trait FrameSender: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn close(&mut self);
}

pub type InboundItem = Result<TransportMessage, TransportError>;

/// Inbound half backed by a bounded channel.
#[derive(Debug)]
pub struct ChannelReceiver {
    rx: mpsc::Receiver<InboundItem>,
}

impl ChannelReceiver {
    pub fn new(rx: mpsc::Receiver<InboundItem>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl FrameReceiver for ChannelReceiver {
    async fn recv(&mut self) -> Option<InboundItem> {
        self.rx.recv().await
    }
}

/// Outbound half backed by a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<OutboundCommand>,
}

impl ChannelSender {
    pub fn new(tx: mpsc::Sender<OutboundCommand>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FrameSender for ChannelSender {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(OutboundCommand::Text(text))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        // The owner may already be gone; nothing left to close then.
        let _ = self.tx.send(OutboundCommand::Close).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_receiver_reports_disconnect_as_none() {
        let (tx, rx) = mpsc::channel(4);
        let mut receiver = ChannelReceiver::new(rx);

        tx.send(Ok(TransportMessage::Binary(vec![1, 2]))).await.unwrap();
        drop(tx);

        assert_eq!(
            receiver.recv().await,
            Some(Ok(TransportMessage::Binary(vec![1, 2])))
        );
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_channel_sender_fails_once_owner_is_gone() {
        let (tx, rx) = mpsc::channel(4);
        let mut sender = ChannelSender::new(tx);
        drop(rx);

        assert_eq!(
            sender.send_text("{}".to_string()).await,
            Err(TransportError::Closed)
        );
        sender.close().await;
    }
}
