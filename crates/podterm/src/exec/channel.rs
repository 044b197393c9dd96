//! Browser-side channel: a frame source, a frame sink and close.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;

use super::message::TerminalMessage;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("channel closed: {0}")]
    Closed(String),
}

/// Inbound half of a browser channel.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, `None` once the peer closed.
    async fn recv(&mut self) -> Option<Result<TerminalMessage, ChannelError>>;
}

/// Outbound half of a browser channel.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, message: TerminalMessage) -> Result<(), ChannelError>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), ChannelError>;
}

pub struct TerminalChannel {
    pub source: Box<dyn FrameSource>,
    pub sink: Box<dyn FrameSink>,
}

impl TerminalChannel {
    pub fn new(source: Box<dyn FrameSource>, sink: Box<dyn FrameSink>) -> Self {
        Self { source, sink }
    }

    pub fn from_websocket(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self::new(
            Box::new(WsFrameSource { stream }),
            Box::new(WsFrameSink { sink }),
        )
    }
}

struct WsFrameSource {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn recv(&mut self) -> Option<Result<TerminalMessage, ChannelError>> {
        loop {
            let parsed = match self.stream.next().await? {
                Ok(Message::Text(text)) => serde_json::from_str::<TerminalMessage>(text.as_str()),
                Ok(Message::Binary(data)) => serde_json::from_slice::<TerminalMessage>(&data),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(ChannelError::Closed(e.to_string()))),
            };
            return Some(parsed.map_err(|e| ChannelError::Malformed(e.to_string())));
        }
    }
}

struct WsFrameSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, message: TerminalMessage) -> Result<(), ChannelError> {
        let json =
            serde_json::to_string(&message).map_err(|e| ChannelError::Malformed(e.to_string()))?;
        self.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ChannelError::Closed(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), ChannelError> {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| ChannelError::Closed(e.to_string()))
    }
}

/// What the server wrote to an in-memory channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(TerminalMessage),
    Close(u16, String),
}

/// Browser end of an in-memory channel.
pub struct MemoryPeer {
    pub to_server: mpsc::UnboundedSender<Result<TerminalMessage, ChannelError>>,
    pub from_server: mpsc::UnboundedReceiver<Outbound>,
}

impl MemoryPeer {
    pub fn send(&self, message: TerminalMessage) -> bool {
        self.to_server.send(Ok(message)).is_ok()
    }

    pub async fn recv(&mut self) -> Option<Outbound> {
        self.from_server.recv().await
    }

    /// Next close frame, skipping data frames.
    pub async fn recv_close(&mut self) -> Option<(u16, String)> {
        while let Some(out) = self.from_server.recv().await {
            if let Outbound::Close(code, reason) = out {
                return Some((code, reason));
            }
        }
        None
    }
}

/// A channel backed by in-process queues, for embedding and tests.
pub fn memory_channel() -> (TerminalChannel, MemoryPeer) {
    let (to_server, inbound) = mpsc::unbounded_channel();
    let (outbound, from_server) = mpsc::unbounded_channel();
    let channel = TerminalChannel::new(
        Box::new(MemorySource { inbound }),
        Box::new(MemorySink { outbound }),
    );
    (
        channel,
        MemoryPeer {
            to_server,
            from_server,
        },
    )
}

struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Result<TerminalMessage, ChannelError>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<TerminalMessage, ChannelError>> {
        self.inbound.recv().await
    }
}

struct MemorySink {
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, message: TerminalMessage) -> Result<(), ChannelError> {
        self.outbound
            .send(Outbound::Frame(message))
            .map_err(|_| ChannelError::Closed("peer dropped".to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), ChannelError> {
        self.outbound
            .send(Outbound::Close(code, reason.to_string()))
            .map_err(|_| ChannelError::Closed("peer dropped".to_string()))
    }
}
