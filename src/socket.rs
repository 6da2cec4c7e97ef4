//! Transport seam between the connection hub and the underlying WebSocket.
//!
//! The hub's receive loop and send paths operate on the [`MessageSink`] /
//! [`MessageStream`] traits rather than on a concrete socket type, so the
//! same state machine runs against an axum WebSocket in production and a
//! channel-backed socket in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{self, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;

/// Normal-closure status code (RFC 6455 section 7.4.1).
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code for frame types the server does not accept.
pub const UNSUPPORTED_DATA: u16 = 1003;

/// Close reason used when the server initiates closure without one.
pub const DEFAULT_CLOSE_REASON: &str = "closed by the connection hub";

/// A close control frame: status code plus optional description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: NORMAL_CLOSURE,
            reason: reason.into(),
        }
    }
}

/// One unit of wire-level transmission as seen by the receive loop.
///
/// `end_of_message` marks whether a text frame completes a logical message.
/// The hub drops non-final fragments rather than reassembling them.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text {
        payload: String,
        end_of_message: bool,
    },
    Binary(Bytes),
    Close(Option<CloseFrame>),
}

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("websocket transport error: {0}")]
    Transport(String),
    #[error("connection is closed")]
    Closed,
}

/// Write half of a connection.
///
/// Shared: the accept loop, direct sends, and broadcasts all go through the
/// same sink. Implementations serialize concurrent writers internally so two
/// callers never interleave a frame on the wire.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Whether the connection is still believed open. Advisory only: the
    /// authoritative answer is the outcome of the next send.
    fn is_open(&self) -> bool;

    /// Transmit `text` as one complete, non-fragmented text frame.
    async fn send_text(&self, text: &str) -> Result<(), SocketError>;

    /// Transmit a close control frame and mark the connection closed.
    async fn send_close(&self, frame: CloseFrame) -> Result<(), SocketError>;

    /// Transmit a ping control frame (transport keep-alive).
    async fn send_ping(&self) -> Result<(), SocketError>;
}

/// Read half of a connection, exclusively owned by the accept loop.
#[async_trait]
pub trait MessageStream: Send {
    /// Wait for the next frame. `Ok(None)` means the stream ended.
    async fn next_frame(&mut self) -> Result<Option<Frame>, SocketError>;
}

/// Sink half of a split [`WebSocket`]. Writes go through an async mutex;
/// a send failure marks the connection not-open for all holders.
pub struct WsSink {
    tx: Mutex<SplitSink<WebSocket, ws::Message>>,
    open: Arc<AtomicBool>,
}

/// Stream half of a split [`WebSocket`].
pub struct WsStream {
    rx: SplitStream<WebSocket>,
    open: Arc<AtomicBool>,
}

/// Split an upgraded axum socket into hub-facing halves.
///
/// The open flag is shared between the halves: a close frame or error seen
/// by the stream is immediately visible to send attempts through the sink.
///
/// tungstenite reassembles fragmented messages before they surface here, so
/// frames produced by this stream always carry `end_of_message = true`.
pub fn split_socket(socket: WebSocket) -> (Arc<WsSink>, WsStream) {
    let (tx, rx) = socket.split();
    let open = Arc::new(AtomicBool::new(true));
    (
        Arc::new(WsSink {
            tx: Mutex::new(tx),
            open: open.clone(),
        }),
        WsStream { rx, open },
    )
}

#[async_trait]
impl MessageSink for WsSink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_text(&self, text: &str) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::Closed);
        }
        let mut tx = self.tx.lock().await;
        tx.send(ws::Message::Text(text.to_owned().into()))
            .await
            .map_err(|e| {
                self.open.store(false, Ordering::Release);
                SocketError::Transport(e.to_string())
            })
    }

    async fn send_close(&self, frame: CloseFrame) -> Result<(), SocketError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Err(SocketError::Closed);
        }
        let mut tx = self.tx.lock().await;
        tx.send(ws::Message::Close(Some(ws::CloseFrame {
            code: frame.code,
            reason: frame.reason.into(),
        })))
        .await
        .map_err(|e| SocketError::Transport(e.to_string()))
    }

    async fn send_ping(&self) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::Closed);
        }
        let mut tx = self.tx.lock().await;
        tx.send(ws::Message::Ping(Bytes::new())).await.map_err(|e| {
            self.open.store(false, Ordering::Release);
            SocketError::Transport(e.to_string())
        })
    }
}

#[async_trait]
impl MessageStream for WsStream {
    async fn next_frame(&mut self) -> Result<Option<Frame>, SocketError> {
        loop {
            match self.rx.next().await {
                Some(Ok(ws::Message::Text(text))) => {
                    return Ok(Some(Frame::Text {
                        payload: text.as_str().to_owned(),
                        end_of_message: true,
                    }));
                }
                Some(Ok(ws::Message::Binary(data))) => return Ok(Some(Frame::Binary(data))),
                Some(Ok(ws::Message::Close(frame))) => {
                    self.open.store(false, Ordering::Release);
                    return Ok(Some(Frame::Close(frame.map(|f| CloseFrame {
                        code: f.code,
                        reason: f.reason.as_str().to_owned(),
                    }))));
                }
                // Ping/pong are answered by the transport layer.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.open.store(false, Ordering::Release);
                    return Err(SocketError::Transport(e.to_string()));
                }
                None => {
                    self.open.store(false, Ordering::Release);
                    return Ok(None);
                }
            }
        }
    }
}
