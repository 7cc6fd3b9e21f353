//! WebSocket sessions.
//!
//! Both roles share the same shape: one task reads frames and hands each
//! message to the `on_message` callback, while a writer task owns the sink
//! half of the stream and drains a queue fed by [`WebSocketConnection`]
//! handles. Sends therefore never block a callback and never interleave on
//! the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use crate::codec;

pub mod client;
pub mod server;

pub use client::WebSocketClient;
pub use server::WebSocketServer;

/// One complete WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketMessage {
    pub data: Bytes,
    pub is_binary: bool,
}

impl WebSocketMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(text.into()),
            is_binary: false,
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            is_binary: true,
        }
    }

    /// The payload as UTF-8, if it is valid.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Errors raised by WebSocket sessions.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("connect error: {0}")]
    Connect(#[source] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection is closed")]
    Closed,

    #[error("text message is not valid UTF-8")]
    InvalidText,

    #[error("transport error: {0}")]
    Transport(#[source] tungstenite::Error),
}

pub(crate) enum Outgoing {
    Message(WebSocketMessage),
    Close,
}

/// Handle to an open WebSocket session.
///
/// Cheap to clone; every clone talks to the same session. Handed to the
/// server callbacks and owned by [`WebSocketClient`].
#[derive(Debug, Clone)]
pub struct WebSocketConnection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
struct ConnectionInner {
    tx: mpsc::UnboundedSender<Outgoing>,
    open: AtomicBool,
    peer: Option<SocketAddr>,
}

impl WebSocketConnection {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Outgoing>, peer: Option<SocketAddr>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                tx,
                open: AtomicBool::new(true),
                peer,
            }),
        }
    }

    /// Queues one message. Text payloads must be valid UTF-8.
    pub fn send(&self, data: impl Into<Bytes>, is_binary: bool) -> Result<(), WsError> {
        let data = data.into();
        if !is_binary && std::str::from_utf8(&data).is_err() {
            return Err(WsError::InvalidText);
        }
        if !self.is_open() {
            return Err(WsError::Closed);
        }
        self.inner
            .tx
            .send(Outgoing::Message(WebSocketMessage { data, is_binary }))
            .map_err(|_| WsError::Closed)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), WsError> {
        self.send(Bytes::from(text.into()), false)
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), WsError> {
        self.send(data, true)
    }

    /// Starts the close handshake. Calling it again has no effect.
    pub fn close(&self) {
        if self.mark_closed() {
            let _ = self.inner.tx.send(Outgoing::Close);
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Flips the handle to closed; `true` if it was open.
    pub(crate) fn mark_closed(&self) -> bool {
        self.inner.open.swap(false, Ordering::AcqRel)
    }
}

/// Spawns the task that owns `sink` and writes queued messages in order.
///
/// Ends on [`Outgoing::Close`], on a write failure, or when every handle is
/// gone; the sink is closed on the way out, which sends the close frame.
pub(crate) fn spawn_writer<W>(mut sink: W, mut rx: mpsc::UnboundedReceiver<Outgoing>) -> JoinHandle<()>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(outgoing) = rx.recv().await {
            match outgoing {
                Outgoing::Message(message) => {
                    if let Err(e) = codec::ws::write_frame(&mut sink, &message).await {
                        debug!(error = %e, "websocket write failed");
                        break;
                    }
                }
                Outgoing::Close => break,
            }
        }
        if let Err(e) = sink.close().await {
            debug!(error = %e, "websocket close frame not sent");
        }
    })
}

/// Runs a user callback, logging instead of unwinding if it panics.
pub(crate) fn guarded<F: FnOnce()>(event: &'static str, f: F) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::error!(event, "websocket callback panicked");
    }
}
