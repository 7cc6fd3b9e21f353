//! WebSocket server: one session task per accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{WebSocketConnection, WebSocketMessage, guarded, spawn_writer};
use crate::codec::ws::{accept_upgrade, read_frame};
use crate::config::{Admission, ServerConfig};
use crate::listener::{Listener, ServerError, ServerHandle, Service};

/// How long a finished session waits for its queued writes and close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub type OpenHandler = Arc<dyn Fn(&WebSocketConnection) + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(&WebSocketConnection, &WebSocketMessage) + Send + Sync>;
pub type CloseHandler = Arc<dyn Fn(&WebSocketConnection) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&WebSocketConnection, &str) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    on_open: Option<OpenHandler>,
    on_message: Option<MessageHandler>,
    on_close: Option<CloseHandler>,
    on_error: Option<ErrorHandler>,
}

/// Accepts WebSocket upgrades and runs each session on its own task.
///
/// # Examples
///
/// ```rust,no_run
/// use weblink::ws::WebSocketServer;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut server = WebSocketServer::new();
///     server.on_message(|conn, msg| {
///         let text = msg.as_text().unwrap_or_default();
///         let _ = conn.send_text(format!("Echo: {text}"));
///     });
///     server.listen("127.0.0.1", 9002).await?;
///     Ok(())
/// }
/// ```
pub struct WebSocketServer {
    callbacks: Callbacks,
    config: ServerConfig,
    handle: ServerHandle,
}

impl Default for WebSocketServer {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketServer {
    /// Creates a server with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// `read_timeout_ms` bounds the upgrade handshake; the connection caps
    /// apply as for HTTP.
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            callbacks: Callbacks::default(),
            config,
            handle: ServerHandle::new(),
        }
    }

    /// Runs once per session, after the upgrade.
    pub fn on_open<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&WebSocketConnection) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Runs for every message, in arrival order.
    pub fn on_message<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&WebSocketConnection, &WebSocketMessage) + Send + Sync + 'static,
    {
        self.callbacks.on_message = Some(Arc::new(f));
        self
    }

    /// Runs once per session, after it has ended.
    pub fn on_close<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&WebSocketConnection) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Called at most once per session, for a read failure that was not an
    /// orderly close and not caused by a local `close()`.
    pub fn on_error<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&WebSocketConnection, &str) + Send + Sync + 'static,
    {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    /// Caps live sessions; connections over the cap are queued or dropped.
    pub fn set_max_connections(&mut self, max: usize, admission: Admission) -> &mut Self {
        self.config.max_connections = max;
        self.config.admission = admission;
        self
    }

    /// A handle that can stop this server once it is listening.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Stops accepting. Open sessions run until they close.
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Binds `host:port`; port `0` picks a free one.
    pub async fn bind(self, host: &str, port: u16) -> Result<BoundWebSocketServer, ServerError> {
        let service = WsService {
            handshake_timeout: self.config.read_timeout(),
            callbacks: self.callbacks,
        };
        let listener = Listener::bind(
            host,
            port,
            service,
            self.config.max_connections,
            self.config.admission,
            self.handle,
        )
        .await?;
        Ok(BoundWebSocketServer { listener })
    }

    /// Binds and serves until [`ServerHandle::stop`] is called.
    pub async fn listen(self, host: &str, port: u16) -> Result<(), ServerError> {
        self.bind(host, port).await?.run().await
    }
}

/// A [`WebSocketServer`] whose socket is bound but not yet accepting.
pub struct BoundWebSocketServer {
    listener: Listener<WsService>,
}

impl BoundWebSocketServer {
    /// The address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// A handle that can stop this server once it is listening.
    pub fn handle(&self) -> ServerHandle {
        self.listener.handle().clone()
    }

    /// Accepts sessions until stopped.
    pub async fn run(self) -> Result<(), ServerError> {
        self.listener.run().await
    }
}

pub(crate) struct WsService {
    callbacks: Callbacks,
    handshake_timeout: Duration,
}

impl Service for WsService {
    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        run_session(stream, Some(peer), &self.callbacks, self.handshake_timeout).await;
    }

    async fn reject(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "dropping websocket connection over the limit");
        drop(stream);
    }
}

/// Drives one session: upgrade, `on_open`, read loop, `on_close`.
pub(crate) async fn run_session<S>(
    stream: S,
    peer: Option<SocketAddr>,
    callbacks: &Callbacks,
    handshake_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer_label = peer.map_or_else(|| "-".to_owned(), |p| p.to_string());
    let ws = match timeout(handshake_timeout, accept_upgrade(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!(peer = %peer_label, error = %e, "websocket upgrade failed");
            return;
        }
        Err(_) => {
            warn!(peer = %peer_label, "websocket upgrade timed out");
            return;
        }
    };

    let (sink, mut source) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = WebSocketConnection::new(tx, peer);
    let mut writer = spawn_writer(sink, rx);
    info!(peer = %peer_label, "websocket session opened");

    if let Some(on_open) = &callbacks.on_open {
        guarded("open", || on_open(&conn));
    }

    while conn.is_open() {
        match read_frame(&mut source).await {
            Ok(Some(message)) => {
                if let Some(on_message) = &callbacks.on_message {
                    guarded("message", || on_message(&conn, &message));
                }
            }
            Ok(None) => {
                debug!(peer = %peer_label, "websocket closed by peer");
                break;
            }
            Err(e) => {
                // A failure after a local close is the close itself.
                if conn.is_open() {
                    warn!(peer = %peer_label, error = %e, "websocket read failed");
                    if let Some(on_error) = &callbacks.on_error {
                        let reason = e.to_string();
                        guarded("error", || on_error(&conn, &reason));
                    }
                }
                break;
            }
        }
    }

    conn.close();
    if timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(peer = %peer_label, "websocket session closed");

    if let Some(on_close) = &callbacks.on_close {
        guarded("close", || on_close(&conn));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ws::{handshake, write_frame};
    use std::sync::Mutex;

    fn recorder() -> (Callbacks, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut server = WebSocketServer::new();
        let (a, b, c, d) = (
            Arc::clone(&events),
            Arc::clone(&events),
            Arc::clone(&events),
            Arc::clone(&events),
        );
        server
            .on_open(move |_| a.lock().unwrap().push("open".to_owned()))
            .on_message(move |conn, msg| {
                let text = msg.as_text().unwrap_or_default().to_owned();
                b.lock().unwrap().push(format!("message:{text}"));
                if text == "bye" {
                    conn.close();
                } else {
                    conn.send_text(format!("Echo: {text}")).unwrap();
                }
            })
            .on_close(move |_| c.lock().unwrap().push("close".to_owned()))
            .on_error(move |_, e| d.lock().unwrap().push(format!("error:{e}")));
        (server.callbacks, events)
    }

    #[tokio::test]
    async fn echo_session_lifecycle() {
        let (callbacks, events) = recorder();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move {
            run_session(server_io, None, &callbacks, Duration::from_secs(5)).await;
        });

        let mut ws = handshake(client_io, "localhost", "/").await.unwrap();
        write_frame(&mut ws, &WebSocketMessage::text("Test Message")).await.unwrap();
        let reply = read_frame(&mut ws).await.unwrap().unwrap();
        assert_eq!(reply.as_text(), Some("Echo: Test Message"));
        ws.close(None).await.unwrap();
        while read_frame(&mut ws).await.unwrap_or(None).is_some() {}

        session.await.unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec!["open", "message:Test Message", "close"]
        );
    }

    #[tokio::test]
    async fn close_from_callback_ends_session_without_error() {
        let (callbacks, events) = recorder();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move {
            run_session(server_io, None, &callbacks, Duration::from_secs(5)).await;
        });

        let mut ws = handshake(client_io, "localhost", "/").await.unwrap();
        write_frame(&mut ws, &WebSocketMessage::text("bye")).await.unwrap();
        assert!(read_frame(&mut ws).await.unwrap_or(None).is_none());

        session.await.unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["open", "message:bye", "close"]);
    }

    #[tokio::test]
    async fn abrupt_disconnect_reports_error_once() {
        let (callbacks, events) = recorder();
        let (client_io, server_io) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move {
            run_session(server_io, None, &callbacks, Duration::from_secs(5)).await;
        });

        let ws = handshake(client_io, "localhost", "/").await.unwrap();
        drop(ws);

        session.await.unwrap();
        let events = events.lock().unwrap();
        assert_eq!(events.first().map(String::as_str), Some("open"));
        assert_eq!(events.last().map(String::as_str), Some("close"));
        assert_eq!(events.iter().filter(|e| e.starts_with("error:")).count(), 1);
    }

    #[tokio::test]
    async fn failed_upgrade_skips_callbacks() {
        use tokio::io::AsyncWriteExt;

        let (callbacks, events) = recorder();
        let (mut client_io, server_io) = tokio::io::duplex(4096);
        client_io.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        run_session(server_io, None, &callbacks, Duration::from_secs(1)).await;
        assert!(events.lock().unwrap().is_empty());
    }
}
