//! WebSocket client with a background receive loop.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{WebSocketConnection, WebSocketMessage, WsError, guarded, spawn_writer};
use crate::codec::ws::{handshake, read_frame};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type Callback = Arc<dyn Fn() + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&WebSocketMessage) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
struct Callbacks {
    on_open: Option<Callback>,
    on_message: Option<MessageCallback>,
    on_close: Option<Callback>,
    on_error: Option<ErrorCallback>,
}

impl Callbacks {
    fn error(&self, reason: &str) {
        if let Some(on_error) = &self.on_error {
            guarded("error", || on_error(reason));
        }
    }
}

struct Session {
    conn: WebSocketConnection,
    receiver: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Client end of a WebSocket session.
///
/// Messages are delivered to `on_message` from a background task in the
/// order they arrive. [`close`](Self::close) waits for that task before
/// running `on_close`, so no message callback runs after it.
///
/// Dropping a connected client stops the receive loop without running
/// `on_close`; call [`close`](Self::close) first when that callback matters.
///
/// # Examples
///
/// ```rust,no_run
/// use weblink::ws::WebSocketClient;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut client = WebSocketClient::new("127.0.0.1", 9002, "/");
///     client.on_message(|msg| println!("{:?}", msg.as_text()));
///     client.connect().await?;
///     client.send_text("Test Message")?;
///     client.close().await;
///     Ok(())
/// }
/// ```
pub struct WebSocketClient {
    host: String,
    port: u16,
    path: String,
    callbacks: Callbacks,
    connect_timeout: Duration,
    close_timeout: Duration,
    session: Option<Session>,
}

impl WebSocketClient {
    /// Creates a client for `ws://host:port/path`. Nothing connects until [`connect`](Self::connect).
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            callbacks: Callbacks::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            session: None,
        }
    }

    /// Runs once the handshake has completed.
    pub fn on_open<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Runs for every text or binary message, in arrival order.
    pub fn on_message<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&WebSocketMessage) + Send + Sync + 'static,
    {
        self.callbacks.on_message = Some(Arc::new(f));
        self
    }

    /// Runs when [`close`](Self::close) finishes.
    pub fn on_close<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Runs for a failed connect or a broken session, at most once per session.
    pub fn on_error<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    /// Bounds TCP connect and handshake together.
    pub fn set_connect_timeout(&mut self, after: Duration) -> &mut Self {
        self.connect_timeout = after;
        self
    }

    /// How long [`close`](Self::close) waits for the background tasks.
    pub fn set_close_timeout(&mut self, after: Duration) -> &mut Self {
        self.close_timeout = after;
        self
    }

    /// Opens the session, runs `on_open`, then starts the receive loop.
    ///
    /// A failure is reported to `on_error` as well as returned. Calling this
    /// while connected does nothing.
    pub async fn connect(&mut self) -> Result<(), WsError> {
        if self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = self.session.take() {
            stale.receiver.abort();
            stale.writer.abort();
        }

        let ws = match timeout(self.connect_timeout, self.open_stream()).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => return Err(self.connect_failed(e)),
            Err(_) => return Err(self.connect_failed(WsError::Timeout(self.connect_timeout))),
        };

        let (sink, mut source) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = WebSocketConnection::new(tx, None);
        let writer = spawn_writer(sink, rx);
        info!(host = %self.host, port = self.port, path = %self.path, "websocket connected");

        if let Some(on_open) = &self.callbacks.on_open {
            guarded("open", || on_open());
        }

        let callbacks = self.callbacks.clone();
        let loop_conn = conn.clone();
        let receiver = tokio::spawn(async move {
            while loop_conn.is_open() {
                match read_frame(&mut source).await {
                    Ok(Some(message)) => {
                        // Nothing is delivered once a close was requested.
                        if !loop_conn.is_open() {
                            break;
                        }
                        if let Some(on_message) = &callbacks.on_message {
                            guarded("message", || on_message(&message));
                        }
                    }
                    Ok(None) => {
                        debug!("websocket closed by peer");
                        break;
                    }
                    Err(e) => {
                        if loop_conn.is_open() {
                            warn!(error = %e, "websocket read failed");
                            callbacks.error(&e.to_string());
                        }
                        break;
                    }
                }
            }
            loop_conn.close();
        });

        self.session = Some(Session {
            conn,
            receiver,
            writer,
        });
        Ok(())
    }

    async fn open_stream(
        &self,
    ) -> Result<tokio_tungstenite::WebSocketStream<TcpStream>, WsError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(WsError::Connect)?;
        let _ = stream.set_nodelay(true);
        handshake(stream, &self.host_header(), &self.path).await
    }

    fn connect_failed(&self, e: WsError) -> WsError {
        warn!(host = %self.host, port = self.port, error = %e, "websocket connect failed");
        let reason = match &e {
            WsError::Connect(_) => e.to_string(),
            other => format!("connect error: {other}"),
        };
        self.callbacks.error(&reason);
        e
    }

    fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Queues one message on the open session.
    pub fn send(&self, data: impl Into<bytes::Bytes>, is_binary: bool) -> Result<(), WsError> {
        match &self.session {
            Some(session) => session.conn.send(data, is_binary),
            None => Err(WsError::Closed),
        }
    }

    /// Queues a text message.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), WsError> {
        self.send(bytes::Bytes::from(text.into()), false)
    }

    /// Queues a binary message.
    pub fn send_binary(&self, data: impl Into<bytes::Bytes>) -> Result<(), WsError> {
        self.send(data, true)
    }

    /// Whether a session is open.
    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.conn.is_open())
    }

    /// Closes the session and waits for the receive loop, then runs
    /// `on_close`. Does nothing when no session exists.
    pub async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.conn.close();

        if timeout(self.close_timeout, &mut session.receiver).await.is_err() {
            debug!("receive loop did not finish in time");
            session.receiver.abort();
            let _ = (&mut session.receiver).await;
        }
        if timeout(self.close_timeout, &mut session.writer).await.is_err() {
            session.writer.abort();
        }
        info!(host = %self.host, port = self.port, "websocket closed");

        if let Some(on_close) = &self.callbacks.on_close {
            guarded("close", || on_close());
        }
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.conn.close();
            session.receiver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::WebSocketServer;
    use std::sync::Mutex;

    async fn echo_server() -> (std::net::SocketAddr, crate::listener::ServerHandle) {
        let mut server = WebSocketServer::new();
        server.on_message(|conn, msg| {
            let text = msg.as_text().unwrap_or_default();
            let _ = conn.send_text(format!("Echo: {text}"));
        });
        let bound = server.bind("127.0.0.1", 0).await.unwrap();
        let addr = bound.local_addr();
        let handle = bound.handle();
        tokio::spawn(bound.run());
        (addr, handle)
    }

    #[tokio::test]
    async fn echo_round_trip_and_ordered_close() {
        let (addr, handle) = echo_server().await;
        let events = Arc::new(Mutex::new(Vec::<String>::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut client = WebSocketClient::new("127.0.0.1", addr.port(), "/");
        let (a, b, c) = (Arc::clone(&events), Arc::clone(&events), Arc::clone(&events));
        client
            .on_open(move || a.lock().unwrap().push("open".to_owned()))
            .on_message(move |msg| {
                let text = msg.as_text().unwrap_or_default().to_owned();
                b.lock().unwrap().push(text.clone());
                let _ = tx.send(text);
            })
            .on_close(move || c.lock().unwrap().push("close".to_owned()));

        client.connect().await.unwrap();
        assert!(client.is_connected());
        client.send_text("Test Message").unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("Echo: Test Message"));

        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["open", "Echo: Test Message", "close"]
        );
        assert!(matches!(client.send_text("late"), Err(WsError::Closed)));
        handle.stop();
    }

    #[tokio::test]
    async fn connect_failure_reports_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let errors = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&errors);
        let mut client = WebSocketClient::new("127.0.0.1", port, "/");
        client.on_error(move |e| sink.lock().unwrap().push(e.to_owned()));

        assert!(client.connect().await.is_err());
        assert!(!client.is_connected());
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("connect error:"));
    }

    #[test]
    fn host_header_omits_default_port() {
        assert_eq!(WebSocketClient::new("example.com", 80, "/").host_header(), "example.com");
        assert_eq!(
            WebSocketClient::new("example.com", 9002, "/").host_header(),
            "example.com:9002"
        );
    }
}
