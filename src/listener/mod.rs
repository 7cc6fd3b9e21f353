//! TCP acceptor shared by the HTTP and WebSocket servers.
//!
//! # Responsibilities
//! - Bind the configured host and port
//! - Accept connections and spawn one task per connection
//! - Cap live connections with a semaphore (queue or reject beyond it)
//! - Stop accepting when the [`ServerHandle`] says so

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use crate::config::Admission;
use crate::router::RouteError;

/// Longest pause between retries while `accept` keeps failing.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid route: {0}")]
    Route(#[from] RouteError),
}

/// What a listener runs for each accepted connection.
pub trait Service: Send + Sync + 'static {
    /// Drives one connection until it ends. Failures are logged, not returned.
    fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> impl Future<Output = ()> + Send;

    /// Turns away a connection accepted while the server is full.
    fn reject(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> impl Future<Output = ()> + Send;
}

/// Remote control for a server: stop it and ask whether it is accepting.
///
/// Cheap to clone. Obtain it before starting the server, since `listen`
/// does not return until the server stops.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    running: AtomicBool,
    stop: watch::Sender<bool>,
}

impl Default for ServerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandle {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner {
                running: AtomicBool::new(false),
                stop,
            }),
        }
    }

    /// Closes the acceptor. Connections already being served run until
    /// their streams end.
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);
    }

    /// `true` while the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn arm(&self) {
        self.inner.stop.send_replace(false);
    }

    fn set_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::Release);
    }
}

/// A bound socket plus the service that handles its connections.
pub struct Listener<S> {
    inner: TcpListener,
    local_addr: SocketAddr,
    service: Arc<S>,
    connection_limit: Arc<Semaphore>,
    admission: Admission,
    handle: ServerHandle,
}

impl<S: Service> Listener<S> {
    /// Binds `host:port`. Port `0` picks a free port; see [`local_addr`](Self::local_addr).
    ///
    /// A stop requested on `handle` before this call is forgotten.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the address cannot be resolved or bound.
    pub async fn bind(
        host: &str,
        port: u16,
        service: S,
        max_connections: usize,
        admission: Admission,
        handle: ServerHandle,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| ServerError::Bind {
                addr: format!("{host}:{port}"),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        let max_connections = max_connections.max(1);

        info!(
            address = %local_addr,
            max_connections,
            ?admission,
            "listener bound"
        );
        handle.arm();

        Ok(Self {
            inner: listener,
            local_addr,
            service: Arc::new(service),
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            admission,
            handle,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    /// Accepts connections until [`ServerHandle::stop`] is called.
    ///
    /// Accept failures are logged and retried after a growing pause, so
    /// running out of file descriptors does not spin the loop.
    pub async fn run(self) -> Result<(), ServerError> {
        let mut stop = self.handle.inner.stop.subscribe();
        self.handle.set_running(true);
        info!(address = %self.local_addr, "listening");

        let mut failures = 0u32;
        loop {
            // In queue mode the slot is taken before accepting, so excess
            // peers wait in the kernel backlog.
            let queued = match self.admission {
                Admission::Queue => tokio::select! {
                    _ = stop.wait_for(|stopped| *stopped) => break,
                    permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                Admission::Reject => None,
            };

            let accepted = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                accepted = self.inner.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => {
                    failures = 0;
                    pair
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let pause = accept_backoff(failures);
                    warn!(error = %e, failures, retry_in = ?pause, "failed to accept connection");
                    drop(queued);
                    tokio::select! {
                        _ = stop.wait_for(|stopped| *stopped) => break,
                        _ = tokio::time::sleep(pause) => continue,
                    }
                }
            };

            let permit = match queued {
                Some(permit) => permit,
                None => match Arc::clone(&self.connection_limit).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(peer = %peer, "connection limit reached, rejecting");
                        let service = Arc::clone(&self.service);
                        tokio::spawn(service.reject(stream, peer));
                        continue;
                    }
                },
            };

            debug!(
                peer = %peer,
                available_permits = self.connection_limit.available_permits(),
                "connection accepted"
            );
            let service = Arc::clone(&self.service);
            tokio::spawn(async move {
                // Held until the connection ends.
                let _permit = permit;
                service.serve(stream, peer).await;
            });
        }

        self.handle.set_running(false);
        info!(address = %self.local_addr, "listener stopped");
        Ok(())
    }
}

/// Pause after the `failures`-th consecutive accept error: 5 ms, doubling,
/// capped at [`ACCEPT_BACKOFF_MAX`].
fn accept_backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(10);
    Duration::from_millis(5)
        .saturating_mul(1 << doublings)
        .min(ACCEPT_BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Greets, then holds the connection until the peer hangs up.
    struct Greeter;

    impl Service for Greeter {
        async fn serve(self: Arc<Self>, mut stream: TcpStream, _peer: SocketAddr) {
            let _ = stream.write_all(b"hello").await;
            let mut sink = [0u8; 16];
            while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
        }

        async fn reject(self: Arc<Self>, mut stream: TcpStream, _peer: SocketAddr) {
            let _ = stream.write_all(b"busy").await;
        }
    }

    async fn start(max: usize, admission: Admission) -> (SocketAddr, ServerHandle) {
        let handle = ServerHandle::new();
        let listener = Listener::bind("127.0.0.1", 0, Greeter, max, admission, handle.clone())
            .await
            .unwrap();
        let addr = listener.local_addr();
        tokio::spawn(listener.run());
        (addr, handle)
    }

    async fn read_some(stream: &mut TcpStream) -> String {
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn reject_mode_turns_away_excess() {
        let (addr, handle) = start(1, Admission::Reject).await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        assert_eq!(read_some(&mut first).await, "hello");

        let mut second = TcpStream::connect(addr).await.unwrap();
        assert_eq!(read_some(&mut second).await, "busy");
        handle.stop();
    }

    #[tokio::test]
    async fn queue_mode_waits_for_a_slot() {
        let (addr, handle) = start(1, Admission::Queue).await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        assert_eq!(read_some(&mut first).await, "hello");

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let waited = tokio::time::timeout(Duration::from_millis(200), second.read(&mut buf)).await;
        assert!(waited.is_err(), "second connection served while the first was live");

        drop(first);
        assert_eq!(read_some(&mut second).await, "hello");
        handle.stop();
    }

    #[tokio::test]
    async fn stop_ends_the_accept_loop() {
        let handle = ServerHandle::new();
        let listener = Listener::bind("127.0.0.1", 0, Greeter, 8, Admission::Queue, handle.clone())
            .await
            .unwrap();
        let task = tokio::spawn(listener.run());

        while !handle.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = Listener::bind("127.0.0.1", port, Greeter, 1, Admission::Queue, ServerHandle::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[test]
    fn accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(1), Duration::from_millis(5));
        assert_eq!(accept_backoff(2), Duration::from_millis(10));
        assert_eq!(accept_backoff(4), Duration::from_millis(40));
        assert_eq!(accept_backoff(8), Duration::from_millis(640));
        assert_eq!(accept_backoff(9), ACCEPT_BACKOFF_MAX);
        assert_eq!(accept_backoff(u32::MAX), ACCEPT_BACKOFF_MAX);
    }
}
