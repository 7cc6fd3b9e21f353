//! The per-connection read → route → write loop.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::App;
use super::dispatch::dispatch;
use crate::codec::http::{
    CodecError, INITIAL_BUF_SIZE, ReadOptions, WriteOptions, read_request, write_response,
};
use crate::http::{Method, Response};

/// Handles a single connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection, asks for
/// `Connection: close`, a handler closes it, or the per-connection request
/// cap is reached. Requests on one connection are handled strictly in order.
pub(crate) async fn serve_connection<S>(
    mut stream: S,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    app: Arc<App>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = &app.config;
    let peer_label = peer.map_or_else(|| "-".to_owned(), |p| p.to_string());
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    let mut served = 0usize;

    loop {
        let idle = if served == 0 {
            config.read_timeout()
        } else {
            config.keep_alive_timeout()
        };
        let read_opts = ReadOptions {
            max_payload: config.payload_max_length,
            idle_timeout: Some(idle),
            read_timeout: Some(config.read_timeout()),
        };

        let mut request = match read_request(&mut stream, &mut buf, read_opts).await {
            Ok(request) => request,
            Err(CodecError::Closed) => {
                debug!(peer = %peer_label, "connection closed by peer");
                break;
            }
            Err(CodecError::TimedOut) => {
                debug!(peer = %peer_label, served, "read timed out");
                break;
            }
            Err(e) => {
                warn!(peer = %peer_label, error = %e, "failed to read request");
                if let Some(status) = e.response_status() {
                    let mut res = Response::new(status).body(status.canonical_reason());
                    let opts = WriteOptions {
                        version: 1,
                        keep_alive: false,
                        head_only: false,
                    };
                    let _ = timeout(config.write_timeout(), write_response(&mut stream, &mut res, opts)).await;
                }
                break;
            }
        };

        served += 1;
        request.set_addrs(peer, local);
        let version = request.version();
        let head_only = *request.method() == Method::Head;
        let client_keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_label,
            method = %request.method(),
            path = request.path(),
            "dispatching request"
        );
        let mut response = dispatch(&app, request).await;

        let keep_alive = client_keep_alive
            && served < config.keep_alive_max_count
            && response.is_keep_alive();
        let opts = WriteOptions {
            version,
            keep_alive,
            head_only,
        };

        match timeout(config.write_timeout(), write_response(&mut stream, &mut response, opts)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => break,
            Ok(Err(e)) => {
                warn!(peer = %peer_label, error = %e, "failed to write response");
                break;
            }
            Err(_) => {
                warn!(peer = %peer_label, "write timed out");
                break;
            }
        }

        if !keep_alive {
            debug!(peer = %peer_label, "closing after response");
            break;
        }
    }

    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use crate::server::Server;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn spawn(server: Server) -> DuplexStream {
        let (client, conn) = tokio::io::duplex(64 * 1024);
        let app = Arc::new(server.into_app().unwrap());
        tokio::spawn(serve_connection(conn, None, None, app));
        client
    }

    async fn exchange(client: &mut DuplexStream, raw: &str) -> String {
        client.write_all(raw.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    fn hello_server() -> Server {
        let mut server = Server::new();
        server
            .get("/hi", |_ctx| async move { Ok(Response::new(StatusCode::Ok).body("hello")) })
            .get("/fail", |_ctx| async move { Err("nope".into()) });
        server
    }

    #[tokio::test]
    async fn keep_alive_serves_requests_in_order() {
        let mut client = spawn(hello_server());
        let out = exchange(
            &mut client,
            "GET /hi HTTP/1.1\r\nHost: x\r\n\r\nGET /missing HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;
        let first = out.find("200 OK").unwrap();
        let second = out.find("404 Not Found").unwrap();
        assert!(first < second);
        assert!(out.contains("Connection: keep-alive"));
    }

    #[tokio::test]
    async fn handler_failure_keeps_connection_alive() {
        let mut client = spawn(hello_server());
        let out = exchange(
            &mut client,
            "GET /fail HTTP/1.1\r\n\r\nGET /hi HTTP/1.1\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.ends_with("hello"));
    }

    #[tokio::test]
    async fn connection_close_is_honored() {
        let mut client = spawn(hello_server());
        let out = exchange(
            &mut client,
            "GET /hi HTTP/1.1\r\nConnection: close\r\n\r\nGET /hi HTTP/1.1\r\n\r\n",
        )
        .await;
        assert_eq!(out.matches("HTTP/1.1 200").count(), 1);
        assert!(out.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn request_cap_closes_connection() {
        let mut server = hello_server();
        server.set_keep_alive_max_count(2);
        let mut client = spawn(server);
        let out = exchange(&mut client, &"GET /hi HTTP/1.1\r\n\r\n".repeat(3)).await;
        assert_eq!(out.matches("HTTP/1.1 200").count(), 2);
        assert_eq!(out.matches("Connection: close").count(), 1);
    }

    #[tokio::test]
    async fn head_suppresses_body() {
        let mut client = spawn(hello_server());
        let out = exchange(&mut client, "HEAD /hi HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400_and_close() {
        let mut client = spawn(hello_server());
        let out = exchange(&mut client, "BROKEN\r\n\r\nGET /hi HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(!out.contains("hello"));
    }

    #[tokio::test]
    async fn oversize_body_gets_413() {
        let mut server = hello_server();
        server.set_payload_max_length(4);
        let mut client = spawn(server);
        let out = exchange(&mut client, "POST /hi HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789").await;
        assert!(out.starts_with("HTTP/1.1 413 "));
    }

    #[tokio::test]
    async fn http10_defaults_to_close() {
        let mut client = spawn(hello_server());
        let out = exchange(&mut client, "GET /hi HTTP/1.0\r\n\r\nGET /hi HTTP/1.0\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
        assert_eq!(out.matches("200 OK").count(), 1);
    }

    #[tokio::test]
    async fn content_provider_response() {
        let mut server = Server::new();
        server.get("/stream", |_ctx| async move {
            let mut res = Response::default();
            res.set_content_provider(6, "text/plain", |offset, _len| {
                (offset < 6).then(|| bytes::Bytes::from_static(b"abc"))
            });
            Ok(res)
        });
        let mut client = spawn(server);
        let out = exchange(&mut client, "GET /stream HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(out.contains("Content-Length: 6\r\n"));
        assert!(out.ends_with("\r\n\r\nabcabc"));
    }


    #[tokio::test]
    async fn handler_can_close_connection() {
        fn closing_server() -> Server {
            let mut server = hello_server();
            server
                .get("/bye", |_ctx| async move {
                    Ok(Response::new(StatusCode::Ok).body("bye").keep_alive(false))
                })
                .get("/drop", |_ctx| async move {
                    let mut res = Response::new(StatusCode::Ok).body("drop");
                    res.close_connection();
                    Ok(res)
                });
            server
        }

        for path in ["/bye", "/drop"] {
            let mut client = spawn(closing_server());
            let raw = format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\nGET /hi HTTP/1.1\r\nHost: x\r\n\r\n");
            let out = exchange(&mut client, &raw).await;
            assert_eq!(out.matches("HTTP/1.1 200").count(), 1, "{path}");
            assert!(out.contains("Connection: close\r\n"), "{path}");
            assert!(!out.contains("hello"), "{path}");
        }
    }

    #[tokio::test]
    async fn slow_upload_is_not_cut_off() {
        let mut server = Server::new();
        server
            .set_read_timeout(std::time::Duration::from_millis(200))
            .post("/upload", |ctx| async move {
                Ok(Response::new(StatusCode::Ok).body(format!("got {}", ctx.body().len())))
            });
        let mut client = spawn(server);
        client
            .write_all(b"POST /upload HTTP/1.1\r\nContent-Length: 6\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        for part in [&b"ab"[..], b"cd", b"ef"] {
            tokio::time::sleep(std::time::Duration::from_millis(120)).await;
            client.write_all(part).await.unwrap();
        }
        let out = exchange(&mut client, "").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("got 6"));
    }
}
