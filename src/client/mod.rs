//! HTTP/1.1 client.
//!
//! [`Client::send`] is the only dispatch path; the `get`/`post`/… methods
//! just shape its arguments. A failed exchange is an `Err` with no status
//! to inspect, and nothing is ever retried.
//!
//! ```rust,no_run
//! use weblink::client::Client;
//! use weblink::http::Params;
//!
//! # async fn demo() -> Result<(), weblink::client::ClientError> {
//! let client = Client::new("localhost", 8080);
//! let res = client.get("/hi").await?;
//! println!("{} {}", res.status(), res.text());
//!
//! let form: Params = [("username", "testuser"), ("password", "secret")].into_iter().collect();
//! client.post_form("/login", &form).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::codec::http::{CodecError, INITIAL_BUF_SIZE, read_response, write_request};
use crate::config::{BasicAuth, ClientConfig, ProxyConfig};
use crate::http::{Headers, Method, Params, Request, Response};

/// Why a request produced no response.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid host {0:?}")]
    InvalidHost(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("gave up after {max} redirects")]
    TooManyRedirects { max: usize },

    #[error("cannot follow redirect to {0:?}")]
    InvalidLocation(String),
}

pub type ClientLogger = Arc<dyn Fn(&Request, &Response) + Send + Sync>;

struct Connection {
    stream: TcpStream,
    buf: BytesMut,
}

impl Connection {
    /// An idle connection is reusable while the server has neither closed
    /// it nor sent anything unasked.
    fn is_reusable(&self) -> bool {
        let mut scratch = [0u8; 1];
        self.buf.is_empty()
            && matches!(
                self.stream.try_read(&mut scratch),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
            )
    }
}

/// Sends requests to one `host:port`.
///
/// With keep-alive enabled the connection is cached and reused, one
/// exchange at a time; otherwise every request opens a fresh connection
/// and asks the server to close it.
pub struct Client {
    host: String,
    port: u16,
    config: ClientConfig,
    default_headers: Headers,
    logger: Option<ClientLogger>,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client for `host:port` with the default configuration.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_config(host, port, ClientConfig::default())
    }

    /// Creates a client for `host:port` using `config`.
    pub fn with_config(host: impl Into<String>, port: u16, config: ClientConfig) -> Self {
        Self {
            host: host.into(),
            port,
            config,
            default_headers: Headers::new(),
            logger: None,
            conn: Mutex::new(None),
        }
    }

    /// Parses `host` or `host:port` (port 80 when absent).
    pub fn from_host(host_port: &str) -> Result<Self, ClientError> {
        let invalid = || ClientError::InvalidHost(host_port.to_owned());
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
            None => (host_port, 80),
        };
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }

    /// The host requests are sent to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port requests are sent to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The configuration requests are sent with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Bounds establishing the TCP connection.
    pub fn set_connection_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.connection_timeout_ms = millis(timeout);
        self
    }

    /// Bounds reading one response.
    pub fn set_read_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.read_timeout_ms = millis(timeout);
        self
    }

    /// Bounds writing one request.
    pub fn set_write_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.write_timeout_ms = millis(timeout);
        self
    }

    /// Keeps the connection open between requests when the server allows it.
    pub fn set_keep_alive(&mut self, on: bool) -> &mut Self {
        self.config.keep_alive = on;
        self
    }

    /// Follows `3xx` redirects to the same host.
    pub fn set_follow_location(&mut self, on: bool) -> &mut Self {
        self.config.follow_location = on;
        self
    }

    /// Most redirects followed for one request.
    pub fn set_max_redirects(&mut self, max: usize) -> &mut Self {
        self.config.max_redirects = max;
        self
    }

    /// Sends `Authorization: Basic` with every request.
    pub fn set_basic_auth(&mut self, username: impl Into<String>, password: impl Into<String>) -> &mut Self {
        self.config.basic_auth = Some(BasicAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Sends `Authorization: Bearer` with every request.
    pub fn set_bearer_token(&mut self, token: impl Into<String>) -> &mut Self {
        self.config.bearer_token = Some(token.into());
        self
    }

    /// Sends every request through the forward proxy at `host:port`.
    pub fn set_proxy(&mut self, host: impl Into<String>, port: u16) -> &mut Self {
        self.config.proxy = Some(ProxyConfig {
            host: host.into(),
            port,
            basic_auth: None,
            bearer_token: None,
        });
        self
    }

    /// Credentials for the proxy. Has no effect until [`set_proxy`](Self::set_proxy).
    pub fn set_proxy_basic_auth(&mut self, username: impl Into<String>, password: impl Into<String>) -> &mut Self {
        if let Some(proxy) = &mut self.config.proxy {
            proxy.basic_auth = Some(BasicAuth {
                username: username.into(),
                password: password.into(),
            });
        }
        self
    }

    /// Bearer token for the proxy. Has no effect until [`set_proxy`](Self::set_proxy).
    pub fn set_proxy_bearer_token(&mut self, token: impl Into<String>) -> &mut Self {
        if let Some(proxy) = &mut self.config.proxy {
            proxy.bearer_token = Some(token.into());
        }
        self
    }

    /// Headers sent with every request; per-call headers of the same name win.
    pub fn set_default_headers(&mut self, headers: Headers) -> &mut Self {
        self.default_headers = headers;
        self
    }

    /// Observes every completed request/response pair.
    pub fn set_logger<F>(&mut self, logger: F) -> &mut Self
    where
        F: Fn(&Request, &Response) + Send + Sync + 'static,
    {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// Sends one request and waits for its response.
    ///
    /// Follows redirects when enabled. `Err` means there is no response at
    /// all: connecting, writing or reading failed, or timed out.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        headers: &Headers,
        body: impl Into<Bytes>,
    ) -> Result<Response, ClientError> {
        let mut method = method;
        let mut path = path.to_owned();
        let mut body = body.into();
        let mut headers = headers.clone();
        // Set once a redirect leaves this host.
        let mut elsewhere: Option<Client> = None;
        let mut redirects = 0;

        loop {
            let client = elsewhere.as_ref().unwrap_or(self);
            let response = client.exchange(&method, &path, &headers, &body).await?;

            if !self.config.follow_location || !is_followed_redirect(response.status()) {
                return Ok(response);
            }
            let Some(location) = response.get_header("location") else {
                return Ok(response);
            };
            if redirects == self.config.max_redirects {
                return Err(ClientError::TooManyRedirects {
                    max: self.config.max_redirects,
                });
            }
            redirects += 1;

            let status = response.status();
            if status == 303 || (matches!(status, 301 | 302) && !matches!(method, Method::Get | Method::Head)) {
                method = Method::Get;
                body = Bytes::new();
                headers.remove("content-type");
            }

            match parse_location(&path, location)? {
                Location::Path(next) => path = next,
                Location::Absolute { host, port, path: next } => {
                    path = next;
                    if host != client.host || port != client.port {
                        debug!(%host, port, "following redirect to another host");
                        let mut other = Client::with_config(host, port, self.config.clone());
                        other.default_headers = self.default_headers.clone();
                        other.logger = self.logger.clone();
                        elsewhere = Some(other);
                    }
                }
            }
        }
    }

    /// Sends a `GET` request.
    pub async fn get(&self, path: &str) -> Result<Response, ClientError> {
        self.send(Method::Get, path, &Headers::new(), Bytes::new()).await
    }

    /// Sends a `GET` request with extra headers.
    pub async fn get_with_headers(&self, path: &str, headers: &Headers) -> Result<Response, ClientError> {
        self.send(Method::Get, path, headers, Bytes::new()).await
    }

    /// Sends a `HEAD` request; the response has no body.
    pub async fn head(&self, path: &str) -> Result<Response, ClientError> {
        self.send(Method::Head, path, &Headers::new(), Bytes::new()).await
    }

    /// Sends a `POST` request with `body` as `content_type`.
    pub async fn post(&self, path: &str, body: impl Into<Bytes>, content_type: &str) -> Result<Response, ClientError> {
        self.send(Method::Post, path, &content_type_header(content_type), body).await
    }

    /// Sends a `POST` request; `headers` should carry the content type.
    pub async fn post_with_headers(
        &self,
        path: &str,
        headers: &Headers,
        body: impl Into<Bytes>,
    ) -> Result<Response, ClientError> {
        self.send(Method::Post, path, headers, body).await
    }

    /// POSTs `params` as `application/x-www-form-urlencoded`.
    pub async fn post_form(&self, path: &str, params: &Params) -> Result<Response, ClientError> {
        self.post(path, params.to_query_string(), "application/x-www-form-urlencoded")
            .await
    }

    /// Sends a `PUT` request with `body` as `content_type`.
    pub async fn put(&self, path: &str, body: impl Into<Bytes>, content_type: &str) -> Result<Response, ClientError> {
        self.send(Method::Put, path, &content_type_header(content_type), body).await
    }

    /// Sends a `PATCH` request with `body` as `content_type`.
    pub async fn patch(&self, path: &str, body: impl Into<Bytes>, content_type: &str) -> Result<Response, ClientError> {
        self.send(Method::Patch, path, &content_type_header(content_type), body).await
    }

    /// Sends a `DELETE` request.
    pub async fn delete(&self, path: &str) -> Result<Response, ClientError> {
        self.send(Method::Delete, path, &Headers::new(), Bytes::new()).await
    }

    /// Sends an `OPTIONS` request.
    pub async fn options(&self, path: &str) -> Result<Response, ClientError> {
        self.send(Method::Options, path, &Headers::new(), Bytes::new()).await
    }

    /// One request/response on this client's connection.
    async fn exchange(
        &self,
        method: &Method,
        path: &str,
        headers: &Headers,
        body: &Bytes,
    ) -> Result<Response, ClientError> {
        let headers = self.request_headers(headers);
        let target = match &self.config.proxy {
            Some(_) => format!("http://{}{}", self.host_header(), path),
            None => path.to_owned(),
        };

        let mut cached = self.conn.lock().await;
        let mut conn = match cached.take() {
            Some(conn) if conn.is_reusable() => conn,
            Some(_) => {
                debug!(host = %self.host, port = self.port, "idle connection closed by server, reconnecting");
                self.connect().await?
            }
            None => self.connect().await?,
        };

        let write_timeout = self.config.write_timeout();
        timeout(write_timeout, write_request(&mut conn.stream, method, &target, &headers, body))
            .await
            .map_err(|_| ClientError::Timeout {
                stage: "write",
                after: write_timeout,
            })??;

        let read_timeout = self.config.read_timeout();
        let is_head = *method == Method::Head;
        let response = timeout(
            read_timeout,
            read_response(&mut conn.stream, &mut conn.buf, is_head, self.config.payload_max_length),
        )
        .await
        .map_err(|_| ClientError::Timeout {
            stage: "read",
            after: read_timeout,
        })??;

        if self.config.keep_alive && response.is_keep_alive() {
            *cached = Some(conn);
        }
        drop(cached);

        if let Some(logger) = &self.logger {
            let mut request = Request::new(method.clone(), path);
            for (name, value) in headers.iter() {
                request = request.with_header(name, value);
            }
            logger(&request.with_body(body.clone()), &response);
        }
        Ok(response)
    }

    async fn connect(&self) -> Result<Connection, ClientError> {
        let (host, port) = match &self.config.proxy {
            Some(proxy) => (proxy.host.as_str(), proxy.port),
            None => (self.host.as_str(), self.port),
        };
        let connect_timeout = self.config.connection_timeout();
        let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ClientError::Timeout {
                stage: "connect",
                after: connect_timeout,
            })?
            .map_err(|e| ClientError::Connect {
                addr: format!("{host}:{port}"),
                source: e,
            })?;
        let _ = stream.set_nodelay(true);
        debug!(host, port, "connected");
        Ok(Connection {
            stream,
            buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
        })
    }

    fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Library headers first, then defaults, then the caller's; a later
    /// layer replaces every earlier value of the same name.
    fn request_headers(&self, caller: &Headers) -> Headers {
        let mut headers = Headers::new();
        headers.insert("Host", self.host_header());
        headers.insert("User-Agent", self.config.user_agent.as_str());
        if let Some(auth) = &self.config.basic_auth {
            headers.insert("Authorization", basic(auth));
        } else if let Some(token) = &self.config.bearer_token {
            headers.insert("Authorization", format!("Bearer {token}"));
        }
        if let Some(proxy) = &self.config.proxy {
            if let Some(auth) = &proxy.basic_auth {
                headers.insert("Proxy-Authorization", basic(auth));
            } else if let Some(token) = &proxy.bearer_token {
                headers.insert("Proxy-Authorization", format!("Bearer {token}"));
            }
        }
        let connection = if self.config.keep_alive { "keep-alive" } else { "close" };
        headers.insert("Connection", connection);

        for layer in [&self.default_headers, caller] {
            for (name, _) in layer.iter() {
                headers.remove(name);
            }
            headers.extend(layer.iter());
        }
        headers
    }
}

fn basic(auth: &BasicAuth) -> String {
    let encoded = BASE64.encode(format!("{}:{}", auth.username, auth.password));
    format!("Basic {encoded}")
}

fn content_type_header(content_type: &str) -> Headers {
    let mut headers = Headers::new();
    headers.insert("Content-Type", content_type);
    headers
}

fn is_followed_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

#[derive(Debug, PartialEq, Eq)]
enum Location {
    Path(String),
    Absolute { host: String, port: u16, path: String },
}

fn parse_location(current: &str, location: &str) -> Result<Location, ClientError> {
    let invalid = || ClientError::InvalidLocation(location.to_owned());

    let absolute = location
        .strip_prefix("http://")
        .or_else(|| location.strip_prefix("//"));
    if let Some(rest) = absolute {
        let (authority, path) = match rest.find(|c| c == '/' || c == '?') {
            Some(i) if rest[i..].starts_with('/') => (&rest[..i], rest[i..].to_owned()),
            Some(i) => (&rest[..i], format!("/{}", &rest[i..])),
            None => (rest, "/".to_owned()),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
            None => (authority, 80),
        };
        if host.is_empty() {
            return Err(invalid());
        }
        return Ok(Location::Absolute {
            host: host.to_owned(),
            port,
            path,
        });
    }
    if location.contains("://") {
        return Err(invalid());
    }
    if location.starts_with('/') {
        return Ok(Location::Path(location.to_owned()));
    }

    let current = current.split('?').next().unwrap_or_default();
    let dir = current.rfind('/').map_or("/", |i| &current[..=i]);
    Ok(Location::Path(format!("{dir}{location}")))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
