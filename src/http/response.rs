//! HTTP/1.1 response model.
//!
//! Provides a fluent builder API for handlers, in-place mutators for the
//! routing hooks, and head serialization used by [`crate::codec::http`].

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::{Headers, StatusCode};

/// Produces response content on demand.
///
/// Called with `(offset, max_len)` for increasing offsets; returns the next
/// chunk, or `None` when there is no more data. Runs synchronously on the
/// connection's task while the response is written.
pub type ContentProvider = Box<dyn FnMut(usize, usize) -> Option<Bytes> + Send>;

pub(crate) struct ContentSource {
    pub(crate) length: usize,
    pub(crate) provider: ContentProvider,
}

impl fmt::Debug for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentSource")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// An HTTP/1.1 response.
///
/// # Examples
///
/// ```
/// use weblink::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// assert_eq!(response.status(), 200);
/// assert_eq!(response.get_header("content-type"), Some("application/json"));
/// assert_eq!(response.content().len(), 15);
/// ```
#[derive(Debug)]
pub struct Response {
    status: u16,
    /// HTTP minor version the response was received with (client side).
    version: u8,
    headers: Headers,
    body: Bytes,
    content: Option<ContentSource>,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: impl Into<u16>) -> Self {
        Self {
            status: status.into(),
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
            content: None,
            keep_alive: true,
        }
    }

    /// A `200 OK` response carrying `value` serialized as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(StatusCode::Ok)
            .header("Content-Type", "application/json")
            .body_bytes(body))
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by the codec.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    ///
    /// `false` closes the connection after this response even if the client asked to keep it.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn set_status(&mut self, status: impl Into<u16>) {
        self.status = status.into();
    }

    /// Appends a header in-place. Intended for routing hooks that receive
    /// a `Response` and need to decorate it without consuming it.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Replaces the body and sets `Content-Type`, dropping any content provider.
    pub fn set_content(&mut self, body: impl Into<Bytes>, content_type: &str) {
        self.body = body.into();
        self.content = None;
        self.headers.set("Content-Type", content_type);
    }

    /// Serves `length` bytes produced by `provider` instead of a pre-built body.
    pub fn set_content_provider<F>(&mut self, length: usize, content_type: &str, provider: F)
    where
        F: FnMut(usize, usize) -> Option<Bytes> + Send + 'static,
    {
        self.body = Bytes::new();
        self.content = Some(ContentSource {
            length,
            provider: Box::new(provider),
        });
        self.headers.set("Content-Type", content_type);
    }

    /// Turns the response into a redirect to `url` (`302 Found` unless a 3xx code is given).
    pub fn set_redirect(&mut self, url: &str, status: Option<u16>) {
        self.status = status
            .filter(|s| (300..400).contains(s))
            .unwrap_or(StatusCode::Found.as_u16());
        self.headers.set("Location", url);
    }

    /// Marks the connection for closing once this response has been written.
    pub fn close_connection(&mut self) {
        self.keep_alive = false;
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    /// The `n`-th value of header `name`, or `""` if there is none.
    pub fn header_value(&self, name: &str, n: usize) -> &str {
        self.headers.get_nth(name, n).unwrap_or_default()
    }

    pub fn header_value_count(&self, name: &str) -> usize {
        self.headers.count(name)
    }

    /// The buffered body; empty when a content provider is set.
    pub fn content(&self) -> &Bytes {
        &self.body
    }

    /// The body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn has_content_provider(&self) -> bool {
        self.content.is_some()
    }

    pub(crate) fn take_content(&mut self) -> Option<ContentSource> {
        self.content.take()
    }

    pub(crate) fn merge_missing_headers(&mut self, from: &Headers) {
        for (name, value) in from.iter() {
            if !self.headers.contains(name) {
                self.headers.insert(name, value);
            }
        }
    }

    pub(crate) fn from_wire(status: u16, version: u8, headers: Headers, body: Bytes) -> Self {
        let keep_alive = if headers.has_token("connection", "close") {
            false
        } else {
            version == 1 || headers.has_token("connection", "keep-alive")
        };
        Self {
            status,
            version,
            headers,
            body,
            content: None,
            keep_alive,
        }
    }

    /// Serializes the status line and headers using HTTP/1.x wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Connection: keep-alive` or `Connection: close`.
    /// - `Content-Length: <n>` (always written, last).
    ///
    /// Handler-set `Content-Length`, `Connection` and `Transfer-Encoding` headers
    /// are dropped since the framing is decided here.
    pub(crate) fn encode_head(&self, version: u8, content_length: usize, keep_alive: bool) -> BytesMut {
        let estimated_size = 128 + self.headers.len() * 64;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.{} {} {}\r\n",
                version,
                self.status,
                StatusCode::reason_for(self.status)
            )
            .as_bytes(),
        );

        // Headers
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("connection")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        if content_length > 0 && !self.headers.contains("content-type") {
            buf.put(&b"Content-Type: text/plain; charset=utf-8\r\n"[..]);
        }

        let connection = if keep_alive { "keep-alive" } else { "close" };
        buf.put(format!("Connection: {connection}\r\n").as_bytes());

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
