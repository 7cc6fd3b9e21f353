//! HTTP/1.1 request model and head parsing using the [`httparse`] crate.

use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method, MultipartFormData, Params, multipart};

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {value:?}")]
    InvalidContentLength { value: String },
}

/// A fully received HTTP/1.1 request.
///
/// The head is produced by [`Request::parse`]; the codec then attaches the
/// body, which also decodes form and multipart payloads. Routing adds the
/// capture groups of the matched pattern. After that the request is only
/// ever seen through shared references.
///
/// # Examples
///
/// ```
/// use weblink::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.param("name"), Some("world"));
/// assert_eq!(request.header("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
    params: Params,
    captures: Vec<String>,
    files: Vec<MultipartFormData>,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Builds a request by hand, e.g. for tests or for the client logger.
    ///
    /// `target` may carry a query string, which is decoded into the parameters.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        let params = query.as_deref().map(Params::parse).unwrap_or_default();
        Self {
            method,
            path,
            version: 1,
            headers: Headers::new(),
            query,
            body: Bytes::new(),
            params,
            captures: Vec::new(),
            files: Vec::new(),
            remote_addr: None,
            local_addr: None,
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the body, decoding form payloads according to `Content-Type`.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.attach_body(body.into());
        self
    }

    /// Parse a raw HTTP/1.1 request head from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf` (i.e. immediately after the `\r\n\r\n` header terminator). The
    /// body itself is not attached.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw_req.method {
            Some(m) => m.parse().unwrap_or_else(|never| match never {}),
            None => return Err(RequestError::MissingField { field: "method" }),
        };

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let mut request = Self::new(method, raw_path);
        request.version = version;
        request.headers = header_map;
        Ok((request, body_offset))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of header `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
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

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Decoded query parameters, followed by form fields from an
    /// `application/x-www-form-urlencoded` body.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// First value of parameter `key`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.params.contains(key)
    }

    /// The `n`-th value of parameter `key`, or `""` if there is none.
    pub fn param_value(&self, key: &str, n: usize) -> &str {
        self.params.get_nth(key, n).unwrap_or_default()
    }

    pub fn param_value_count(&self, key: &str) -> usize {
        self.params.count(key)
    }

    /// Capture groups of the matched route pattern, left to right.
    ///
    /// Groups that did not participate in the match are empty strings.
    pub fn captures(&self) -> &[String] {
        &self.captures
    }

    /// Capture group `index` (zero-based), if the pattern has that many groups.
    pub fn capture(&self, index: usize) -> Option<&str> {
        self.captures.get(index).map(String::as_str)
    }

    /// Parts of a `multipart/form-data` body.
    pub fn files(&self) -> &[MultipartFormData] {
        &self.files
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.files.iter().any(|f| f.name == name)
    }

    /// First multipart item named `name`.
    pub fn file(&self, name: &str) -> Option<&MultipartFormData> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Address of the peer that sent the request, when it came off a socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.remote_addr.map(|a| a.port())
    }

    /// Local address the request was received on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr.map(|a| a.port())
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            false
        } else if self.headers.has_token("connection", "keep-alive") {
            true
        } else {
            self.version == 1
        }
    }

    /// Returns the value of the `Content-Length` header.
    ///
    /// `Ok(None)` when absent; an error when present but not a number.
    pub fn content_length(&self) -> Result<Option<usize>, RequestError> {
        match self.headers.get("content-length") {
            None => Ok(None),
            Some(v) => v
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| RequestError::InvalidContentLength {
                    value: v.to_owned(),
                }),
        }
    }

    /// Returns `true` when the body uses chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("transfer-encoding", "chunked")
    }

    pub(crate) fn attach_body(&mut self, body: Bytes) {
        let content_type = self.headers.get("content-type").unwrap_or_default();
        if content_type
            .split(';')
            .next()
            .is_some_and(|t| t.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        {
            self.params
                .extend_from_query(&String::from_utf8_lossy(&body));
        } else if let Some(boundary) = multipart::boundary(content_type) {
            self.files = multipart::parse(&body, boundary);
        }
        self.body = body;
    }

    pub(crate) fn set_captures(&mut self, captures: Vec<String>) {
        self.captures = captures;
    }

    pub(crate) fn set_addrs(&mut self, remote: Option<SocketAddr>, local: Option<SocketAddr>) {
        self.remote_addr = remote;
        self.local_addr = local;
    }
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    }
}
