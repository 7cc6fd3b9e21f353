//! Per-request context handed to route handlers.

use std::sync::Arc;

use bytes::Bytes;

use crate::http::Request;

/// What a handler gets to look at: the routed request, shared with the
/// connection so hooks that run after the handler still see it.
///
/// # Examples
///
/// ```
/// use weblink::context::Context;
/// use weblink::http::{Method, Request};
///
/// let ctx = Context::new(Request::new(Method::Get, "/search?q=rust"));
/// assert_eq!(ctx.param("q"), Some("rust"));
/// assert_eq!(ctx.capture(0), None);
/// ```
#[derive(Debug, Clone)]
pub struct Context {
    request: Arc<Request>,
}

impl Context {
    pub fn new(request: impl Into<Arc<Request>>) -> Self {
        Self {
            request: request.into(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Capture groups of the matched pattern, left to right.
    pub fn captures(&self) -> &[String] {
        self.request.captures()
    }

    /// The `index`-th capture group (zero-based).
    pub fn capture(&self, index: usize) -> Option<&str> {
        self.request.capture(index)
    }

    /// First query or form parameter named `key`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.request.param(key)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }

    pub fn body(&self) -> &Bytes {
        self.request.body()
    }

    /// Deserializes the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}
