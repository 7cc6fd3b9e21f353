//! Request routing: map an HTTP method and path to a handler.
//!
//! Patterns are regular expressions that must match the **whole** path;
//! `/users` never matches `/users/42` unless the pattern says so. Each
//! parenthesized group becomes a capture, delivered to the handler in
//! left-to-right order.
//!
//! | Pattern              | Path          | Captures       |
//! |----------------------|---------------|----------------|
//! | `/hello`             | `/hello`      | *(none)*       |
//! | `/numbers/(\d+)`     | `/numbers/42` | `["42"]`       |
//! | `/(\w+)/(\d+)`       | `/posts/7`    | `["posts", "7"]` |
//!
//! Routes are matched in registration order; the first route whose pattern
//! matches wins. Literal patterns (no regex metacharacters) are looked up in
//! a hash map, but a regex route registered before a literal one still takes
//! precedence over it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::context::Context;
use crate::http::{Method, Response};

/// Error a handler may return; the server turns it into a `500` response.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What every handler resolves to.
pub type HandlerResult = Result<Response, HandlerError>;

/// Boxed future returned by a type-erased [`Handler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Type-erased, heap-allocated async handler that processes a [`Context`].
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be shared across
/// connection tasks without copying the underlying closure. In practice you
/// never construct this type directly; register closures through
/// [`Router::add`] or the method helpers instead.
pub type Handler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync + 'static>;

/// Erases the concrete type of an async handler closure.
pub fn handler<H, F>(f: H) -> Handler
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Errors raised while building a route table.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid pattern {pattern:?} for {method}: {source}")]
    InvalidPattern {
        method: Method,
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },

    #[error("routes cannot be registered for {0}")]
    UnroutableMethod(Method),
}

/// The handler chosen for a request, with the captures of its pattern.
#[derive(Clone)]
pub struct RouteMatch {
    pub handler: Handler,
    pub captures: Vec<String>,
}

impl std::fmt::Debug for RouteMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteMatch")
            .field("captures", &self.captures)
            .finish_non_exhaustive()
    }
}

// A single registered route: the original pattern, its anchored regex, and
// whether it is a plain literal that lives in the hash index.
struct Route {
    regex: Regex,
    literal: bool,
    handler: Handler,
}

#[derive(Default)]
struct MethodTable {
    routes: Vec<Route>,
    // Literal pattern -> index of its first registration.
    literals: HashMap<String, usize>,
}

impl MethodTable {
    fn find(&self, path: &str) -> Option<RouteMatch> {
        let literal = self.literals.get(path).copied();
        let limit = literal.unwrap_or(self.routes.len());

        for route in self.routes[..limit].iter().filter(|r| !r.literal) {
            if let Some(caps) = route.regex.captures(path) {
                let captures = caps
                    .iter()
                    .skip(1)
                    .map(|m| m.map_or_else(String::new, |m| m.as_str().to_owned()))
                    .collect();
                return Some(RouteMatch {
                    handler: Arc::clone(&route.handler),
                    captures,
                });
            }
        }

        literal.map(|i| RouteMatch {
            handler: Arc::clone(&self.routes[i].handler),
            captures: Vec::new(),
        })
    }
}

/// Ordered, per-method route table.
///
/// Built once before serving and only read afterwards, so lookups from
/// many connection tasks need no locking.
///
/// # Examples
///
/// ```rust
/// use weblink::http::{Method, Response, StatusCode};
/// use weblink::router::Router;
///
/// let mut router = Router::new();
/// router
///     .add(Method::Get, r"/numbers/(\d+)", |ctx| async move {
///         let n = ctx.capture(0).unwrap_or_default().to_owned();
///         Ok(Response::new(StatusCode::Ok).body(n))
///     })
///     .unwrap();
///
/// let hit = router.find(&Method::Get, "/numbers/42").unwrap();
/// assert_eq!(hit.captures, vec!["42".to_owned()]);
/// assert!(router.find(&Method::Get, "/numbers/abc").is_none());
/// ```
#[derive(Default)]
pub struct Router {
    tables: HashMap<Method, MethodTable>,
    len: usize,
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method` requests whose path fully matches `pattern`.
    ///
    /// # Arguments
    ///
    /// - `method`: one of GET, POST, PUT, PATCH, DELETE, OPTIONS. `HEAD`
    ///   requests are served by the GET routes.
    /// - `pattern`: a regular expression matched against the whole path.
    /// - `handler`: async function receiving a [`Context`].
    ///
    /// # Errors
    ///
    /// [`RouteError::InvalidPattern`] if `pattern` does not compile, and
    /// [`RouteError::UnroutableMethod`] for any other method.
    pub fn add<H, F>(&mut self, method: Method, pattern: &str, handler: H) -> Result<(), RouteError>
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(method, pattern, self::handler(handler))
    }

    /// Like [`add`](Self::add) for an already type-erased [`Handler`].
    pub fn add_handler(&mut self, method: Method, pattern: &str, handler: Handler) -> Result<(), RouteError> {
        if !is_routable(&method) {
            return Err(RouteError::UnroutableMethod(method));
        }
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| RouteError::InvalidPattern {
            method: method.clone(),
            pattern: pattern.to_owned(),
            source: Box::new(e),
        })?;
        let literal = regex::escape(pattern) == pattern;

        let table = self.tables.entry(method).or_default();
        if literal {
            table
                .literals
                .entry(pattern.to_owned())
                .or_insert(table.routes.len());
        }
        table.routes.push(Route {
            regex,
            literal,
            handler,
        });
        self.len += 1;
        Ok(())
    }

    /// Register a handler for `GET` (and `HEAD`) requests matching `pattern`.
    pub fn get<H, F>(&mut self, pattern: &str, handler: H) -> Result<(), RouteError>
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add(Method::Get, pattern, handler)
    }

    /// Register a handler for `POST` requests matching `pattern`.
    pub fn post<H, F>(&mut self, pattern: &str, handler: H) -> Result<(), RouteError>
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add(Method::Post, pattern, handler)
    }

    /// Finds the first route for `method` whose pattern matches all of `path`.
    ///
    /// Unknown methods and unmatched paths both yield `None`.
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let method = match method {
            Method::Head => &Method::Get,
            other => other,
        };
        self.tables.get(method)?.find(path)
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn is_routable(method: &Method) -> bool {
    matches!(
        method,
        Method::Get | Method::Post | Method::Put | Method::Patch | Method::Delete | Method::Options
    )
}
